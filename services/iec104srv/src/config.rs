//! Server configuration
//!
//! Values are layered with figment: built-in defaults, then an optional YAML
//! file, then `IEC104SRV_` environment variables (`__` separates nested keys,
//! e.g. `IEC104SRV_APCI__K=20`).

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{IecError, IecResult};
use crate::redundancy::ServerMode;

/// Default IEC 104 TCP port
pub const DEFAULT_PORT: u16 = 2404;
/// Static upper bound for `max_open_connections`
pub const MAX_CONNECTIONS_LIMIT: usize = 100;
/// Largest k allowed by the 15 bit sequence space
pub const MAX_WINDOW_SIZE: u16 = 32767;
/// Environment variable prefix
pub const ENV_PREFIX: &str = "IEC104SRV_";

/// APCI link parameters (k, w and the t0..t3 timers)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApciParameters {
    /// Maximum number of unacknowledged sent I-frames
    pub k: u16,
    /// Acknowledge after this many received I-frames
    pub w: u16,
    pub t0_ms: u64,
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t3_ms: u64,
}

impl Default for ApciParameters {
    fn default() -> Self {
        Self {
            k: 12,
            w: 8,
            t0_ms: 10_000,
            t1_ms: 15_000,
            t2_ms: 10_000,
            t3_ms: 20_000,
        }
    }
}

impl ApciParameters {
    pub fn t0(&self) -> Duration {
        Duration::from_millis(self.t0_ms)
    }

    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }

    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }

    pub fn t3(&self) -> Duration {
        Duration::from_millis(self.t3_ms)
    }

    pub fn validate(&self) -> IecResult<()> {
        if self.k == 0 || self.k > MAX_WINDOW_SIZE {
            return Err(IecError::ConfigError(format!(
                "apci.k must be within 1..={}, got {}",
                MAX_WINDOW_SIZE, self.k
            )));
        }
        if self.w == 0 || self.w > self.k {
            return Err(IecError::ConfigError(format!(
                "apci.w must be within 1..=k ({}), got {}",
                self.k, self.w
            )));
        }
        for (name, value) in [
            ("t0_ms", self.t0_ms),
            ("t1_ms", self.t1_ms),
            ("t2_ms", self.t2_ms),
            ("t3_ms", self.t3_ms),
        ] {
            if value == 0 {
                return Err(IecError::ConfigError(format!(
                    "apci.{} must be greater than zero",
                    name
                )));
            }
        }
        if self.t2_ms >= self.t1_ms {
            return Err(IecError::ConfigError(format!(
                "apci.t2_ms ({}) must be less than apci.t1_ms ({})",
                self.t2_ms, self.t1_ms
            )));
        }
        Ok(())
    }
}

/// Application layer field sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppLayerParameters {
    /// Cause of transmission octets (2 carries the originator address)
    pub size_of_cot: u8,
    /// Common address octets
    pub size_of_ca: u8,
    /// Information object address octets
    pub size_of_ioa: u8,
    /// Originator address used for ASDUs created by this station
    pub originator_address: u8,
}

impl Default for AppLayerParameters {
    fn default() -> Self {
        Self {
            size_of_cot: 2,
            size_of_ca: 2,
            size_of_ioa: 3,
            originator_address: 0,
        }
    }
}

impl AppLayerParameters {
    /// Type id + VSQ + COT + common address
    pub fn header_len(&self) -> usize {
        2 + usize::from(self.size_of_cot) + usize::from(self.size_of_ca)
    }

    pub fn validate(&self) -> IecResult<()> {
        if !matches!(self.size_of_cot, 1 | 2) {
            return Err(IecError::ConfigError(format!(
                "app_layer.size_of_cot must be 1 or 2, got {}",
                self.size_of_cot
            )));
        }
        if !matches!(self.size_of_ca, 1 | 2) {
            return Err(IecError::ConfigError(format!(
                "app_layer.size_of_ca must be 1 or 2, got {}",
                self.size_of_ca
            )));
        }
        if !(1..=3).contains(&self.size_of_ioa) {
            return Err(IecError::ConfigError(format!(
                "app_layer.size_of_ioa must be within 1..=3, got {}",
                self.size_of_ioa
            )));
        }
        Ok(())
    }
}

/// Complete server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub max_open_connections: usize,
    pub server_mode: ServerMode,
    pub max_low_prio_queue_size: usize,
    pub max_high_prio_queue_size: usize,
    /// Per-connection timer tick
    pub tick_interval_ms: u64,
    pub apci: ApciParameters,
    pub app_layer: AppLayerParameters,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_open_connections: 5,
            server_mode: ServerMode::SingleRedundancyGroup,
            max_low_prio_queue_size: 100,
            max_high_prio_queue_size: 100,
            tick_interval_ms: 100,
            apci: ApciParameters::default(),
            app_layer: AppLayerParameters::default(),
        }
    }
}

impl ServerConfig {
    /// Layered sources without extracting
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load from defaults, the optional YAML file and the environment, then validate
    pub fn load(path: Option<&Path>) -> IecResult<Self> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(IecError::ConfigError(format!(
                    "configuration file {} not found",
                    path.display()
                )));
            }
        }
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> IecResult<Self> {
        let config: ServerConfig = figment
            .extract()
            .map_err(|e| IecError::ConfigError(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> IecResult<()> {
        if self.bind_address.trim().is_empty() {
            return Err(IecError::ConfigError("bind_address must not be empty".into()));
        }
        validate_max_connections(self.max_open_connections)?;
        if self.max_low_prio_queue_size == 0 || self.max_high_prio_queue_size == 0 {
            return Err(IecError::ConfigError(
                "queue sizes must be greater than zero".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(IecError::ConfigError(
                "tick_interval_ms must be greater than zero".into(),
            ));
        }
        self.apci.validate()?;
        self.app_layer.validate()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// `host:port` string handed to the listener
    pub fn listen_address(&self) -> String {
        if self.bind_address.contains(':') && !self.bind_address.starts_with('[') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        }
    }

    pub fn to_yaml(&self) -> IecResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| IecError::ConfigError(format!("Failed to serialize configuration: {}", e)))
    }
}

pub(crate) fn validate_max_connections(value: usize) -> IecResult<()> {
    if value == 0 || value > MAX_CONNECTIONS_LIMIT {
        return Err(IecError::ConfigError(format!(
            "max_open_connections must be within 1..={}, got {}",
            MAX_CONNECTIONS_LIMIT, value
        )));
    }
    Ok(())
}
