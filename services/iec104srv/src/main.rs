//! IEC 104 controlled station service (`iec104srv`)

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use iec104srv::{
    log_connection_event, AppLayerParameters, Asdu, CauseOfTransmission, Cp56Time2a, Iec104Server,
    MasterConnection, ServerConfig, TypeId,
};

/// Information object address of the demo measurement
const DEMO_IOA: u32 = 1001;

#[derive(Parser, Debug)]
#[command(name = "iec104srv")]
#[command(about = "IEC 60870-5-104 controlled station")]
#[command(version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "IEC104SRV_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Override the bind address
    #[arg(short = 'b', long)]
    bind: Option<String>,

    /// Override the listening port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Directory for rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    dump_config: bool,

    /// Publish a spontaneous demo measurement every N seconds (0 = off)
    #[arg(long, default_value_t = 0)]
    publish_interval: u64,
}

/// Demo process image: one floating point measurement
#[derive(Default)]
struct DemoProcess {
    value_bits: AtomicU32,
}

impl DemoProcess {
    fn value(&self) -> f32 {
        f32::from_bits(self.value_bits.load(Ordering::Relaxed))
    }

    fn advance(&self) -> f32 {
        let next = (self.value() + 0.5) % 100.0;
        self.value_bits.store(next.to_bits(), Ordering::Relaxed);
        next
    }

    fn measurement(
        &self,
        cause: CauseOfTransmission,
        common_address: u16,
        params: &AppLayerParameters,
    ) -> Result<Asdu> {
        let mut element = self.value().to_le_bytes().to_vec();
        element.push(0); // QDS: good
        let mut asdu = Asdu::new(TypeId::MeasuredFloat, cause, common_address)
            .with_originator(params.originator_address);
        asdu.push_object(DEMO_IOA, &element, params)?;
        Ok(asdu)
    }
}

fn install_demo_handlers(server: &Iec104Server, process: Arc<DemoProcess>) {
    let params = *server.dispatcher().app_layer();

    let gi_process = process.clone();
    server.set_interrogation_handler(move |conn: &MasterConnection, asdu: &Asdu, qoi: u8| {
        let cause = match qoi {
            20 => CauseOfTransmission::InterrogatedByStation,
            21..=36 => CauseOfTransmission::InterrogatedByGroup(qoi - 20),
            _ => return false,
        };
        info!("Interrogation (QOI {}) from {}", qoi, conn);
        conn.send_act_con(asdu, false);
        match gi_process.measurement(cause, asdu.common_address(), &params) {
            Ok(reply) => {
                conn.send_asdu(reply);
            },
            Err(e) => warn!("Failed to build interrogation reply: {}", e),
        }
        conn.send_act_term(asdu);
        true
    });

    let read_process = process;
    server.set_read_handler(move |conn: &MasterConnection, asdu: &Asdu, ioa: u32| {
        if ioa != DEMO_IOA {
            return false;
        }
        match read_process.measurement(CauseOfTransmission::Request, asdu.common_address(), &params)
        {
            Ok(reply) => conn.send_asdu(reply),
            Err(e) => {
                warn!("Failed to build read reply: {}", e);
                false
            },
        }
    });

    server.set_clock_sync_handler(|conn: &MasterConnection, asdu: &Asdu, time: Cp56Time2a| {
        match time.to_datetime() {
            Some(time) => info!("Clock synchronisation from {}: {}", conn, time),
            None => warn!("Clock synchronisation from {} with invalid time", conn),
        }
        conn.send_act_con(asdu, false);
        true
    });

    server.set_reset_process_handler(|conn: &MasterConnection, asdu: &Asdu, qrp: u8| {
        info!("Reset process (QRP {}) requested by {}", qrp, conn);
        conn.send_act_con(asdu, false);
        true
    });

    server.set_connection_event_handler(log_connection_event);
}

fn spawn_publisher(
    server: Arc<Iec104Server>,
    process: Arc<DemoProcess>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let params = *server.dispatcher().app_layer();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    process.advance();
                    let result = process
                        .measurement(CauseOfTransmission::Spontaneous, 1, &params)
                        .and_then(|asdu| server.enqueue_asdu(asdu).map_err(Into::into));
                    if let Err(e) = result {
                        warn!("Failed to publish demo measurement: {}", e);
                    }
                }
            }
        }
    })
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(bind) = &args.bind {
        config.bind_address = bind.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut log_config = common::LogConfig::new("iec104srv");
    log_config.level = common::parse_level(&args.log_level);
    log_config.log_dir = args.log_dir.clone();
    log_config.ansi = !args.no_color;
    let _log_guard = common::init_with_config(&log_config).context("Failed to initialize logging")?;

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            return Err(e);
        },
    };

    if args.dump_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let server = Arc::new(Iec104Server::new(config));
    let process = Arc::new(DemoProcess::default());
    install_demo_handlers(&server, process.clone());

    let addr = server
        .start()
        .await
        .context("Failed to start IEC 104 server")?;
    info!("iec104srv ready on {}", addr);

    let shutdown = CancellationToken::new();
    let signal_task = common::cancel_on_shutdown(shutdown.clone());
    let publisher = (args.publish_interval > 0).then(|| {
        spawn_publisher(
            server.clone(),
            process,
            Duration::from_secs(args.publish_interval),
            shutdown.clone(),
        )
    });

    shutdown.cancelled().await;

    if let Some(publisher) = publisher {
        let _ = publisher.await;
    }
    server.stop().await?;
    let _ = signal_task.await;
    info!("iec104srv exited");
    Ok(())
}
