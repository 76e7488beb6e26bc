//! Basic library shared by the iec104srv services
//!
//! Provides:
//! - logging bootstrap (console + optional rolling file)
//! - shutdown signal handling

pub mod logging;
pub mod shutdown;

pub use logging::{init_with_config, parse_level, LogConfig, LogGuard, LoggingError};
pub use shutdown::{cancel_on_shutdown, wait_for_shutdown, ShutdownSignal};
