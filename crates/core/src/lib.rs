pub mod config;
pub mod error;
pub mod logging;

pub use config::{BridgeConfig, Config, LoggingConfig};
pub use error::{Error, ExecutionErrorKind, Result};
