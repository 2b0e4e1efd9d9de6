pub mod config;
pub mod error;
pub mod trace;

pub use config::{Config, ConfigError, ConfigSeverity};
pub use error::{Error, ErrorKind, Result};
