//! fieldgate common library
//!
//! Shared types and utilities for the fieldgate Modbus gateway:
//!
//! - [`config`] - Configuration primitives and JSON5 loading
//! - [`session`] - Zenoh session management
//! - [`topic`] - Data topic builders and parsers
//! - [`status`] - Bridge status messages
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod session;
pub mod status;
pub mod topic;

pub use config::{LogFormat, LoggingConfig, ZenohConfig, ZenohMode};
pub use error::{Error, Result};
pub use session::connect;
pub use status::BridgeStatus;
pub use topic::{DEFAULT_PREFIX, DataTopic, TopicBuilder, parse_data_topic};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
///
/// # Example
///
/// ```ignore
/// use fieldgate_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
