//! Errors that stop the gateway.
//!
//! Everything here happens at startup or shutdown. Failures while running
//! are handled where they occur and only logged.

use thiserror::Error;

use crate::config::ConfigError;
use crate::fanout::SinkError;

/// Result type alias using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Logging or Zenoh setup from the common crate.
    #[error(transparent)]
    Common(#[from] fieldgate_common::Error),

    #[error("Zenoh session error: {0}")]
    Zenoh(String),

    #[error("Time-series store setup failed: {0}")]
    Store(#[from] SinkError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<zenoh::Error> for GatewayError {
    fn from(err: zenoh::Error) -> Self {
        Self::Zenoh(err.to_string())
    }
}
