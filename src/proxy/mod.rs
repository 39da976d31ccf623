//! Local proxy server
//!
//! Provides:
//! - [`ProxyServer`], the accept loop that pairs every local connection with a
//!   freshly dialed remote channel
//! - [`ShutdownSignal`], the one-shot stop request observed by the accept loop

mod server;
mod shutdown;

pub use server::ProxyServer;
pub use shutdown::ShutdownSignal;

use crate::config::ConfigError;
use crate::transport::TransportError;
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
