//! # wstunnel-proxy
//!
//! A local TCP proxy that carries VPN client traffic to a remote server,
//! disguised either as a WebSocket session or as a TLS session with a
//! randomized ClientHello fingerprint.
//!
//! ## Features
//!
//! - **WebSocket tunnel**: every local read is sent as one binary message;
//!   HTTP redirects on the opening handshake are followed
//! - **TLS tunnel**: raw byte stream inside TLS, with a fresh ClientHello
//!   fingerprint (and optional large padding) per connection
//! - **Socket protection hook**: the host sees every outbound socket
//!   descriptor before it connects, so it can exclude it from the VPN
//! - **Graceful stop**: the listener closes while live sessions finish
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Host API                          │
//! │     (TunnelEngine: initialise, start, callback)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Proxy Layer                         │
//! │       (accept loop, sessions, shutdown signal)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Tunnel Layer                        │
//! │     (stream pump for TLS, message pump for WS)       │
//! ├─────────────────────────────────────────────────────┤
//! │                Transport Layer                       │
//! │  (TLS dialer, WebSocket dialer, protected sockets)   │
//! ├─────────────────────────────────────────────────────┤
//! │               Obfuscation Layer                      │
//! │       (ClientHello randomization and padding)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod logging;
pub mod obfuscation;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use api::TunnelEngine;
pub use config::{TunnelConfig, TunnelType};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] logging::LoggingError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Proxy is already running")]
    AlreadyRunning,

    #[error("Engine error: {0}")]
    Engine(String),
}
