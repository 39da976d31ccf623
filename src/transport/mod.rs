//! Transport layer implementations
//!
//! Provides the two remote dialers:
//! - TLS with a randomized ClientHello fingerprint
//! - WebSocket (`ws://` / `wss://`) with redirect following
//!
//! Both create their outbound TCP sockets through [`ProtectedDialer`], so the
//! host's [`SocketProtector`] sees every socket before it connects.

mod danger;
mod socket_hook;
mod tls;
mod websocket;

pub use danger::NoCertificateVerification;
pub use socket_hook::{ProtectedDialer, RawDescriptor, SocketProtector};
pub use tls::{parse_tls_remote, TlsDialer};
pub use websocket::{normalize_ws_url, WebSocketDialer, WsStream};

use crate::config::{TunnelConfig, TunnelType};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid remote URL: {0}")]
    InvalidUrl(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Unexpected handshake status: {0}")]
    HandshakeStatus(u16),

    #[error("Bad redirect: {0}")]
    Redirect(String),

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("Timeout")]
    Timeout,

    #[error("Dial cancelled")]
    Cancelled,
}

/// An established connection to the remote server
pub enum RemoteChannel {
    /// Raw byte stream inside TLS
    Tls(TlsStream<TcpStream>),
    /// Message-framed WebSocket session
    WebSocket(WsStream),
}

impl RemoteChannel {
    pub fn kind(&self) -> TunnelType {
        match self {
            Self::Tls(_) => TunnelType::Tls,
            Self::WebSocket(_) => TunnelType::WebSocket,
        }
    }
}

/// Opens remote channels
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial the remote server, giving up early when `cancel` fires
    async fn dial(&self, cancel: &CancellationToken) -> Result<RemoteChannel, TransportError>;
}

/// Build the dialer matching the configured tunnel type
pub fn dialer_for(
    config: &TunnelConfig,
    protector: Arc<dyn SocketProtector>,
) -> Result<Arc<dyn Dialer>, TransportError> {
    let socket = ProtectedDialer::new(protector);

    Ok(match config.tunnel_type {
        TunnelType::WebSocket => Arc::new(WebSocketDialer::from_config(config, socket)?),
        TunnelType::Tls => Arc::new(TlsDialer::from_config(config, socket)?),
    })
}

/// Host (without IPv6 brackets) and port of a URL
pub(crate) fn host_and_port(url: &Url) -> Result<(String, u16), TransportError> {
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl(format!("{} has no host", url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| TransportError::InvalidUrl(format!("{} has no port", url)))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}
