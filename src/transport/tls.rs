//! TLS dialer with a randomized ClientHello
//!
//! Every dial builds a fresh [`ClientHelloSpec`], so consecutive connections
//! to the same server present different fingerprints. The server certificate
//! is not verified.

use super::{host_and_port, Dialer, NoCertificateVerification, ProtectedDialer, RemoteChannel, TransportError};
use crate::config::TunnelConfig;
use crate::obfuscation::{build_client_hello_spec, build_tls_config, HelloProfile};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Split a TLS remote into host and port
///
/// Accepts `https://host:port` (or any scheme with an explicit port) and bare
/// `host:port`, which is read as `https://host:port`.
pub fn parse_tls_remote(remote: &str) -> Result<(String, u16), TransportError> {
    let remote = remote.trim();
    let url = if remote.contains("://") {
        Url::parse(remote)
    } else {
        Url::parse(&format!("https://{}", remote))
    }
    .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", remote, e)))?;

    host_and_port(&url)
}

/// Dials the remote over TLS
pub struct TlsDialer {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    profile: HelloProfile,
    extra_padding: bool,
    handshake_timeout: Option<Duration>,
    socket: ProtectedDialer,
}

impl TlsDialer {
    pub fn new(
        remote: &str,
        profile: HelloProfile,
        extra_padding: bool,
        socket: ProtectedDialer,
    ) -> Result<Self, TransportError> {
        let (host, port) = parse_tls_remote(remote)?;
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| TransportError::Tls(format!("Invalid server name: {}", e)))?;

        Ok(Self {
            host,
            port,
            server_name,
            profile,
            extra_padding,
            handshake_timeout: None,
            socket,
        })
    }

    pub fn from_config(config: &TunnelConfig, socket: ProtectedDialer) -> Result<Self, TransportError> {
        Ok(Self::new(
            &config.remote_address,
            config.hello_profile,
            config.extra_padding,
            socket,
        )?
        .with_handshake_timeout(config.handshake_timeout()))
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Connect and complete the TLS handshake
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<TlsStream<TcpStream>, TransportError> {
        let spec = build_client_hello_spec(self.profile, self.extra_padding);
        debug!(
            "ClientHello for {}:{}: profile {:?}, applied JA3 {}, template JA3 {}, template padding {:?} (not sent)",
            self.host,
            self.port,
            self.profile,
            spec.applied_ja3_hash(),
            spec.ja3_hash(),
            spec.padding().filter(|p| p.will_pad).map(|p| p.len)
        );

        let tls_config = build_tls_config(&spec, Arc::new(NoCertificateVerification::new()))
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let connector = TlsConnector::from(Arc::new(tls_config));

        let tcp_stream = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = self.socket.connect(&self.host, self.port) => result?,
        };

        let server_name = self.server_name.clone();
        let handshake = async {
            let result = match self.handshake_timeout {
                Some(limit) => tokio::time::timeout(limit, connector.connect(server_name, tcp_stream))
                    .await
                    .map_err(|_| TransportError::Timeout)?,
                None => connector.connect(server_name, tcp_stream).await,
            };
            result.map_err(|e| TransportError::Tls(e.to_string()))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = handshake => result,
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, cancel: &CancellationToken) -> Result<RemoteChannel, TransportError> {
        Ok(RemoteChannel::Tls(self.connect(cancel).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawDescriptor;
    use tokio::net::TcpListener;

    fn dialer(remote: &str) -> TlsDialer {
        let socket = ProtectedDialer::new(Arc::new(|_fd: RawDescriptor| {}));
        TlsDialer::new(remote, HelloProfile::default(), true, socket).unwrap()
    }

    #[test]
    fn test_parse_tls_remote() {
        assert_eq!(
            parse_tls_remote("https://vpn.example.com:8443").unwrap(),
            ("vpn.example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_tls_remote("10.0.0.1:443").unwrap(),
            ("10.0.0.1".to_string(), 443)
        );
        assert_eq!(
            parse_tls_remote("vpn.example.com").unwrap(),
            ("vpn.example.com".to_string(), 443)
        );
        assert!(parse_tls_remote("https://").is_err());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        // Accepts TCP but never answers the ClientHello
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let dialer = dialer(&addr.to_string()).with_handshake_timeout(Some(Duration::from_millis(200)));
        let result = dialer.connect(&CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        server.abort();
    }

    #[tokio::test]
    async fn test_handshake_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = dialer(&addr.to_string()).connect(&cancel).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
        server.abort();
    }
}
