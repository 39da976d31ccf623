//! Accept loop and per-connection sessions

use super::{ProxyError, ShutdownSignal};
use crate::config::TunnelConfig;
use crate::transport::{dialer_for, Dialer, SocketProtector};
use crate::tunnel::{pump_for, PumpOptions, SessionCloser};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so a persistent error (fd exhaustion) does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Local TCP listener feeding the tunnel
pub struct ProxyServer {
    listener: TcpListener,
    dialer: Arc<dyn Dialer>,
    options: PumpOptions,
}

impl ProxyServer {
    /// Validate the configuration, build the dialer and bind the listener
    pub async fn bind(
        config: &TunnelConfig,
        protector: Arc<dyn SocketProtector>,
    ) -> Result<Self, ProxyError> {
        config.validate()?;
        let addr = config.listen_socket_addr()?;
        let dialer = dialer_for(config, protector)?;
        let options = PumpOptions::new(config.mtu, config.local_read_timeout());

        Self::bind_with_dialer(addr, dialer, options).await
    }

    /// Bind with an explicit dialer
    pub async fn bind_with_dialer(
        addr: SocketAddr,
        dialer: Arc<dyn Dialer>,
        options: PumpOptions,
    ) -> Result<Self, ProxyError> {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) if is_ipv6_wildcard(&addr) && e.kind() != ErrorKind::AddrInUse => {
                let fallback = SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port()));
                warn!("Could not bind {} ({}), falling back to {}", addr, e, fallback);
                TcpListener::bind(fallback)
                    .await
                    .map_err(|source| ProxyError::Bind {
                        addr: fallback.to_string(),
                        source,
                    })?
            }
            Err(source) => {
                return Err(ProxyError::Bind {
                    addr: addr.to_string(),
                    source,
                })
            }
        };
        info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            dialer,
            options,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires
    ///
    /// The listener is closed on return; sessions already spawned keep running.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), ProxyError> {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.fired() => {
                    info!("Closing listener");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("New connection from {}", peer);
                        let session = Session {
                            local: stream,
                            peer,
                            dialer: self.dialer.clone(),
                            options: self.options,
                        };
                        tokio::spawn(session.run());
                    }
                    Err(e) => {
                        error!("Could not accept the connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(self.listener);
        Ok(())
    }
}

fn is_ipv6_wildcard(addr: &SocketAddr) -> bool {
    addr.is_ipv6() && addr.ip().is_unspecified()
}

/// One local connection and the remote channel dialed for it
struct Session {
    local: TcpStream,
    peer: SocketAddr,
    dialer: Arc<dyn Dialer>,
    options: PumpOptions,
}

impl Session {
    async fn run(self) {
        self.local.set_nodelay(true).ok();
        let closer = SessionCloser::new();

        let remote = match self.dialer.dial(closer.token()).await {
            Ok(remote) => remote,
            Err(e) => {
                error!("{} - Remote server connection > error while dialing: {}", self.peer, e);
                return;
            }
        };

        debug!("{} - Starting {} pump", self.peer, remote.kind());
        match pump_for(self.local, remote, self.options, closer).run().await {
            Ok(stats) => info!(
                "{} - Session closed ({} bytes sent, {} bytes received)",
                self.peer, stats.sent, stats.received
            ),
            Err(e) => error!("{} - Session failed: {}", self.peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigError, TunnelType};
    use crate::transport::{RawDescriptor, RemoteChannel, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;

    struct FailingDialer {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for FailingDialer {
        async fn dial(&self, _cancel: &CancellationToken) -> Result<RemoteChannel, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::HandshakeStatus(404))
        }
    }

    fn noop_protector() -> Arc<dyn SocketProtector> {
        Arc::new(|_fd: RawDescriptor| {})
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let config = TunnelConfig::new(addr.to_string(), "wss://example.com/", TunnelType::WebSocket);
        let result = ProxyServer::bind(&config, noop_protector()).await;
        assert!(matches!(result, Err(ProxyError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_port_shorthand_accepts_both_families() {
        let config = TunnelConfig::new(":0", "ws://127.0.0.1:9/", TunnelType::WebSocket);
        let server = ProxyServer::bind(&config, noop_protector()).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_unspecified());

        TcpStream::connect((Ipv4Addr::LOCALHOST, addr.port())).await.unwrap();
        if addr.is_ipv6() {
            TcpStream::connect((std::net::Ipv6Addr::LOCALHOST, addr.port()))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = TunnelConfig::new("127.0.0.1:0", "", TunnelType::Tls);
        let result = ProxyServer::bind(&config, noop_protector()).await;
        assert!(matches!(
            result,
            Err(ProxyError::Config(ConfigError::MissingRemoteAddress))
        ));
    }

    #[tokio::test]
    async fn test_dial_failure_closes_local() {
        let dialer = Arc::new(FailingDialer {
            attempts: AtomicUsize::new(0),
        });
        let server = ProxyServer::bind_with_dialer(
            "127.0.0.1:0".parse().unwrap(),
            dialer.clone(),
            PumpOptions::new(1500, None),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();
        let running = tokio::spawn(server.run(shutdown.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 1);

        shutdown.fire();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener() {
        let dialer = Arc::new(FailingDialer {
            attempts: AtomicUsize::new(0),
        });
        let server = ProxyServer::bind_with_dialer(
            "127.0.0.1:0".parse().unwrap(),
            dialer,
            PumpOptions::new(1500, None),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();
        let running = tokio::spawn(server.run(shutdown.clone()));

        shutdown.fire();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }
}
