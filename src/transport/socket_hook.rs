//! Outbound socket creation with a pre-connect hook
//!
//! Hosts running the proxy inside a VPN must exclude the proxy's own outbound
//! sockets from the tunnel (Android `VpnService.protect`, per-socket routing
//! marks on desktop). [`ProtectedDialer`] creates each socket itself, hands the
//! raw descriptor to the host's [`SocketProtector`] and only then connects.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

/// Platform raw socket handle passed to the protector
#[cfg(unix)]
pub type RawDescriptor = std::os::unix::io::RawFd;

/// Platform raw socket handle passed to the protector
#[cfg(windows)]
pub type RawDescriptor = std::os::windows::io::RawSocket;

/// Host capability invoked with every outbound socket before it connects
///
/// Implementations run synchronously on the dialing task and must not block.
pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: RawDescriptor);
}

impl<F> SocketProtector for F
where
    F: Fn(RawDescriptor) + Send + Sync,
{
    fn protect(&self, fd: RawDescriptor) {
        self(fd)
    }
}

/// TCP dialer that runs the socket protector before each `connect()`
#[derive(Clone)]
pub struct ProtectedDialer {
    protector: Arc<dyn SocketProtector>,
}

impl ProtectedDialer {
    pub fn new(protector: Arc<dyn SocketProtector>) -> Self {
        Self { protector }
    }

    /// Resolve `host` and connect to the first address that accepts
    ///
    /// Every address tried gets its own socket, and so its own protector call.
    pub async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_error = None;

        for addr in lookup_host((host, port)).await? {
            match self.connect_addr(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("No addresses found for {}", host),
            )
        }))
    }

    /// Connect to a resolved address
    pub async fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        let fd = raw_descriptor(&socket);
        debug!("Received socket fd {}", fd);
        self.protector.protect(fd);

        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}

#[cfg(unix)]
fn raw_descriptor(socket: &TcpSocket) -> RawDescriptor {
    use std::os::unix::io::AsRawFd;
    socket.as_raw_fd()
}

#[cfg(windows)]
fn raw_descriptor(socket: &TcpSocket) -> RawDescriptor {
    use std::os::windows::io::AsRawSocket;
    socket.as_raw_socket()
}
