//! Tunnel layer - bidirectional pumps between the local client and the remote
//!
//! Provides:
//! - [`StreamPump`] for byte-stream remotes (TLS)
//! - [`MessagePump`] for message-framed remotes (WebSocket, one binary message per read)
//! - [`SessionCloser`], the once-only close shared by both directions
//!
//! Both pumps run the local→remote direction on a spawned task and the
//! remote→local direction on the caller's task. Whichever direction stops
//! first closes the session, which stops the other one.

mod message_pump;
mod stream_pump;

pub use message_pump::{MessagePump, CLOSE_FRAME_DEADLINE};
pub use stream_pump::StreamPump;

use crate::transport::RemoteChannel;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pump task failed: {0}")]
    TaskFailed(String),
}

/// Bytes moved by a finished pump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Local to remote
    pub sent: u64,
    /// Remote to local
    pub received: u64,
}

/// Per-session pump settings
#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    /// Read buffer size
    pub mtu: usize,
    /// Idle deadline for local reads, refreshed before every read
    pub local_read_timeout: Option<Duration>,
}

impl PumpOptions {
    pub fn new(mtu: usize, local_read_timeout: Option<Duration>) -> Self {
        Self {
            mtu: mtu.max(1),
            local_read_timeout,
        }
    }
}

/// A bidirectional copy between a local connection and a remote channel
#[async_trait]
pub trait Pump: Send {
    /// Run until either direction stops, then close both sides
    async fn run(self: Box<Self>) -> Result<PumpStats, TunnelError>;
}

/// Once-only close signal shared by the two directions of a session
#[derive(Debug, Clone, Default)]
pub struct SessionCloser {
    token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl SessionCloser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the session; returns `true` only for the call that closed it
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.token.cancel();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    /// Token cancelled on close, for operations that take one
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Pick the pump matching the remote channel
pub fn pump_for<L>(
    local: L,
    remote: RemoteChannel,
    options: PumpOptions,
    closer: SessionCloser,
) -> Box<dyn Pump>
where
    L: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match remote {
        RemoteChannel::Tls(stream) => Box::new(StreamPump::new(local, stream, options, closer)),
        RemoteChannel::WebSocket(stream) => {
            Box::new(MessagePump::new(local, stream, options, closer))
        }
    }
}

/// Read from the local side, `Ok(None)` when the idle deadline passes
pub(crate) async fn read_local<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> std::io::Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        },
        None => reader.read(buf).await.map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_idempotent() {
        let closer = SessionCloser::new();
        let other = closer.clone();

        assert!(!closer.is_closed());
        assert!(closer.close());
        assert!(!other.close());
        assert!(!closer.close());
        assert!(other.is_closed());
        assert!(other.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_close_fires_once() {
        let closer = SessionCloser::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let closer = closer.clone();
                tokio::spawn(async move { closer.close() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        closer.closed().await;
    }

    #[tokio::test]
    async fn test_read_local_timeout_is_not_fatal() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut buf = [0u8; 16];

        let idle = read_local(&mut server, &mut buf, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(idle, None);

        tokio::io::AsyncWriteExt::write_all(&mut client, b"late").await.unwrap();
        let n = read_local(&mut server, &mut buf, Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(n, Some(4));
        assert_eq!(&buf[..4], b"late");
    }

    #[test]
    fn test_pump_options_clamp_mtu() {
        assert_eq!(PumpOptions::new(0, None).mtu, 1);
        assert_eq!(PumpOptions::new(1500, None).mtu, 1500);
    }
}
