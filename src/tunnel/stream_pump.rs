//! Byte-stream pump used by the TLS tunnel

use super::{read_local, Pump, PumpOptions, PumpStats, SessionCloser, TunnelError};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, error};

/// Copies raw bytes between the local connection and a stream remote
pub struct StreamPump<L, R> {
    local: L,
    remote: R,
    options: PumpOptions,
    closer: SessionCloser,
}

impl<L, R> StreamPump<L, R>
where
    L: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(local: L, remote: R, options: PumpOptions, closer: SessionCloser) -> Self {
        Self {
            local,
            remote,
            options,
            closer,
        }
    }
}

#[async_trait]
impl<L, R> Pump for StreamPump<L, R>
where
    L: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(self: Box<Self>) -> Result<PumpStats, TunnelError> {
        let this = *self;
        let (local_read, local_write) = tokio::io::split(this.local);
        let (remote_read, remote_write) = tokio::io::split(this.remote);

        let upload = tokio::spawn(local_to_remote(
            local_read,
            remote_write,
            this.options,
            this.closer.clone(),
        ));

        let received = remote_to_local(remote_read, local_write, this.options, &this.closer).await;
        this.closer.close();

        let sent = upload
            .await
            .map_err(|e| TunnelError::TaskFailed(e.to_string()))?;

        Ok(PumpStats { sent, received })
    }
}

async fn local_to_remote<L, R>(
    mut local: ReadHalf<L>,
    mut remote: WriteHalf<R>,
    options: PumpOptions,
    closer: SessionCloser,
) -> u64
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
    R: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut buf = vec![0u8; options.mtu];
    let mut sent = 0u64;

    loop {
        let read = tokio::select! {
            _ = closer.closed() => break,
            read = read_local(&mut local, &mut buf, options.local_read_timeout) => read,
        };

        let n = match read {
            Ok(Some(0)) => {
                debug!("Local connection closed");
                break;
            }
            Ok(Some(n)) => n,
            Ok(None) => continue,
            Err(e) => {
                error!("Local to remote - error while reading from local: {}", e);
                break;
            }
        };

        let written = tokio::select! {
            _ = closer.closed() => break,
            written = remote.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            error!("Local to remote - error while writing to remote: {}", e);
            break;
        }
        sent += n as u64;
    }

    closer.close();
    remote.shutdown().await.ok();
    sent
}

async fn remote_to_local<L, R>(
    mut remote: ReadHalf<R>,
    mut local: WriteHalf<L>,
    options: PumpOptions,
    closer: &SessionCloser,
) -> u64
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
    R: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut buf = vec![0u8; options.mtu];
    let mut received = 0u64;

    loop {
        let read = tokio::select! {
            _ = closer.closed() => break,
            read = remote.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                debug!("Remote connection closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!("Remote to local - error while reading from remote: {}", e);
                break;
            }
        };

        let written = tokio::select! {
            _ = closer.closed() => break,
            written = local.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            error!("Remote to local - error while writing to local: {}", e);
            break;
        }
        received += n as u64;
    }

    local.shutdown().await.ok();
    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_pump_copies_both_ways() {
        let (local_app, local_end) = duplex(64 * 1024);
        let (remote_end, remote_server) = duplex(64 * 1024);

        let pump: Box<dyn Pump> = Box::new(StreamPump::new(
            local_end,
            remote_end,
            PumpOptions::new(1500, Some(Duration::from_secs(10))),
            SessionCloser::new(),
        ));
        let running = tokio::spawn(pump.run());

        let (mut app_read, mut app_write) = tokio::io::split(local_app);
        let (mut server_read, mut server_write) = tokio::io::split(remote_server);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        app_write.write_all(&payload).await.unwrap();
        let mut upstream = vec![0u8; payload.len()];
        server_read.read_exact(&mut upstream).await.unwrap();
        assert_eq!(upstream, payload);

        server_write.write_all(b"pong").await.unwrap();
        let mut downstream = [0u8; 4];
        app_read.read_exact(&mut downstream).await.unwrap();
        assert_eq!(&downstream, b"pong");

        // Remote hangs up; the pump must stop and report the byte counts
        drop(server_write);
        drop(server_read);
        let stats = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats, PumpStats { sent: 5000, received: 4 });
    }

    #[tokio::test]
    async fn test_local_eof_closes_remote() {
        let (local_app, local_end) = duplex(1024);
        let (remote_end, mut remote_server) = duplex(1024);
        let closer = SessionCloser::new();

        let pump: Box<dyn Pump> = Box::new(StreamPump::new(
            local_end,
            remote_end,
            PumpOptions::new(1500, None),
            closer.clone(),
        ));
        let running = tokio::spawn(pump.run());

        drop(local_app);

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), remote_server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn test_idle_local_keeps_session_open() {
        let (local_app, local_end) = duplex(1024);
        let (remote_end, remote_server) = duplex(1024);

        let pump: Box<dyn Pump> = Box::new(StreamPump::new(
            local_end,
            remote_end,
            PumpOptions::new(1500, Some(Duration::from_millis(50))),
            SessionCloser::new(),
        ));
        let running = tokio::spawn(pump.run());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!running.is_finished());

        let (_app_read, mut app_write) = tokio::io::split(local_app);
        let (mut server_read, _server_write) = tokio::io::split(remote_server);
        app_write.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        server_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");

        running.abort();
    }
}
