//! WebSocket pump: every local read becomes one binary message
//!
//! The remote must only send binary messages. A text message, a close frame
//! or a protocol error ends the session. The task owning the sink sends a
//! close frame (bounded by [`CLOSE_FRAME_DEADLINE`]) before it exits.

use super::{read_local, Pump, PumpOptions, PumpStats, SessionCloser, TunnelError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

/// Deadline for the best-effort close frame
pub const CLOSE_FRAME_DEADLINE: Duration = Duration::from_secs(1);

/// Copies bytes between the local connection and a WebSocket remote
pub struct MessagePump<L, S> {
    local: L,
    remote: WebSocketStream<S>,
    options: PumpOptions,
    closer: SessionCloser,
}

impl<L, S> MessagePump<L, S>
where
    L: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(local: L, remote: WebSocketStream<S>, options: PumpOptions, closer: SessionCloser) -> Self {
        Self {
            local,
            remote,
            options,
            closer,
        }
    }
}

#[async_trait]
impl<L, S> Pump for MessagePump<L, S>
where
    L: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(self: Box<Self>) -> Result<PumpStats, TunnelError> {
        let this = *self;
        let (local_read, local_write) = tokio::io::split(this.local);
        let (sink, stream) = this.remote.split();

        let upload = tokio::spawn(local_to_remote(
            local_read,
            sink,
            this.options,
            this.closer.clone(),
        ));

        let received = remote_to_local(stream, local_write, &this.closer).await;
        this.closer.close();

        let sent = upload
            .await
            .map_err(|e| TunnelError::TaskFailed(e.to_string()))?;

        Ok(PumpStats { sent, received })
    }
}

async fn local_to_remote<L, S>(
    mut local: ReadHalf<L>,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    options: PumpOptions,
    closer: SessionCloser,
) -> u64
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
    S: AsyncRead + AsyncWrite + Send + Unpin,
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
                error!("TCPToWS - error while reading from local: {}", e);
                break;
            }
        };

        let written = tokio::select! {
            _ = closer.closed() => break,
            written = sink.send(Message::Binary(buf[..n].to_vec())) => written,
        };
        if let Err(e) = written {
            error!("TCPToWS - error while writing to WS: {}", e);
            break;
        }
        sent += n as u64;
    }

    closer.close();
    send_close_frame(&mut sink).await;
    sent
}

async fn send_close_frame<S>(sink: &mut SplitSink<WebSocketStream<S>, Message>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let closing = async {
        sink.send(Message::Close(None)).await?;
        sink.close().await
    };

    match tokio::time::timeout(CLOSE_FRAME_DEADLINE, closing).await {
        Ok(Ok(())) => debug!("WebSocket close frame sent"),
        Ok(Err(e)) => debug!("WebSocket close frame not sent: {}", e),
        Err(_) => debug!("WebSocket close frame timed out"),
    }
}

async fn remote_to_local<L, S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    mut local: WriteHalf<L>,
    closer: &SessionCloser,
) -> u64
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut received = 0u64;

    loop {
        let message = tokio::select! {
            _ = closer.closed() => break,
            message = stream.next() => message,
        };

        let data = match message {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                info!("WSToTCP - remote closed the WebSocket: {:?}", frame);
                break;
            }
            Some(Ok(other)) => {
                info!("WSToTCP - got wrong message type from WS: {}", message_kind(&other));
                break;
            }
            Some(Err(e)) => {
                error!("WSToTCP - error while reading from WS: {}", e);
                break;
            }
            None => {
                debug!("WSToTCP - WebSocket stream ended");
                break;
            }
        };

        let written = tokio::select! {
            _ = closer.closed() => break,
            written = local.write_all(&data) => written,
        };
        if let Err(e) = written {
            error!("WSToTCP - error while writing to local: {}", e);
            break;
        }
        received += data.len() as u64;
    }

    local.shutdown().await.ok();
    received
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}
