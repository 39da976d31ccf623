//! WebSocket dialer
//!
//! Opens a WebSocket session to the remote URL. `http`/`https` URLs are dialed
//! as `ws`/`wss`. When the server answers the opening handshake with a
//! 301/302/303/307/308 redirect, the `Location` target is dialed instead,
//! creating (and protecting) a fresh socket each time. Redirects are followed
//! without limit unless a bound is configured.

use super::{host_and_port, Dialer, ProtectedDialer, RemoteChannel, TransportError};
use crate::config::TunnelConfig;
use async_trait::async_trait;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::LOCATION;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Client WebSocket stream
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

/// Parse a remote URL and map `http`/`https` onto `ws`/`wss`
pub fn normalize_ws_url(remote: &str) -> Result<Url, TransportError> {
    let url = Url::parse(remote.trim())
        .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", remote, e)))?;
    normalize_scheme(url)
}

fn normalize_scheme(mut url: Url) -> Result<Url, TransportError> {
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{}' in {}",
                other, url
            )))
        }
    };

    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidUrl(format!("cannot use {} over {}", url, scheme)))?;
    }
    if url.host_str().is_none() {
        return Err(TransportError::InvalidUrl(format!("{} has no host", url)));
    }

    Ok(url)
}

enum Handshake {
    Connected(WsStream),
    Redirect(String),
}

/// Dials the remote over WebSocket
pub struct WebSocketDialer {
    url: Url,
    max_redirects: Option<usize>,
    tls_config: Arc<ClientConfig>,
    socket: ProtectedDialer,
}

impl WebSocketDialer {
    pub fn new(remote: &str, socket: ProtectedDialer) -> Result<Self, TransportError> {
        Ok(Self {
            url: normalize_ws_url(remote)?,
            max_redirects: None,
            tls_config: Arc::new(web_pki_config()?),
            socket,
        })
    }

    pub fn from_config(config: &TunnelConfig, socket: ProtectedDialer) -> Result<Self, TransportError> {
        Ok(Self::new(&config.remote_address, socket)?.with_max_redirects(config.max_redirects))
    }

    /// Bound the number of redirects followed per dial (`None` for unbounded)
    pub fn with_max_redirects(mut self, max_redirects: Option<usize>) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Connect, following redirects, and complete the opening handshake
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<WsStream, TransportError> {
        let mut url = self.url.clone();
        let mut redirects = 0usize;

        loop {
            info!("Connecting to {}", url);

            match self.handshake(&url, cancel).await? {
                Handshake::Connected(stream) => return Ok(stream),
                Handshake::Redirect(location) => {
                    redirects += 1;
                    if let Some(limit) = self.max_redirects {
                        if redirects > limit {
                            return Err(TransportError::TooManyRedirects(limit));
                        }
                    }

                    let target = url
                        .join(&location)
                        .map_err(|e| TransportError::Redirect(format!("{}: {}", location, e)))?;
                    url = normalize_scheme(target)?;
                    info!("Redirect to {}", url);
                }
            }
        }
    }

    async fn handshake(&self, url: &Url, cancel: &CancellationToken) -> Result<Handshake, TransportError> {
        let (host, port) = host_and_port(url)?;
        let tcp_stream = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = self.socket.connect(&host, port) => result?,
        };

        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let connector = Connector::Rustls(self.tls_config.clone());

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = client_async_tls_with_config(request, tcp_stream, None, Some(connector)) => result,
        };

        match result {
            Ok((stream, response)) => {
                debug!("WebSocket handshake with {} complete, status: {}", url, response.status());
                Ok(Handshake::Connected(stream))
            }
            Err(WsError::Http(response)) => {
                let status = response.status().as_u16();
                if !REDIRECT_STATUSES.contains(&status) {
                    return Err(TransportError::HandshakeStatus(status));
                }

                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| {
                        TransportError::Redirect(format!("status {} without Location header", status))
                    })?;
                Ok(Handshake::Redirect(location.to_string()))
            }
            Err(e) => Err(TransportError::WebSocket(e.to_string())),
        }
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, cancel: &CancellationToken) -> Result<RemoteChannel, TransportError> {
        Ok(RemoteChannel::WebSocket(self.connect(cancel).await?))
    }
}

/// Verifying client configuration for `wss` remotes
fn web_pki_config() -> Result<ClientConfig, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Ok(
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_scheme() {
        assert_eq!(
            normalize_ws_url("https://example.com/tunnel").unwrap().as_str(),
            "wss://example.com/tunnel"
        );
        assert_eq!(
            normalize_ws_url("http://example.com:8080/t").unwrap().as_str(),
            "ws://example.com:8080/t"
        );
        assert_eq!(
            normalize_ws_url("wss://example.com/").unwrap().as_str(),
            "wss://example.com/"
        );
        assert!(matches!(
            normalize_ws_url("ftp://example.com/"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(normalize_ws_url("not a url").is_err());
    }

    #[test]
    fn test_relative_redirect_target() {
        let base = normalize_ws_url("ws://example.com:8080/old/path").unwrap();
        let target = normalize_scheme(base.join("/new").unwrap()).unwrap();
        assert_eq!(target.as_str(), "ws://example.com:8080/new");

        let target = normalize_scheme(base.join("https://other.example.com/x").unwrap()).unwrap();
        assert_eq!(target.as_str(), "wss://other.example.com/x");
    }
}
