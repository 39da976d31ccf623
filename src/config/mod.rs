//! Configuration management

use crate::obfuscation::HelloProfile;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default local listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = ":65479";

/// Default maximum transfer unit (read buffer size)
pub const DEFAULT_MTU: usize = 1500;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to write config: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid tunnel type: {0}")]
    InvalidTunnelType(String),

    #[error("Invalid listen address '{0}'")]
    InvalidListenAddress(String),

    #[error("Remote address is required")]
    MissingRemoteAddress,

    #[error("MTU must be greater than zero")]
    InvalidMtu,
}

/// How local traffic is disguised on the way to the remote server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", try_from = "TunnelTypeRepr")]
pub enum TunnelType {
    /// Binary WebSocket messages (`ws://` or `wss://` remote)
    #[default]
    WebSocket,
    /// Raw stream inside a TLS session with a randomized ClientHello
    Tls,
}

/// Accepted TOML forms of a tunnel type: `2`, `"2"`, `"tls"`, `"stunnel"`
#[derive(Deserialize)]
#[serde(untagged)]
enum TunnelTypeRepr {
    Code(i64),
    Name(String),
}

impl TryFrom<TunnelTypeRepr> for TunnelType {
    type Error = ConfigError;

    fn try_from(value: TunnelTypeRepr) -> Result<Self, Self::Error> {
        match value {
            TunnelTypeRepr::Code(code) => i32::try_from(code)
                .map_err(|_| ConfigError::InvalidTunnelType(code.to_string()))
                .and_then(Self::try_from),
            TunnelTypeRepr::Name(name) => name.parse(),
        }
    }
}

impl TryFrom<i32> for TunnelType {
    type Error = ConfigError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::WebSocket),
            2 => Ok(Self::Tls),
            other => Err(ConfigError::InvalidTunnelType(other.to_string())),
        }
    }
}

impl FromStr for TunnelType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1" | "ws" | "websocket" | "wstunnel" => Ok(Self::WebSocket),
            "2" | "tls" | "stunnel" => Ok(Self::Tls),
            other => Err(ConfigError::InvalidTunnelType(other.to_string())),
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::Tls => write!(f, "tls"),
        }
    }
}

/// Tunnel engine configuration
///
/// Created once at startup and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Local listen address (`":port"` binds every interface)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Remote server, `wss://host:port/path` or `https://host:port`
    pub remote_address: String,
    /// Tunnel flavour
    #[serde(default)]
    pub tunnel_type: TunnelType,
    /// Read buffer size for local and remote reads
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Add a large randomized padding extension to the TLS ClientHello
    #[serde(default)]
    pub extra_padding: bool,
    /// ClientHello profile for the TLS tunnel
    #[serde(default)]
    pub hello_profile: HelloProfile,
    /// Idle read timeout on the local side in seconds (0 disables)
    #[serde(default = "default_local_read_timeout")]
    pub local_read_timeout: u64,
    /// TLS handshake timeout in seconds (0 disables)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Maximum WebSocket redirects to follow (unbounded when unset)
    #[serde(default)]
    pub max_redirects: Option<usize>,
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

fn default_local_read_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    30
}

impl TunnelConfig {
    /// Create a configuration with defaults for everything but the essentials
    pub fn new(
        listen_address: impl Into<String>,
        remote_address: impl Into<String>,
        tunnel_type: TunnelType,
    ) -> Self {
        Self {
            listen_address: listen_address.into(),
            remote_address: remote_address.into(),
            tunnel_type,
            mtu: DEFAULT_MTU,
            extra_padding: false,
            hello_profile: HelloProfile::default(),
            local_read_timeout: default_local_read_timeout(),
            handshake_timeout: default_handshake_timeout(),
            max_redirects: None,
        }
    }

    /// Set the MTU
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Enable or disable extra ClientHello padding
    pub fn with_extra_padding(mut self, extra_padding: bool) -> Self {
        self.extra_padding = extra_padding;
        self
    }

    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(ConfigError::Write)
    }

    /// Check the values that cannot be expressed in the types
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_address.trim().is_empty() {
            return Err(ConfigError::MissingRemoteAddress);
        }
        if self.mtu == 0 {
            return Err(ConfigError::InvalidMtu);
        }
        Ok(())
    }

    /// Resolve the listen address, accepting the `":port"` shorthand
    ///
    /// The shorthand resolves to the IPv6 wildcard, which also accepts IPv4
    /// clients on dual-stack hosts. The listener falls back to `0.0.0.0`
    /// where IPv6 is unavailable.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let address = self.listen_address.trim();
        let normalized = if address.starts_with(':') {
            format!("[::]{}", address)
        } else {
            address.to_string()
        };

        normalized
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidListenAddress(self.listen_address.clone()))
    }

    /// Local idle read timeout, if enabled
    pub fn local_read_timeout(&self) -> Option<Duration> {
        (self.local_read_timeout > 0).then(|| Duration::from_secs(self.local_read_timeout))
    }

    /// TLS handshake timeout, if enabled
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout > 0).then(|| Duration::from_secs(self.handshake_timeout))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Verbose (debug) logging
    #[serde(default)]
    pub development: bool,
    /// Log file path; when set, logs go only to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Create a logging config from the host API arguments
    pub fn new(development: bool, file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        Self {
            development,
            file: (!file.as_os_str().is_empty()).then_some(file),
        }
    }
}
