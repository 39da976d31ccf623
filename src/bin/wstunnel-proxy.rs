//! wstunnel-proxy
//!
//! Command line front end for the tunnel engine:
//! - Listens locally for the VPN client
//! - Tunnels each connection over WebSocket (`-t 1`) or TLS (`-t 2`)
//! - Stops on Ctrl-C, letting open sessions finish
//!
//! The process exits with status 0 both after a graceful stop and when the
//! proxy fails to start; the log says which.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use wstunnel_proxy::config::{DEFAULT_LISTEN_ADDRESS, DEFAULT_MTU};
use wstunnel_proxy::transport::RawDescriptor;
use wstunnel_proxy::{TunnelConfig, TunnelEngine, TunnelType};

/// Local TCP proxy tunnelling traffic over WebSocket or randomized TLS
#[derive(Parser, Debug)]
#[command(name = "wstunnel-proxy")]
#[command(version)]
struct Args {
    /// Local listen address [default: :65479]
    #[arg(short = 'l', long = "listenAddress")]
    listen_address: Option<String>,

    /// Remote server (wss://host:port/path for WebSocket, host:port for TLS)
    #[arg(short = 'r', long = "remoteAddress", required_unless_present = "config")]
    remote_address: Option<String>,

    /// Tunnel type: 1 = WebSocket, 2 = TLS [default: 1]
    #[arg(short = 't', long = "tunnelType")]
    tunnel_type: Option<String>,

    /// Read buffer size [default: 1500]
    #[arg(short = 'm', long = "mtu")]
    mtu: Option<usize>,

    /// Add a large random padding extension to the TLS ClientHello template
    /// (logged with the template fingerprint; the TLS backend does not send it)
    #[arg(short = 'p', long = "extraTlsPadding")]
    extra_tls_padding: bool,

    /// Log file path
    #[arg(short = 'f', long = "logFilePath")]
    log_file_path: String,

    /// Development mode (debug logging)
    #[arg(short = 'd', long = "dev")]
    dev: bool,

    /// TOML configuration file; command line flags override its values
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
}

impl Args {
    fn tunnel_config(&self) -> Result<TunnelConfig> {
        let mut config = match &self.config {
            Some(path) => TunnelConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path))?,
            None => TunnelConfig::new(
                DEFAULT_LISTEN_ADDRESS,
                self.remote_address.clone().unwrap_or_default(),
                TunnelType::WebSocket,
            )
            .with_mtu(DEFAULT_MTU),
        };

        if let Some(listen_address) = &self.listen_address {
            config.listen_address = listen_address.clone();
        }
        if let Some(remote_address) = &self.remote_address {
            config.remote_address = remote_address.clone();
        }
        if let Some(tunnel_type) = &self.tunnel_type {
            config.tunnel_type = tunnel_type
                .parse()
                .map_err(|e| anyhow!("Invalid tunnel type specified: {}", e))?;
        }
        if let Some(mtu) = self.mtu {
            config.mtu = mtu;
        }
        if self.extra_tls_padding {
            config.extra_padding = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let engine = Arc::new(TunnelEngine::new());

    if let Err(e) = engine.initialise(args.dev, &args.log_file_path) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    if let Err(e) = run(args, engine).await {
        error!("Proxy did not start: {:#}", e);
    }
}

async fn run(args: Args, engine: Arc<TunnelEngine>) -> Result<()> {
    let config = args.tunnel_config()?;

    info!("wstunnel-proxy v{}", wstunnel_proxy::VERSION);
    info!("Remote: {} ({})", config.remote_address, config.tunnel_type);

    engine.register_tunnel_callback(Some(Arc::new(|_fd: RawDescriptor| {
        info!("Socket ready to protect.");
    })));

    let stopper = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down...");
            stopper.stop();
        }
    });

    engine.run(config).await.context("Proxy failed")?;
    info!("Proxy stopped gracefully");
    Ok(())
}
