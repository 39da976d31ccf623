//! Host embedding API
//!
//! [`TunnelEngine`] is what a host application (mobile VPN service, desktop
//! client) drives: initialise logging once, register the socket callback,
//! start the proxy and later stop it. Each engine owns its own callback slot
//! and shutdown signal, so several engines can live in one process.

use crate::config::{LoggingConfig, TunnelConfig, TunnelType};
use crate::logging::init_logging;
use crate::proxy::{ProxyServer, ShutdownSignal};
use crate::transport::{RawDescriptor, SocketProtector};
use crate::{Error, Result};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Socket protector that forwards to whatever callback the host registered
struct CallbackSlot {
    callback: RwLock<Option<Arc<dyn SocketProtector>>>,
    last_fd: AtomicI64,
}

impl CallbackSlot {
    fn new() -> Self {
        Self {
            callback: RwLock::new(None),
            last_fd: AtomicI64::new(-1),
        }
    }

    fn set(&self, callback: Arc<dyn SocketProtector>) {
        if let Ok(mut slot) = self.callback.write() {
            *slot = Some(callback);
        }
    }

    fn is_registered(&self) -> bool {
        self.callback.read().is_ok_and(|slot| slot.is_some())
    }
}

impl SocketProtector for CallbackSlot {
    fn protect(&self, fd: RawDescriptor) {
        self.last_fd.store(fd as i64, Ordering::SeqCst);

        let callback = self.callback.read().ok().and_then(|slot| slot.clone());
        match callback {
            Some(callback) => callback.protect(fd),
            None => warn!("Host app has not registered callback."),
        }
    }
}

/// Run state shared by `run` and `stop`
///
/// The signal outlives a single run so that a stop requested before the proxy
/// is up is still seen by the next `run`, which consumes it.
struct RunState {
    signal: ShutdownSignal,
    running: bool,
}

/// A tunnel engine instance
pub struct TunnelEngine {
    callback: Arc<CallbackSlot>,
    state: Mutex<RunState>,
}

impl Default for TunnelEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelEngine {
    pub fn new() -> Self {
        Self {
            callback: Arc::new(CallbackSlot::new()),
            state: Mutex::new(RunState {
                signal: ShutdownSignal::new(),
                running: false,
            }),
        }
    }

    /// Set up logging (debug level when `development`, file output when a path is given)
    ///
    /// Only the first call in a process installs a logger; later calls do nothing.
    pub fn initialise(&self, development: bool, log_file_path: &str) -> Result<()> {
        let installed = init_logging(&LoggingConfig::new(development, log_file_path))?;
        if installed {
            info!("Tunnel engine v{} initialised", crate::VERSION);
        } else {
            debug!("Logging already initialised");
        }
        Ok(())
    }

    /// Register the socket callback; `None` asks a running proxy to stop
    pub fn register_tunnel_callback(&self, callback: Option<Arc<dyn SocketProtector>>) {
        match callback {
            Some(callback) => {
                self.callback.set(callback);
                info!("New connection from host app.");
            }
            None => {
                info!("Disconnect signal from host app.");
                self.stop();
            }
        }
    }

    /// Stop accepting new connections
    ///
    /// When no proxy is running yet the request stays pending and the next
    /// [`run`](Self::run) returns without starting. Returns `false` if a stop
    /// was already requested.
    pub fn stop(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            error!("Engine state poisoned, cannot stop");
            return false;
        };
        if !state.running {
            debug!("Stop requested before the proxy started");
        }
        state.signal.fire()
    }

    /// Whether a proxy started by this engine is accepting connections
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.running && !state.signal.is_fired())
            .unwrap_or(false)
    }

    /// Descriptor of the most recent outbound socket, if any was created
    pub fn last_socket_descriptor(&self) -> Option<i64> {
        let fd = self.callback.last_fd.load(Ordering::SeqCst);
        (fd >= 0).then_some(fd)
    }

    /// Run the proxy until [`stop`](Self::stop) is called
    pub async fn run(&self, config: TunnelConfig) -> Result<()> {
        let signal = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Engine("engine state poisoned".to_string()))?;
            if state.running {
                return Err(Error::AlreadyRunning);
            }
            if state.signal.is_fired() {
                state.signal = ShutdownSignal::new();
                info!("Stop was requested before start, not starting the proxy");
                return Ok(());
            }
            state.running = true;
            state.signal.clone()
        };

        if !self.callback.is_registered() {
            warn!("Starting without a registered tunnel callback");
        }

        let result = self.serve(config, signal.clone()).await;

        if let Ok(mut state) = self.state.lock() {
            state.running = false;
            if signal.is_fired() {
                state.signal = ShutdownSignal::new();
            }
        }
        result
    }

    async fn serve(&self, config: TunnelConfig, signal: ShutdownSignal) -> Result<()> {
        info!(
            "Starting {} tunnel: {} -> {} (mtu {}, extra padding {})",
            config.tunnel_type,
            config.listen_address,
            config.remote_address,
            config.mtu,
            config.extra_padding
        );

        let server = ProxyServer::bind(&config, self.callback.clone()).await?;
        server.run(signal).await?;

        info!("Proxy stopped");
        Ok(())
    }

    /// Blocking entry point for hosts without an async runtime
    ///
    /// Returns `true` after a graceful stop and `false` when the proxy could
    /// not start. Must not be called from inside a tokio runtime.
    pub fn start_proxy(
        &self,
        listen_address: &str,
        remote_address: &str,
        tunnel_type: i32,
        mtu: usize,
        extra_padding: bool,
    ) -> bool {
        let tunnel_type = match TunnelType::try_from(tunnel_type) {
            Ok(tunnel_type) => tunnel_type,
            Err(e) => {
                error!("Invalid tunnel type specified: {}", e);
                return false;
            }
        };

        let config = TunnelConfig::new(listen_address, remote_address, tunnel_type)
            .with_mtu(mtu)
            .with_extra_padding(extra_padding);

        let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to start runtime: {}", e);
                return false;
            }
        };

        match runtime.block_on(self.run(config)) {
            Ok(()) => true,
            Err(e) => {
                error!("Proxy failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_callback_slot_forwards_and_records() {
        let slot = CallbackSlot::new();
        slot.protect(7);
        assert_eq!(slot.last_fd.load(Ordering::SeqCst), 7);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        slot.set(Arc::new(move |_fd: RawDescriptor| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        slot.protect(9);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(slot.last_fd.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_stop_without_run() {
        let engine = TunnelEngine::new();
        assert!(engine.stop());
        assert!(!engine.stop());
        assert!(!engine.is_running());
        assert_eq!(engine.last_socket_descriptor(), None);
    }

    #[tokio::test]
    async fn test_stop_before_run_is_not_lost() {
        let engine = Arc::new(TunnelEngine::new());
        engine.register_tunnel_callback(None);

        let config = TunnelConfig::new("127.0.0.1:0", "ws://127.0.0.1:9/", TunnelType::WebSocket);
        tokio::time::timeout(Duration::from_secs(1), engine.run(config))
            .await
            .expect("pending stop should end run right away")
            .unwrap();
        assert!(!engine.is_running());

        // The pending stop was consumed; the next run serves until stopped again.
        let runner = engine.clone();
        let running = tokio::spawn(async move {
            runner
                .run(TunnelConfig::new("127.0.0.1:0", "ws://127.0.0.1:9/", TunnelType::WebSocket))
                .await
        });
        for _ in 0..50 {
            if engine.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.is_running());

        assert!(engine.stop());
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_start_proxy_invalid_tunnel_type() {
        let engine = TunnelEngine::new();
        assert!(!engine.start_proxy("127.0.0.1:0", "wss://example.com/", 3, 1500, false));
    }

    #[test]
    fn test_start_proxy_missing_remote() {
        let engine = TunnelEngine::new();
        assert!(!engine.start_proxy("127.0.0.1:0", "", 1, 1500, false));
    }

    #[tokio::test]
    async fn test_null_callback_stops_running_proxy() {
        let engine = Arc::new(TunnelEngine::new());
        let config = TunnelConfig::new("127.0.0.1:0", "ws://127.0.0.1:9/", TunnelType::WebSocket);

        let runner = engine.clone();
        let running = tokio::spawn(async move { runner.run(config).await });

        for _ in 0..50 {
            if engine.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.is_running());
        assert!(matches!(
            engine.run(TunnelConfig::new("127.0.0.1:0", "ws://127.0.0.1:9/", TunnelType::WebSocket)).await,
            Err(Error::AlreadyRunning)
        ));

        engine.register_tunnel_callback(None);
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!engine.is_running());
    }
}
