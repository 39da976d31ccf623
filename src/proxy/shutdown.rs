use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One-shot stop request for the accept loop
///
/// Firing it closes the listener. Sessions that are already running are left
/// alone and end on their own. A signal cannot be re-armed; start a new server
/// with a new signal instead.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal; returns `false` if it had already been fired
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already requested, ignoring");
            return false;
        }

        info!("Shutdown requested");
        self.token.cancel();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves once the signal has been fired
    pub async fn fired(&self) {
        self.token.cancelled().await
    }
}
