use tokio::sync::broadcast;
use tracing::info;

// ---------------------------------------------------------------------------
// ShutdownSignal — cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// Broadcast-based shutdown coordinator.
///
/// `devos-daemon` holds one `ShutdownSignal`, hands clones to the tasks it
/// spawns, and each task calls `subscribe()` then `select!`s the returned
/// receiver alongside its own work loop:
///
/// ```ignore
/// let mut rx = shutdown.subscribe();
///
/// tokio::select! {
///     _ = rx.recv() => { /* graceful cleanup */ }
///     _ = do_work() => {}
/// }
/// ```
///
/// `trigger()` is safe to call more than once — a broadcast `send` on a
/// channel nobody lags behind on just re-delivers the same `()`.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self { trigger }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// Trigger shutdown for all subscribers.
    pub fn trigger(&self) {
        info!("shutdown signal triggered");
        let _ = self.trigger.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscribe_receives_trigger() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();

        signal.trigger();

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn trigger_wakes_every_subscriber() {
        let signal = ShutdownSignal::new();
        let mut rx1 = signal.subscribe();
        let mut rx2 = signal.subscribe();

        signal.trigger();

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[tokio::test]
    async fn clone_shares_the_same_trigger() {
        let signal = ShutdownSignal::new();
        let handle = signal.clone();
        let mut rx = signal.subscribe();

        handle.trigger();

        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn double_trigger_does_not_panic() {
        let signal = ShutdownSignal::new();
        let _rx = signal.subscribe();
        signal.trigger();
        signal.trigger();
    }

    #[test]
    fn default_creates_a_usable_signal() {
        let signal = ShutdownSignal::default();
        let _rx = signal.subscribe();
    }
}
