use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::sync::broadcast;
use tracing::instrument;

/// Shared handle to the runtime plus the signal that starts the shutdown
/// drain: on it the HTTP server stops taking admissions, then the control
/// plane issues `Drain` to agents and settles in-flight shards before the
/// process exits.
///
/// Background loops (scheduler ticks, heartbeat sweep, schedule evaluator)
/// select on [`AppContext::on_shutdown`] next to their work channel; the
/// single-writer subsystems themselves keep running through the drain and
/// stop when their channels close.
#[derive(Clone)]
pub struct AppContext {
    pub rt: Arc<Runtime>,
    shutdown_requested: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    // holding one receiver keeps the channel usable before any subsystem
    // has subscribed
    _shutdown_rx: Arc<broadcast::Receiver<()>>,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContext {
    pub fn new() -> Self {
        // the control plane is channel-bound, not compute-bound; a handful of
        // workers is enough even on large hosts
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .clamp(2, 8);
        let rt = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(workers)
                .enable_all()
                .build()
                .unwrap(),
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Self {
            rt,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            _shutdown_rx: Arc::new(shutdown_rx),
        }
    }

    /// Subscribe to the shutdown signal. Subscribe before doing work: a
    /// receiver created after the signal fired will never see it, but
    /// [`AppContext::shutdown_requested`] stays observable.
    #[instrument(level = "debug", skip(self), fields(subsys = "AppContext"))]
    pub fn on_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Begin the drain. Idempotent: only the first caller fires the signal,
    /// so a ctrl-c racing an operator-requested shutdown cannot start the
    /// drain sequence twice.
    #[instrument(level = "debug", skip(self), fields(subsys = "AppContext"))]
    pub fn request_shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutdown requested");
        // the held receiver guarantees at least one listener exists
        let _ = self.shutdown_tx.send(());
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signal_reaches_prior_subscribers() {
        let ctx = AppContext::new();
        let mut listener = ctx.on_shutdown();

        ctx.request_shutdown();
        assert!(ctx.shutdown_requested());

        ctx.rt.clone().block_on(async move {
            listener.recv().await.unwrap();
        });
    }

    #[test]
    fn request_is_idempotent() {
        let ctx = AppContext::new();
        let mut listener = ctx.on_shutdown();

        ctx.request_shutdown();
        ctx.request_shutdown();

        ctx.rt.clone().block_on(async move {
            listener.recv().await.unwrap();
            // the second request must not have queued a second signal
            assert!(listener.try_recv().is_err());
        });
    }

    #[test]
    fn late_subscribers_fall_back_to_the_flag() {
        let ctx = AppContext::new();
        ctx.request_shutdown();

        let mut late = ctx.on_shutdown();
        ctx.rt.clone().block_on(async move {
            assert!(late.try_recv().is_err());
        });
        assert!(ctx.shutdown_requested());
    }
}
