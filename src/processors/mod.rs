use async_trait::async_trait;
use db_intel_core::{Batch, PipelineError, StageSnapshot};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod adaptive_sampler;
pub mod circuit_breaker;
pub mod correlator;
pub mod cost_control;
pub mod error_monitor;
pub mod plan_extractor;
pub mod predicate;
pub mod verification;

pub use adaptive_sampler::AdaptiveSampler;
pub use circuit_breaker::CircuitBreaker;
pub use correlator::QueryCorrelator;
pub use cost_control::CostControl;
pub use error_monitor::NrErrorMonitor;
pub use plan_extractor::PlanAttributeExtractor;
pub use verification::Verification;

/// One stage of the chain.
///
/// `start` and `shutdown` are called exactly once per process lifetime;
/// `process` may run concurrently on distinct batches. Errors inside
/// `process` are self-contained: a stage counts and moves on, so the method
/// is infallible at the boundary.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validate runtime state and spawn background workers against the root
    /// shutdown signal. Configuration problems are fatal here.
    async fn start(&self, shutdown: ShutdownSignal) -> Result<(), PipelineError>;

    async fn process(&self, batch: Batch) -> Batch;

    /// Joins every background worker before returning; no timer fires
    /// afterwards.
    async fn shutdown(&self);

    fn snapshot(&self) -> StageSnapshot;
}

/// Root cancellation signal cloned into every background worker.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> (watch::Sender<bool>, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, ShutdownSignal { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is signalled.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // sender dropped: treat as shutdown
                return;
            }
        }
    }
}

/// Background worker handles owned by a processor, joined at shutdown.
#[derive(Debug, Default)]
pub struct WorkerSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, handle: JoinHandle<()>) {
        self.handles.lock().push(handle);
    }

    pub async fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn workers_observe_shutdown_and_join() {
        let (tx, signal) = ShutdownSignal::new();
        let workers = WorkerSet::new();
        let mut worker_signal = signal.clone();
        workers.push(tokio::spawn(async move {
            worker_signal.cancelled().await;
        }));

        tx.send(true).expect("receiver alive");
        tokio::time::timeout(Duration::from_secs(1), workers.join_all())
            .await
            .expect("worker joined after shutdown");
        assert!(signal.is_cancelled());
    }
}
