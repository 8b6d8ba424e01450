use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tollgate_core::{AppError, AppResult};
use tracing::debug;

use crate::task_queue_ports::TaskQueue;

/// Default interval between queue depth polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Pauses a producer until consumers have drained its queue far enough.
#[derive(Clone)]
pub struct QueueBackpressure {
    queue: Arc<dyn TaskQueue>,
    poll_interval: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl QueueBackpressure {
    /// Creates a backpressure gate polling `queue` every `poll_interval`.
    #[must_use]
    pub fn new(queue: Arc<dyn TaskQueue>, poll_interval: Duration) -> Self {
        Self {
            queue,
            poll_interval,
            shutdown: None,
        }
    }

    /// Aborts waits with `ShuttingDown` once `shutdown` turns true.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Returns the polled queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Polls the queue depth until it is at or below `threshold` and returns it.
    pub async fn wait_until_depth_below(&self, threshold: u64) -> AppResult<u64> {
        let mut shutdown = self.shutdown.clone();
        loop {
            if shutdown.as_ref().is_some_and(|receiver| *receiver.borrow()) {
                return Err(AppError::ShuttingDown);
            }

            let depth = self.queue.depth().await?;
            if depth <= threshold {
                return Ok(depth);
            }

            debug!(
                queue = self.queue.name(),
                depth, threshold, "waiting for consumers to drain queue"
            );
            match shutdown.as_mut() {
                Some(receiver) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.poll_interval) => {}
                        changed = receiver.changed() => {
                            if changed.is_err() {
                                shutdown = None;
                            }
                        }
                    }
                }
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}
