//! Producer side of the durable work queue.
//!
//! One refill cycle waits for consumers to drain the queue below the buffer's
//! target, pulls fresh candidates from the system of record, drops those already
//! queued or recently drained, and publishes the rest.

use std::sync::Arc;

use tokio::sync::Mutex;
use tollgate_core::AppResult;
use tollgate_domain::TaskBuffer;
use tracing::info;

use crate::task_queue_ports::{TaskQueue, TaskSource};

mod backpressure;


pub use backpressure::{DEFAULT_POLL_INTERVAL, QueueBackpressure};

/// Counts reported by one refill cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefillOutcome {
    /// Queue depth observed before refilling.
    pub depth: u64,
    /// Candidates read from the system of record.
    pub pulled: usize,
    /// Tasks published to the queue.
    pub published: usize,
}

/// Keeps one durable queue filled from one task source.
pub struct RefillService {
    source: Arc<dyn TaskSource>,
    queue: Arc<dyn TaskQueue>,
    backpressure: QueueBackpressure,
    buffer: Mutex<TaskBuffer>,
}

impl RefillService {
    /// Creates a refill service.
    #[must_use]
    pub fn new(
        source: Arc<dyn TaskSource>,
        backpressure: QueueBackpressure,
        buffer: TaskBuffer,
    ) -> Self {
        Self {
            source,
            queue: backpressure.queue().clone(),
            backpressure,
            buffer: Mutex::new(buffer),
        }
    }

    /// Returns the name of the fed queue.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Runs one wait, pull, filter and publish cycle.
    pub async fn run_cycle(&self) -> AppResult<RefillOutcome> {
        let mut buffer = self.buffer.lock().await;
        let threshold = u64::try_from(buffer.refill_target_count()).unwrap_or(u64::MAX);
        let depth = self.backpressure.wait_until_depth_below(threshold).await?;

        if !buffer.needs_refill(depth) {
            return Ok(RefillOutcome {
                depth,
                ..RefillOutcome::default()
            });
        }

        let candidates = self.source.fetch_candidates(buffer.pull_size()).await?;
        let pulled = candidates.len();
        let accepted = buffer.verify_tasks(candidates);
        if !accepted.is_empty() {
            self.queue.publish(accepted.as_slice()).await?;
        }

        info!(
            queue = self.queue.name(),
            depth,
            pulled,
            published = accepted.len(),
            recent = buffer.recent_len(),
            "refilled queue"
        );

        Ok(RefillOutcome {
            depth,
            pulled,
            published: accepted.len(),
        })
    }
}
