//! Client-side admission filter between a system-of-record poll and a durable queue.
//!
//! The buffer never sees acknowledgements. It infers how much of its in-flight
//! set was consumed from the queue depth observed before each refill, so its
//! view is approximate and private to one producer.

use std::collections::{HashSet, VecDeque};

use tollgate_core::{AppError, AppResult};

use crate::task::{Task, TaskId};

/// Tracks task ids believed to sit in the durable queue and those recently drained.
#[derive(Debug, Clone)]
pub struct TaskBuffer {
    block_size: usize,
    block_count: usize,
    in_queue: VecDeque<TaskId>,
    in_queue_index: HashSet<TaskId>,
    recent: Vec<TaskId>,
    recent_index: HashSet<TaskId>,
    pull_size: usize,
    headroom: usize,
}

impl TaskBuffer {
    /// Creates a buffer targeting `block_size * block_count` queued tasks.
    pub fn new(block_size: usize, block_count: usize) -> AppResult<Self> {
        if block_size == 0 || block_count == 0 {
            return Err(AppError::Validation(
                "task buffer block size and block count must be greater than zero".to_owned(),
            ));
        }

        let queue_size = block_size.checked_mul(block_count).ok_or_else(|| {
            AppError::Validation("task buffer queue size overflows".to_owned())
        })?;

        Ok(Self {
            block_size,
            block_count,
            in_queue: VecDeque::new(),
            in_queue_index: HashSet::new(),
            recent: Vec::new(),
            recent_index: HashSet::new(),
            pull_size: queue_size,
            headroom: queue_size,
        })
    }

    /// Returns the number of tasks per block.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the number of blocks the queue should hold.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Returns the target queue depth.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.block_size * self.block_count
    }

    /// Returns how many candidates the next system-of-record read should fetch.
    #[must_use]
    pub fn pull_size(&self) -> usize {
        self.pull_size
    }

    /// Returns the number of ids believed to be queued.
    #[must_use]
    pub fn in_queue_len(&self) -> usize {
        self.in_queue.len()
    }

    /// Returns the number of recently drained ids still used for dedup.
    #[must_use]
    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    /// Returns whether `id` is queued or recently drained.
    #[must_use]
    pub fn contains(&self, id: &TaskId) -> bool {
        self.in_queue_index.contains(id) || self.recent_index.contains(id)
    }

    /// Returns the depth below which a refill should be attempted.
    #[must_use]
    pub fn refill_target_count(&self) -> usize {
        (self.block_count - 1) * self.block_size
    }

    /// Filters `candidates` down to tasks that are safe to publish now.
    ///
    /// Drops ids already queued or recently drained, and stops once the queue
    /// would exceed its target size or the headroom left by the last observed depth.
    /// Accepted ids are recorded as queued.
    pub fn verify_tasks(&mut self, candidates: Vec<Task>) -> Vec<Task> {
        let mut accepted = Vec::new();
        for task in candidates {
            if self.in_queue.len() >= self.queue_size() || self.headroom == 0 {
                break;
            }

            if self.contains(task.id()) {
                continue;
            }

            self.in_queue.push_back(task.id().clone());
            self.in_queue_index.insert(task.id().clone());
            self.headroom -= 1;
            accepted.push(task);
        }

        accepted
    }

    /// Updates the buffer from the observed queue depth and reports whether a refill is due.
    ///
    /// When at least one block is missing, the oldest `missing * block_size` queued
    /// ids are presumed consumed and become the recent set, and the next pull grows
    /// by the size of that set.
    pub fn needs_refill(&mut self, observed_depth: u64) -> bool {
        let depth = usize::try_from(observed_depth).unwrap_or(usize::MAX);
        self.headroom = self.queue_size().saturating_sub(depth);

        let filled_blocks = depth.div_ceil(self.block_size);
        let missing_blocks = self.block_count.saturating_sub(filled_blocks);
        if missing_blocks == 0 {
            return false;
        }

        let drained = (missing_blocks * self.block_size).min(self.in_queue.len());
        self.recent = self.in_queue.drain(..drained).collect();
        self.recent_index = self.recent.iter().cloned().collect();
        for id in &self.recent {
            self.in_queue_index.remove(id);
        }
        self.pull_size = self.queue_size() + self.recent.len();

        true
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::TaskBuffer;
    use crate::task::{Task, TaskId};

    fn tasks(range: std::ops::Range<usize>) -> Vec<Task> {
        range
            .map(|index| {
                Task::new(
                    TaskId::new(format!("task-{index}")).unwrap_or_else(|_| unreachable!()),
                    Vec::new(),
                )
            })
            .collect()
    }

    fn buffer(block_size: usize, block_count: usize) -> TaskBuffer {
        TaskBuffer::new(block_size, block_count).unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn rejects_empty_sizing() {
        assert!(TaskBuffer::new(0, 16).is_err());
        assert!(TaskBuffer::new(500, 0).is_err());
    }

    #[test]
    fn verifying_the_same_candidates_twice_accepts_them_once() {
        let mut buffer = buffer(10, 4);

        let first = buffer.verify_tasks(tasks(0..25));
        let second = buffer.verify_tasks(tasks(0..25));

        assert_eq!(first.len(), 25);
        assert!(second.is_empty());
        assert_eq!(buffer.in_queue_len(), 25);
    }

    #[test]
    fn verification_stops_at_queue_size() {
        let mut buffer = buffer(10, 4);

        let accepted = buffer.verify_tasks(tasks(0..100));

        assert_eq!(accepted.len(), 40);
        assert_eq!(buffer.in_queue_len(), buffer.queue_size());
    }

    #[test]
    fn refill_moves_drained_blocks_to_recent() {
        let mut buffer = buffer(500, 16);
        assert_eq!(buffer.queue_size(), 8_000);
        buffer.verify_tasks(tasks(0..8_000));

        assert!(buffer.needs_refill(3_000));

        // ceil(3000 / 500) = 6 blocks remain, so 10 blocks are presumed consumed.
        assert_eq!(buffer.recent_len(), 5_000);
        assert_eq!(buffer.in_queue_len(), 3_000);
        assert_eq!(buffer.pull_size(), 8_000 + 5_000);
    }

    #[test]
    fn recently_drained_ids_are_not_requeued() {
        let mut buffer = buffer(10, 2);
        buffer.verify_tasks(tasks(0..20));
        assert!(buffer.needs_refill(0));

        let accepted = buffer.verify_tasks(tasks(0..40));

        assert_eq!(accepted.len(), 20);
        assert!(accepted.iter().all(|task| task.id().as_str() >= "task-20"));
    }

    #[test]
    fn refill_never_pushes_beyond_observed_headroom() {
        let mut buffer = buffer(10, 4);
        assert!(buffer.needs_refill(25));

        let accepted = buffer.verify_tasks(tasks(0..100));

        assert_eq!(accepted.len(), 15);
    }

    #[test]
    fn refill_threshold_is_block_granular() {
        let mut buffer = buffer(500, 16);

        assert_eq!(buffer.refill_target_count(), 7_500);
        assert!(buffer.needs_refill(7_500));
        assert!(!buffer.needs_refill(7_501));
        assert!(!buffer.needs_refill(8_000));
    }

    proptest! {
        #[test]
        fn refill_preserves_tracked_ids(
            block_size in 1_usize..50,
            block_count in 1_usize..8,
            queued in 0_usize..400,
            depth in 0_u64..400,
        ) {
            let mut buffer = TaskBuffer::new(block_size, block_count).unwrap_or_else(|_| unreachable!());
            buffer.verify_tasks(tasks(0..queued));
            let before = buffer.in_queue_len();

            let refilled = buffer.needs_refill(depth);

            let expected = depth <= (block_size * (block_count - 1)) as u64;
            prop_assert_eq!(refilled, expected);
            if refilled {
                prop_assert_eq!(buffer.recent_len() + buffer.in_queue_len(), before);
            } else {
                prop_assert_eq!(buffer.in_queue_len(), before);
            }
        }

        #[test]
        fn in_queue_never_exceeds_queue_size(
            batches in prop::collection::vec((0_usize..200, 0_usize..200, 0_u64..300), 1..10),
        ) {
            let mut buffer = TaskBuffer::new(20, 5).unwrap_or_else(|_| unreachable!());
            for (start, len, depth) in batches {
                buffer.needs_refill(depth);
                let accepted = buffer.verify_tasks(tasks(start..start + len));
                let unique = accepted
                    .iter()
                    .map(|task| task.id().clone())
                    .collect::<std::collections::HashSet<_>>();
                prop_assert_eq!(unique.len(), accepted.len());
                prop_assert!(buffer.in_queue_len() <= buffer.queue_size());
            }
        }
    }
}
