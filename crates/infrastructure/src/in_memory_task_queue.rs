use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tollgate_application::TaskQueue;
use tollgate_core::AppResult;
use tollgate_domain::Task;

/// Process-local FIFO implementation of the task queue port.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
}

impl InMemoryTaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    /// Removes and returns up to `count` tasks in publish order.
    pub async fn pop(&self, count: usize) -> Vec<Task> {
        let mut tasks = self.tasks.lock().await;
        let take = count.min(tasks.len());
        tasks.drain(..take).collect()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn depth(&self) -> AppResult<u64> {
        Ok(u64::try_from(self.tasks.lock().await.len()).unwrap_or(u64::MAX))
    }

    async fn publish(&self, tasks: &[Task]) -> AppResult<()> {
        self.tasks.lock().await.extend(tasks.iter().cloned());
        Ok(())
    }
}
