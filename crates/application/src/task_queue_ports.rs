use async_trait::async_trait;
use tollgate_core::AppResult;
use tollgate_domain::Task;

/// Durable work queue one producer feeds.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Returns the queue name.
    fn name(&self) -> &str;

    /// Returns the number of messages waiting, without consuming any.
    async fn depth(&self) -> AppResult<u64>;

    /// Publishes tasks persistently.
    async fn publish(&self, tasks: &[Task]) -> AppResult<()>;
}

/// System-of-record read side that yields task candidates.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Returns up to `limit` candidates, possibly including ones already queued.
    async fn fetch_candidates(&self, limit: usize) -> AppResult<Vec<Task>>;
}
