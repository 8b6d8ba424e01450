use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use tollgate_core::{AppResult, NonEmptyString};

/// Identifier of one unit of crawl work, such as a match id or an account id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task identifier.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        Ok(Self(NonEmptyString::new(value)?.into()))
    }

    /// Returns the identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for TaskId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// One unit of crawl work. Identity is the id alone; the payload never changes.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    payload: Vec<u8>,
}

impl Task {
    /// Creates a task.
    #[must_use]
    pub fn new(id: TaskId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Returns the task identifier.
    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Returns the opaque payload published to the durable queue.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// Consumes the task and returns its payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Returns the durable queue name of one service on one platform (`<service>_<platform>`).
pub fn queue_name(service: &str, platform: &str) -> AppResult<String> {
    let service = NonEmptyString::new(service)?;
    let platform = NonEmptyString::new(platform)?;
    Ok(format!("{service}_{platform}"))
}
