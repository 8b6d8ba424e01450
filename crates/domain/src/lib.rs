//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod endpoint;
mod ledger;
mod quota;
mod scope;
mod task;
mod task_buffer;

pub use endpoint::{EndpointCatalog, OperationSpec, OperationSpecInput, RouteTarget};
pub use ledger::{PermitRequest, RealignUpdate, WindowCharge, WindowLedger, WindowObservation};
pub use quota::{QuotaWindow, ScopeLimits, WindowCount};
pub use scope::ScopeKey;
pub use task::{Task, TaskId, queue_name};
pub use task_buffer::TaskBuffer;
