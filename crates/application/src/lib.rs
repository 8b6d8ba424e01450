//! Application services and ports.

#![forbid(unsafe_code)]

mod admission_service;
mod coordination_ports;
mod coordinator_service;
mod refill_service;
mod task_queue_ports;

#[cfg(test)]
mod test_support;

pub use admission_service::{
    Admission, AdmissionChain, CoordinatorConfig, LayerOrder, RateLimitHeaders, ScopeLayer,
};
pub use coordination_ports::{CoordinationStore, HttpTransport, TransportResponse};
pub use coordinator_service::{Coordinator, Endpoint, InFlightGuard, RequestContext};
pub use refill_service::{DEFAULT_POLL_INTERVAL, QueueBackpressure, RefillOutcome, RefillService};
pub use task_queue_ports::{TaskQueue, TaskSource};
