//! Admission layers that gate every outgoing request on shared quota state.
//!
//! Each request passes through two scope layers: one shared by everything sent to
//! the same upstream server and one shared by the same endpoint group. Both must
//! grant a slot before the transport is called, and both realign their ledgers
//! from the provider's headers once the response is back.

use std::time::Duration;

mod chain;
mod classify;
mod layer;


pub use chain::AdmissionChain;
pub use layer::{Admission, ScopeLayer};

/// Header pair the provider uses to publish one scope's limits and counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Header declaring the windows, e.g. `X-App-Rate-Limit: 20:1,100:120`.
    pub limit: String,
    /// Header declaring observed counts, e.g. `X-App-Rate-Limit-Count: 1:1,3:120`.
    pub count: String,
}

impl RateLimitHeaders {
    /// Creates a header pair.
    #[must_use]
    pub fn new(limit: impl Into<String>, count: impl Into<String>) -> Self {
        Self {
            limit: limit.into(),
            count: count.into(),
        }
    }
}

/// Order in which the two scope layers admit a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LayerOrder {
    /// Server scope first, endpoint-group scope second.
    #[default]
    ServerFirst,
    /// Endpoint-group scope first, server scope second.
    GroupFirst,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Prefix of every coordination-store key.
    pub namespace: String,
    /// Requests subtracted from every published maximum.
    pub safety_margin: u32,
    /// Span of the single-slot placeholder written during bootstrap.
    pub bootstrap_span_seconds: u32,
    /// Wait reported to callers that lose the bootstrap race.
    pub bootstrap_retry: Duration,
    /// Headers carrying server-wide limits.
    pub server_headers: RateLimitHeaders,
    /// Headers carrying endpoint-group limits.
    pub group_headers: RateLimitHeaders,
    /// Layer evaluation order.
    pub layer_order: LayerOrder,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: "ratelimiter".to_owned(),
            safety_margin: 1,
            bootstrap_span_seconds: 10,
            bootstrap_retry: Duration::from_millis(1000),
            server_headers: RateLimitHeaders::new("X-App-Rate-Limit", "X-App-Rate-Limit-Count"),
            group_headers: RateLimitHeaders::new(
                "X-Method-Rate-Limit",
                "X-Method-Rate-Limit-Count",
            ),
            layer_order: LayerOrder::ServerFirst,
        }
    }
}
