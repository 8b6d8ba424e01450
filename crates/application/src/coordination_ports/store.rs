use std::time::Duration;

use async_trait::async_trait;
use tollgate_core::AppResult;
use tollgate_domain::{PermitRequest, RealignUpdate, ScopeKey};

/// Shared key-value store holding published limits and per-window ledgers.
///
/// Every method is atomic with respect to concurrent callers in any process.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Writes `value` under the scope key only when the key is absent.
    ///
    /// Returns true when this caller created the key. The key expires after `ttl`
    /// unless a later realignment overwrites it.
    async fn create_scope_if_absent(
        &self,
        scope: &ScopeKey,
        value: &str,
        ttl: Duration,
    ) -> AppResult<bool>;

    /// Reads the raw limit value stored under the scope key.
    async fn get_scope(&self, scope: &ScopeKey) -> AppResult<Option<String>>;

    /// Opens the single-slot bootstrap window unless it is already open.
    ///
    /// Returns true when the slot was already consumed by another caller.
    async fn pseudo_permit(&self, window_key: &str, now_ms: i64, span_ms: i64)
    -> AppResult<bool>;

    /// Deletes the scope key and its bootstrap window while the key still holds
    /// `placeholder`. Published limits are left untouched.
    async fn release_placeholder(
        &self,
        scope: &ScopeKey,
        placeholder: &str,
        window_key: &str,
    ) -> AppResult<()>;

    /// Charges every window of the request, or returns the wait when one is saturated.
    ///
    /// A saturated window leaves every ledger untouched.
    async fn permit(&self, request: &PermitRequest) -> AppResult<Option<Duration>>;

    /// Rewrites the scope's published limits and merges observed counts into its ledgers.
    async fn realign(&self, update: &RealignUpdate) -> AppResult<()>;
}
