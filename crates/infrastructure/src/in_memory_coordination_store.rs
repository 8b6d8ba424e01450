//! Process-local coordination store.
//!
//! Applies the same ledger transitions as the Redis scripts under one mutex. Only
//! callers inside the owning process share quota state through it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tollgate_application::CoordinationStore;
use tollgate_core::AppResult;
use tollgate_domain::{PermitRequest, RealignUpdate, ScopeKey, WindowLedger};

#[derive(Debug, Clone)]
struct ScopeEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ScopeEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    scopes: HashMap<String, ScopeEntry>,
    ledgers: HashMap<String, WindowLedger>,
}

/// In-memory implementation of the coordination store port.
#[derive(Debug, Default)]
pub struct InMemoryCoordinationStore {
    state: Mutex<StoreState>,
}

impl InMemoryCoordinationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn create_scope_if_absent(
        &self,
        scope: &ScopeKey,
        value: &str,
        ttl: Duration,
    ) -> AppResult<bool> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state
            .scopes
            .get(scope.as_str())
            .is_some_and(|entry| entry.is_live(now))
        {
            return Ok(false);
        }

        state.scopes.insert(
            scope.as_str().to_owned(),
            ScopeEntry {
                value: value.to_owned(),
                expires_at: now.checked_add(ttl),
            },
        );
        Ok(true)
    }

    async fn get_scope(&self, scope: &ScopeKey) -> AppResult<Option<String>> {
        let now = Instant::now();
        Ok(self
            .state
            .lock()
            .await
            .scopes
            .get(scope.as_str())
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn pseudo_permit(
        &self,
        window_key: &str,
        now_ms: i64,
        span_ms: i64,
    ) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        let ledger = state.ledgers.entry(window_key.to_owned()).or_default();
        if ledger.is_open(now_ms) {
            return Ok(true);
        }

        ledger.charge(span_ms, now_ms);
        Ok(false)
    }

    async fn release_placeholder(
        &self,
        scope: &ScopeKey,
        placeholder: &str,
        window_key: &str,
    ) -> AppResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let holds_placeholder = state
            .scopes
            .get(scope.as_str())
            .is_some_and(|entry| entry.is_live(now) && entry.value == placeholder);
        if holds_placeholder {
            state.scopes.remove(scope.as_str());
            state.ledgers.remove(window_key);
        }
        Ok(())
    }

    async fn permit(&self, request: &PermitRequest) -> AppResult<Option<Duration>> {
        let mut state = self.state.lock().await;
        let wait_ms = request
            .windows
            .iter()
            .filter_map(|window| {
                state
                    .ledgers
                    .get(window.key.as_str())
                    .and_then(|ledger| ledger.blocked_for(window.max, request.timestamp_ms))
            })
            .max();
        if let Some(wait_ms) = wait_ms {
            return Ok(Some(Duration::from_millis(wait_ms.unsigned_abs())));
        }

        for window in &request.windows {
            state
                .ledgers
                .entry(window.key.clone())
                .or_default()
                .charge(window.span_ms, request.timestamp_ms);
        }
        Ok(None)
    }

    async fn realign(&self, update: &RealignUpdate) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.scopes.insert(
            update.scope.as_str().to_owned(),
            ScopeEntry {
                value: update.limits.to_header_value(),
                expires_at: None,
            },
        );

        for window in &update.windows {
            let ledger = state.ledgers.entry(window.key.clone()).or_default();
            ledger.observe(window.observed, window.span_ms, update.timestamp_ms);
            if let Some(retry_at_ms) = update.retry_at_ms {
                ledger.block_until(retry_at_ms);
            }
        }

        state
            .ledgers
            .retain(|_, ledger| ledger.expires_at() > update.timestamp_ms);
        Ok(())
    }
}
