//! Per-window usage ledger shared through the coordination store.
//!
//! Every store adapter applies these exact transitions atomically. The Redis
//! adapter mirrors them in Lua; the in-memory adapter calls them directly.

use tollgate_core::{AppError, AppResult};

use crate::quota::{QuotaWindow, ScopeLimits, WindowCount};
use crate::scope::ScopeKey;

/// Usage of one fixed window: requests counted, the epoch-ms when it closes, and
/// the epoch-ms before which the provider refuses requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowLedger {
    /// Requests counted in the open window.
    pub count: u32,
    /// Epoch milliseconds at which the window closes.
    pub end_ms: i64,
    /// Epoch milliseconds until which the window admits nothing, or zero.
    pub blocked_until_ms: i64,
}

impl WindowLedger {
    /// Returns whether the window is still open at `now_ms`.
    #[must_use]
    pub fn is_open(&self, now_ms: i64) -> bool {
        self.end_ms > now_ms
    }

    /// Returns the milliseconds until a slot frees up, or `None` when one is free now.
    #[must_use]
    pub fn blocked_for(&self, max: u32, now_ms: i64) -> Option<i64> {
        let saturated =
            (self.is_open(now_ms) && self.count >= max).then(|| self.end_ms - now_ms);
        let throttled =
            (self.blocked_until_ms > now_ms).then(|| self.blocked_until_ms - now_ms);
        saturated.max(throttled)
    }

    /// Counts one admitted request, opening a new window when the last one closed.
    pub fn charge(&mut self, span_ms: i64, now_ms: i64) {
        if self.is_open(now_ms) {
            self.count = self.count.saturating_add(1);
        } else {
            self.count = 1;
            self.end_ms = now_ms + span_ms;
        }
    }

    /// Merges the provider's observed count into the ledger.
    ///
    /// The ledger keeps the larger of both counts, so local in-flight admissions are
    /// never forgotten and the provider's count is never undercut.
    pub fn observe(&mut self, observed: u32, span_ms: i64, now_ms: i64) {
        if self.is_open(now_ms) {
            self.count = self.count.max(observed);
        } else {
            self.count = observed;
            self.end_ms = now_ms + span_ms;
        }
    }

    /// Refuses every admission until at least `retry_at_ms`, leaving the count untouched.
    pub fn block_until(&mut self, retry_at_ms: i64) {
        self.blocked_until_ms = self.blocked_until_ms.max(retry_at_ms);
    }

    /// Returns the epoch-ms after which the ledger carries no state worth keeping.
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.end_ms.max(self.blocked_until_ms)
    }
}

/// One window charged by a permit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCharge {
    /// Ledger key of the window.
    pub key: String,
    /// Effective maximum for the window.
    pub max: u32,
    /// Window span in milliseconds.
    pub span_ms: i64,
}

/// Atomic admission request over every window of a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermitRequest {
    /// Epoch milliseconds at which the request is issued.
    pub timestamp_ms: i64,
    /// Windows that must all have a free slot.
    pub windows: Vec<WindowCharge>,
}

impl PermitRequest {
    /// Builds a permit request charging every window of `scope`.
    #[must_use]
    pub fn for_scope(scope: &ScopeKey, windows: &[QuotaWindow], timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            windows: windows
                .iter()
                .map(|window| WindowCharge {
                    key: scope.window_key(window.span_seconds()),
                    max: window.max(),
                    span_ms: window.span_ms(),
                })
                .collect(),
        }
    }
}

/// Provider-reported usage of one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowObservation {
    /// Ledger key of the window.
    pub key: String,
    /// Count the provider reported for the window.
    pub observed: u32,
    /// Effective maximum for the window.
    pub max: u32,
    /// Window span in milliseconds.
    pub span_ms: i64,
}

/// Atomic correction of a scope's ledger from one response's headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealignUpdate {
    /// Scope whose published limits are rewritten.
    pub scope: ScopeKey,
    /// Limits as published by the provider, written verbatim to the scope key.
    pub limits: ScopeLimits,
    /// Epoch milliseconds at which the response was received.
    pub timestamp_ms: i64,
    /// Absolute epoch milliseconds before which the provider refuses requests.
    pub retry_at_ms: Option<i64>,
    /// Per-window observed counts.
    pub windows: Vec<WindowObservation>,
}

impl RealignUpdate {
    /// Pairs the limit and count headers by position into an update.
    ///
    /// Windows are zipped positionally; when the count header lists fewer windows
    /// than the limit header the extra limits carry no observation.
    pub fn from_headers(
        scope: &ScopeKey,
        limits: ScopeLimits,
        counts: &[WindowCount],
        safety_margin: u32,
        timestamp_ms: i64,
        retry_at_ms: Option<i64>,
    ) -> AppResult<Self> {
        if counts.is_empty() {
            return Err(AppError::Validation(format!(
                "count header for scope '{scope}' lists no windows"
            )));
        }

        let windows = limits
            .effective(safety_margin)
            .into_iter()
            .zip(counts)
            .map(|(window, count)| WindowObservation {
                key: scope.window_key(window.span_seconds()),
                observed: count.count,
                max: window.max(),
                span_ms: window.span_ms(),
            })
            .collect();

        Ok(Self {
            scope: scope.clone(),
            limits,
            timestamp_ms,
            retry_at_ms,
            windows,
        })
    }
}
