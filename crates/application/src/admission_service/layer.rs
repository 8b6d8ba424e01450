use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tollgate_core::{AppError, AppResult};
use tollgate_domain::{
    PermitRequest, QuotaWindow, RealignUpdate, ScopeKey, ScopeLimits, WindowCount,
};
use tracing::{debug, warn};

use crate::coordination_ports::{CoordinationStore, TransportResponse};

use super::RateLimitHeaders;

/// Outcome of the bootstrap protocol for a scope with no cached limits.
enum Bootstrap {
    /// This caller won the placeholder and makes the discovery request unmetered.
    Probe,
    /// Real limits were already published by another caller.
    Known(Vec<QuotaWindow>),
}

/// How a layer let a request through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was charged in every window of the scope.
    Permitted,
    /// The request is the scope's single unmetered discovery probe.
    ///
    /// The placeholder this caller won blocks every other caller until the probe's
    /// response publishes real limits, so a probe that never reaches the transport
    /// must be handed back with [`ScopeLayer::abandon_probe`].
    Probe,
}

/// One quota scope wrapping the transport call.
pub struct ScopeLayer {
    key: ScopeKey,
    headers: RateLimitHeaders,
    store: Arc<dyn CoordinationStore>,
    safety_margin: u32,
    bootstrap_span_seconds: u32,
    bootstrap_retry: Duration,
    windows: RwLock<Option<Vec<QuotaWindow>>>,
}

impl ScopeLayer {
    /// Creates a layer with no cached limits.
    #[must_use]
    pub fn new(
        key: ScopeKey,
        headers: RateLimitHeaders,
        store: Arc<dyn CoordinationStore>,
        safety_margin: u32,
        bootstrap_span_seconds: u32,
        bootstrap_retry: Duration,
    ) -> Self {
        Self {
            key,
            headers,
            store,
            safety_margin,
            bootstrap_span_seconds: bootstrap_span_seconds.max(1),
            bootstrap_retry,
            windows: RwLock::new(None),
        }
    }

    /// Returns the scope key.
    #[must_use]
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    /// Returns the effective windows this layer currently admits against.
    pub async fn cached_windows(&self) -> Option<Vec<QuotaWindow>> {
        self.windows.read().await.clone()
    }

    /// Takes one slot in every window of the scope, or fails without touching the network.
    pub async fn admit(&self, now_ms: i64) -> AppResult<Admission> {
        let cached = self.windows.read().await.clone();
        let windows = match cached {
            Some(windows) => windows,
            None => match self.bootstrap(now_ms).await? {
                Bootstrap::Probe => return Ok(Admission::Probe),
                Bootstrap::Known(windows) => windows,
            },
        };

        let request = PermitRequest::for_scope(&self.key, windows.as_slice(), now_ms);
        if let Some(retry_after) = self.store.permit(&request).await? {
            debug!(
                scope = %self.key,
                wait_ms = %retry_after.as_millis(),
                "scope saturated"
            );
            return Err(AppError::AdmissionBlocked { retry_after });
        }

        Ok(Admission::Permitted)
    }

    /// Releases a won bootstrap placeholder so another caller can probe at once.
    ///
    /// Does nothing once real limits have been published for the scope.
    pub async fn abandon_probe(&self) -> AppResult<()> {
        let span_seconds = self.bootstrap_span_seconds;
        debug!(scope = %self.key, "abandoning bootstrap probe");
        self.store
            .release_placeholder(
                &self.key,
                ScopeLimits::placeholder(span_seconds)
                    .to_header_value()
                    .as_str(),
                self.key.window_key(span_seconds).as_str(),
            )
            .await
    }

    /// Merges the provider's reported usage for this scope into the shared ledger.
    ///
    /// Responses without this scope's headers leave the ledger untouched.
    pub async fn realign(
        &self,
        response: &TransportResponse,
        now_ms: i64,
        retry_at_ms: Option<i64>,
    ) -> AppResult<()> {
        let (Some(limit_value), Some(count_value)) = (
            response.header(self.headers.limit.as_str()),
            response.header(self.headers.count.as_str()),
        ) else {
            debug!(scope = %self.key, status = response.status(), "response carries no limits");
            return Ok(());
        };

        let limits = ScopeLimits::parse(limit_value)?;
        let counts = WindowCount::parse_list(count_value)?;
        if limits.spans_disagree(counts.as_slice()) {
            warn!(
                scope = %self.key,
                limits = limit_value,
                counts = count_value,
                "limit and count headers list different windows, pairing them by position"
            );
        }

        let update = RealignUpdate::from_headers(
            &self.key,
            limits,
            counts.as_slice(),
            self.safety_margin,
            now_ms,
            retry_at_ms,
        )?;
        self.store.realign(&update).await?;

        *self.windows.write().await = Some(update.limits.effective(self.safety_margin));
        Ok(())
    }

    async fn bootstrap(&self, now_ms: i64) -> AppResult<Bootstrap> {
        let span_seconds = self.bootstrap_span_seconds;
        let placeholder = ScopeLimits::placeholder(span_seconds);
        let created = self
            .store
            .create_scope_if_absent(
                &self.key,
                placeholder.to_header_value().as_str(),
                Duration::from_secs(u64::from(span_seconds)),
            )
            .await?;

        if created {
            let window = QuotaWindow::placeholder(span_seconds);
            let already_consumed = self
                .store
                .pseudo_permit(
                    self.key.window_key(span_seconds).as_str(),
                    now_ms,
                    window.span_ms(),
                )
                .await?;
            if already_consumed {
                debug!(scope = %self.key, "bootstrap slot already taken");
                return Err(self.bootstrap_blocked());
            }

            debug!(scope = %self.key, "probing for scope limits");
            return Ok(Bootstrap::Probe);
        }

        let Some(value) = self.store.get_scope(&self.key).await? else {
            return Err(self.bootstrap_blocked());
        };
        let limits = ScopeLimits::parse(value.as_str())?;
        if limits.is_placeholder(span_seconds) {
            debug!(scope = %self.key, "waiting for probe to publish limits");
            return Err(self.bootstrap_blocked());
        }

        let windows = limits.effective(self.safety_margin);
        *self.windows.write().await = Some(windows.clone());
        Ok(Bootstrap::Known(windows))
    }

    fn bootstrap_blocked(&self) -> AppError {
        AppError::AdmissionBlocked {
            retry_after: self.bootstrap_retry,
        }
    }
}
