//! Port fakes shared by the service test modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use url::Url;

use tollgate_core::{AppError, AppResult};
use tollgate_domain::{PermitRequest, RealignUpdate, ScopeKey, WindowLedger};

use crate::coordination_ports::{CoordinationStore, HttpTransport, TransportResponse};

#[derive(Default)]
pub(crate) struct FakeCoordinationStore {
    scopes: Mutex<HashMap<String, String>>,
    ledgers: Mutex<HashMap<String, WindowLedger>>,
    fail_realign: bool,
}

impl FakeCoordinationStore {
    pub(crate) fn failing_realign() -> Self {
        Self {
            fail_realign: true,
            ..Self::default()
        }
    }

    pub(crate) async fn ledger(&self, key: &str) -> WindowLedger {
        self.ledgers
            .lock()
            .await
            .get(key)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CoordinationStore for FakeCoordinationStore {
    async fn create_scope_if_absent(
        &self,
        scope: &ScopeKey,
        value: &str,
        _ttl: Duration,
    ) -> AppResult<bool> {
        let mut scopes = self.scopes.lock().await;
        if scopes.contains_key(scope.as_str()) {
            return Ok(false);
        }

        scopes.insert(scope.as_str().to_owned(), value.to_owned());
        Ok(true)
    }

    async fn get_scope(&self, scope: &ScopeKey) -> AppResult<Option<String>> {
        Ok(self.scopes.lock().await.get(scope.as_str()).cloned())
    }

    async fn pseudo_permit(
        &self,
        window_key: &str,
        now_ms: i64,
        span_ms: i64,
    ) -> AppResult<bool> {
        let mut ledgers = self.ledgers.lock().await;
        let ledger = ledgers.entry(window_key.to_owned()).or_default();
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
        let mut scopes = self.scopes.lock().await;
        if scopes.get(scope.as_str()).map(String::as_str) == Some(placeholder) {
            scopes.remove(scope.as_str());
            self.ledgers.lock().await.remove(window_key);
        }
        Ok(())
    }

    async fn permit(&self, request: &PermitRequest) -> AppResult<Option<Duration>> {
        let mut ledgers = self.ledgers.lock().await;
        let wait = request
            .windows
            .iter()
            .filter_map(|window| {
                ledgers
                    .get(&window.key)
                    .and_then(|ledger| ledger.blocked_for(window.max, request.timestamp_ms))
            })
            .max();
        if let Some(wait) = wait {
            return Ok(Some(Duration::from_millis(
                u64::try_from(wait).unwrap_or_default(),
            )));
        }

        for window in &request.windows {
            ledgers
                .entry(window.key.clone())
                .or_default()
                .charge(window.span_ms, request.timestamp_ms);
        }
        Ok(None)
    }

    async fn realign(&self, update: &RealignUpdate) -> AppResult<()> {
        if self.fail_realign {
            return Err(AppError::Unavailable("store offline".to_owned()));
        }

        self.scopes.lock().await.insert(
            update.scope.as_str().to_owned(),
            update.limits.to_header_value(),
        );
        let mut ledgers = self.ledgers.lock().await;
        for window in &update.windows {
            let ledger = ledgers.entry(window.key.clone()).or_default();
            ledger.observe(window.observed, window.span_ms, update.timestamp_ms);
            if let Some(retry_at_ms) = update.retry_at_ms {
                ledger.block_until(retry_at_ms);
            }
        }
        Ok(())
    }
}

pub(crate) struct FakeTransport {
    response: TransportResponse,
    calls: AtomicUsize,
    gate: Option<Semaphore>,
    latency: Duration,
}

impl FakeTransport {
    pub(crate) fn returning(response: TransportResponse) -> Self {
        Self {
            response,
            calls: AtomicUsize::new(0),
            gate: None,
            latency: Duration::ZERO,
        }
    }

    pub(crate) fn slow(response: TransportResponse, latency: Duration) -> Self {
        Self {
            latency,
            ..Self::returning(response)
        }
    }

    pub(crate) fn gated(response: TransportResponse) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::returning(response)
        }
    }

    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn get(&self, _url: &Url) -> AppResult<TransportResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|error| AppError::Internal(error.to_string()))?;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        Ok(self.response.clone())
    }
}

/// Builds a response carrying server and group limit headers plus `extra`.
pub(crate) fn response(status: u16, body: &str, extra: &[(&str, &str)]) -> TransportResponse {
    let mut headers = vec![
        ("X-App-Rate-Limit", "20:1,100:120"),
        ("X-App-Rate-Limit-Count", "1:1,1:120"),
        ("X-Method-Rate-Limit", "50:10"),
        ("X-Method-Rate-Limit-Count", "1:10"),
    ];
    headers.extend_from_slice(extra);
    TransportResponse::new(status, headers, body.as_bytes().to_vec())
}
