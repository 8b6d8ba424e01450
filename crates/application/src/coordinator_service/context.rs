use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tollgate_core::{AppError, AppResult};

/// State shared by every endpoint of one coordinator.
///
/// Tracks in-flight requests for graceful shutdown and the absolute resume time
/// the provider last demanded.
#[derive(Debug, Default)]
pub struct RequestContext {
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    resume_at: Mutex<Option<DateTime<Utc>>>,
}

/// Marks one request as in flight until dropped.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    context: &'a RequestContext,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.context.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.context.idle.notify_waiters();
        }
    }
}

impl RequestContext {
    /// Creates an open context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new request, refusing it once shutdown has begun.
    pub fn enter(&self) -> AppResult<InFlightGuard<'_>> {
        if self.is_shutting_down() {
            return Err(AppError::ShuttingDown);
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard { context: self };
        if self.is_shutting_down() {
            return Err(AppError::ShuttingDown);
        }

        Ok(guard)
    }

    /// Returns whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Returns the number of requests currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Fails with `AdmissionBlocked` while the provider's resume time lies ahead of `now`.
    pub async fn check_resume(&self, now: DateTime<Utc>) -> AppResult<()> {
        let resume_at = *self.resume_at.lock().await;
        match resume_at {
            Some(resume_at) if resume_at > now => Err(AppError::AdmissionBlocked {
                retry_after: (resume_at - now).to_std().unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    /// Holds every request until at least `resume_at`.
    pub async fn resume_not_before(&self, resume_at: DateTime<Utc>) {
        let mut current = self.resume_at.lock().await;
        if current.is_none_or(|current| current < resume_at) {
            *current = Some(resume_at);
        }
    }

    /// Refuses new requests and waits until every in-flight request has finished.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }

            idle.await;
        }
    }
}
