use std::time::Duration;

use chrono::DateTime;
use tollgate_core::{AppError, AppResult, RetryDirective};
use tollgate_domain::OperationSpec;

use crate::coordination_ports::TransportResponse;

const NOT_FOUND: u16 = 404;
const TOO_MANY_REQUESTS: u16 = 429;
/// Status the provider's own gateways use for an absolute resume time in the body.
const RETRY_AT: u16 = 430;
const DEFAULT_SUCCESS: u16 = 200;
const DEFAULT_THROTTLE_DELAY: Duration = Duration::from_secs(1);

/// Returns the retry hint of a throttling response, or `None` for any other status.
pub(super) fn throttle_directive(response: &TransportResponse) -> Option<RetryDirective> {
    if !matches!(response.status(), TOO_MANY_REQUESTS | RETRY_AT) {
        return None;
    }

    if let Some(seconds) = response
        .header("Retry-After")
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
    {
        return Some(RetryDirective::After(Duration::from_secs_f64(seconds)));
    }

    if let Some(retry_at) = serde_json::from_slice::<serde_json::Value>(response.body())
        .ok()
        .and_then(|body| body.get("Retry-At").and_then(serde_json::Value::as_f64))
        .and_then(|seconds| DateTime::from_timestamp_millis((seconds * 1000.0) as i64))
    {
        return Some(RetryDirective::At(retry_at));
    }

    Some(RetryDirective::After(DEFAULT_THROTTLE_DELAY))
}

/// Converts a retry hint into the absolute epoch-ms written into the ledger.
pub(super) fn retry_at_ms(directive: &RetryDirective, received_ms: i64) -> i64 {
    let received = DateTime::from_timestamp_millis(received_ms).unwrap_or_default();
    directive.resume_at(received).timestamp_millis()
}

/// Maps an upstream response to the caller's result.
pub(super) fn classify(
    response: TransportResponse,
    operation: Option<&OperationSpec>,
    throttle: Option<RetryDirective>,
) -> AppResult<Vec<u8>> {
    let status = response.status();
    let allowed = operation.map_or(status == DEFAULT_SUCCESS, |operation| {
        operation.allows(status)
    });
    if allowed {
        return Ok(response.into_body());
    }

    if let Some(retry) = throttle {
        return Err(AppError::RemoteThrottled { retry });
    }

    if status == NOT_FOUND {
        return Err(AppError::NotFound(format!(
            "upstream returned {NOT_FOUND} for {}",
            operation.map_or("request", OperationSpec::name)
        )));
    }

    Err(AppError::UnexpectedStatus { status })
}
