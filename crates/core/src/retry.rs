use std::fmt::{Display, Formatter};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// When an upstream provider allows the next request after throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDirective {
    /// Retry after a delay relative to the response.
    After(Duration),
    /// Retry at an absolute point in time. Gates every request of the worker context.
    At(DateTime<Utc>),
}

impl RetryDirective {
    /// Returns the time left until a retry is allowed, measured from now.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        match self {
            Self::After(delay) => *delay,
            Self::At(resume_at) => (*resume_at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
        }
    }

    /// Returns the absolute resume time, anchoring relative delays at `now`.
    #[must_use]
    pub fn resume_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::After(delay) => chrono::Duration::from_std(*delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(now),
            Self::At(resume_at) => *resume_at,
        }
    }
}

impl Display for RetryDirective {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::After(delay) => write!(formatter, "retry after {}ms", delay.as_millis()),
            Self::At(resume_at) => write!(formatter, "retry at {}", resume_at.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::RetryDirective;

    #[test]
    fn past_resume_time_has_no_remaining_wait() {
        let directive = RetryDirective::At(Utc.timestamp_opt(0, 0).single().unwrap_or_default());
        assert_eq!(directive.remaining(), Duration::ZERO);
    }

    #[test]
    fn relative_delay_is_anchored_at_now() {
        let now = Utc.timestamp_opt(1_000, 0).single().unwrap_or_default();
        let resume_at = RetryDirective::After(Duration::from_secs(5)).resume_at(now);
        assert_eq!(resume_at.timestamp(), 1_005);
    }
}
