use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tollgate_core::{AppError, AppResult};

/// One rate limit rule: at most `max` requests per `span_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaWindow {
    max: u32,
    span_seconds: u32,
}

impl QuotaWindow {
    /// Creates a window, rejecting zero maxima and zero spans.
    pub fn new(max: u32, span_seconds: u32) -> AppResult<Self> {
        if max == 0 {
            return Err(AppError::Validation(
                "quota window max must be greater than zero".to_owned(),
            ));
        }

        if span_seconds == 0 {
            return Err(AppError::Validation(
                "quota window span must be greater than zero".to_owned(),
            ));
        }

        Ok(Self { max, span_seconds })
    }

    /// Returns the single-slot window written while a scope's real limits are unknown.
    #[must_use]
    pub fn placeholder(span_seconds: u32) -> Self {
        Self {
            max: 1,
            span_seconds: span_seconds.max(1),
        }
    }

    /// Returns the request maximum for one span.
    #[must_use]
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Returns the window span in seconds.
    #[must_use]
    pub fn span_seconds(&self) -> u32 {
        self.span_seconds
    }

    /// Returns the window span in milliseconds.
    #[must_use]
    pub fn span_ms(&self) -> i64 {
        i64::from(self.span_seconds) * 1000
    }

    /// Lowers the maximum by `margin`, never below one request.
    #[must_use]
    pub fn with_safety_margin(self, margin: u32) -> Self {
        Self {
            max: self.max.saturating_sub(margin).max(1),
            span_seconds: self.span_seconds,
        }
    }
}

impl Display for QuotaWindow {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}:{}", self.max, self.span_seconds)
    }
}

/// Observed request count for one window, as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests the provider has counted in the current window.
    pub count: u32,
    /// Span of the window the count belongs to.
    pub span_seconds: u32,
}

impl WindowCount {
    /// Parses a provider count header such as `"1:1,57:120"`.
    pub fn parse_list(value: &str) -> AppResult<Vec<Self>> {
        parse_pairs(value)?
            .into_iter()
            .map(|(count, span_seconds)| Ok(Self { count, span_seconds }))
            .collect()
    }
}

/// The set of quota windows the provider publishes for one scope.
///
/// Maxima are kept exactly as published; [`ScopeLimits::effective`] applies the
/// safety margin used for admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeLimits {
    windows: Vec<QuotaWindow>,
}

impl ScopeLimits {
    /// Parses a provider limit header such as `"20:1,100:120"`.
    pub fn parse(value: &str) -> AppResult<Self> {
        let windows = parse_pairs(value)?
            .into_iter()
            .map(|(max, span_seconds)| QuotaWindow::new(max, span_seconds))
            .collect::<AppResult<Vec<_>>>()?;

        if windows.is_empty() {
            return Err(AppError::Validation(format!(
                "limit value '{value}' declares no windows"
            )));
        }

        Ok(Self { windows })
    }

    /// Returns the bootstrap placeholder limits.
    #[must_use]
    pub fn placeholder(span_seconds: u32) -> Self {
        Self {
            windows: vec![QuotaWindow::placeholder(span_seconds)],
        }
    }

    /// Returns whether these limits are the bootstrap placeholder for `span_seconds`.
    #[must_use]
    pub fn is_placeholder(&self, span_seconds: u32) -> bool {
        self.windows.as_slice() == [QuotaWindow::placeholder(span_seconds)]
    }

    /// Returns the windows as published.
    #[must_use]
    pub fn windows(&self) -> &[QuotaWindow] {
        self.windows.as_slice()
    }

    /// Returns the windows with `margin` subtracted from every maximum.
    #[must_use]
    pub fn effective(&self, margin: u32) -> Vec<QuotaWindow> {
        self.windows
            .iter()
            .map(|window| window.with_safety_margin(margin))
            .collect()
    }

    /// Formats the limits in the provider's header format.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        self.windows
            .iter()
            .map(QuotaWindow::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Returns whether `counts` lists spans in a different order than these limits.
    ///
    /// Realignment pairs both headers by position. A disagreement means the ledger
    /// would be written against the wrong windows.
    #[must_use]
    pub fn spans_disagree(&self, counts: &[WindowCount]) -> bool {
        self.windows.len() != counts.len()
            || self
                .windows
                .iter()
                .zip(counts)
                .any(|(window, count)| window.span_seconds != count.span_seconds)
    }
}

fn parse_pairs(value: &str) -> AppResult<Vec<(u32, u32)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (left, right) = entry.split_once(':').ok_or_else(|| {
                AppError::Validation(format!("invalid rate limit entry '{entry}'"))
            })?;
            let left = parse_number(left, entry)?;
            let right = parse_number(right, entry)?;
            Ok((left, right))
        })
        .collect()
}

fn parse_number(value: &str, entry: &str) -> AppResult<u32> {
    value.trim().parse::<u32>().map_err(|error| {
        AppError::Validation(format!("invalid rate limit entry '{entry}': {error}"))
    })
}
