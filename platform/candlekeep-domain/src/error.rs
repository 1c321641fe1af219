use chrono::{DateTime, Utc};
use thiserror::Error;

/// Error taxonomy shared by the planner, the collector and the persistence boundary.
///
/// Validation variants are raised before any I/O happens. Feed variants are raised per chunk
/// and stop a collection job without undoing what earlier chunks wrote. `Resolver` never
/// escapes the empty-candle resolver; it only shows up inside its report.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CandleError {
    /// The parameter combination does not describe exactly one range.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A `start` or `end` bound lies after the current instant.
    #[error("timestamp {timestamp} is later than now ({now})")]
    FutureTimestamp {
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    /// The resolved candle count exceeds the configured ceiling.
    #[error("request too large: {requested} candles exceeds the limit of {limit}")]
    RequestTooLarge { requested: u64, limit: u64 },

    /// An explicit count disagrees with the count derived from the range bounds.
    #[error("inconsistent range: supplied count {supplied} but the bounds span {derived} ticks")]
    InconsistentRange { supplied: u64, derived: u64 },

    #[error("feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error("feed timed out: {0}")]
    FeedTimeout(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("resolver error: {0}")]
    Resolver(String),
}

impl CandleError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CandleError::InvalidRequest(_)
                | CandleError::FutureTimestamp { .. }
                | CandleError::RequestTooLarge { .. }
                | CandleError::InconsistentRange { .. }
        )
    }

    pub fn is_feed(&self) -> bool {
        matches!(self, CandleError::FeedUnavailable(_) | CandleError::FeedTimeout(_))
    }

    /// Stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CandleError::InvalidRequest(_) => "invalid_request",
            CandleError::FutureTimestamp { .. } => "future_timestamp",
            CandleError::RequestTooLarge { .. } => "request_too_large",
            CandleError::InconsistentRange { .. } => "inconsistent_range",
            CandleError::FeedUnavailable(_) => "feed_unavailable",
            CandleError::FeedTimeout(_) => "feed_timeout",
            CandleError::Store(_) => "store",
            CandleError::Resolver(_) => "resolver",
        }
    }
}
