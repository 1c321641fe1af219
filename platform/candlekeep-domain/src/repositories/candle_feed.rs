use crate::error::CandleError;
use crate::value_objects::candle::{Candle, SeriesKey};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// External, rate-limited source of real candles.
///
/// Implementations own their retry and timeout policy. A timeout must surface as
/// [`CandleError::FeedTimeout`] and any other failure as [`CandleError::FeedUnavailable`].
pub trait CandleFeed: Send + Sync {
    /// Up to `limit` real candles strictly older than `older_than`, newest first and free of
    /// duplicate timestamps. A shorter (or empty) answer means history is exhausted.
    fn fetch(
        &self,
        series: &SeriesKey,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, CandleError>;
}

impl<T: CandleFeed + ?Sized> CandleFeed for Arc<T> {
    fn fetch(
        &self,
        series: &SeriesKey,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, CandleError> {
        (**self).fetch(series, older_than, limit)
    }
}
