use crate::error::CandleError;
use crate::value_objects::candle::{Candle, SeriesKey};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Persistence boundary of the engine. Bounds are inclusive and every query is scoped to one
/// (instrument, interval) partition.
pub trait CandleStore: Send + Sync {
    /// Inserts candles, silently skipping `open_time`s already present. Returns the number of
    /// rows actually written.
    fn bulk_insert_ignore_duplicates(
        &self,
        series: &SeriesKey,
        candles: &[Candle],
    ) -> Result<u64, CandleError>;

    /// Rows with `oldest <= open_time <= newest`, newest first.
    fn range_query(
        &self,
        series: &SeriesKey,
        newest: DateTime<Utc>,
        oldest: DateTime<Utc>,
    ) -> Result<Vec<Candle>, CandleError>;

    fn count_in_range(
        &self,
        series: &SeriesKey,
        newest: DateTime<Utc>,
        oldest: DateTime<Utc>,
    ) -> Result<u64, CandleError>;

    fn point_lookup(
        &self,
        series: &SeriesKey,
        open_time: DateTime<Utc>,
    ) -> Result<Option<Candle>, CandleError>;

    /// Rewrites every filler carrying the pending `marker` to reference `anchor`. Returns the
    /// number of rows updated.
    fn bulk_update_reference(
        &self,
        series: &SeriesKey,
        marker: &str,
        anchor: DateTime<Utc>,
    ) -> Result<u64, CandleError>;
}

impl<T: CandleStore + ?Sized> CandleStore for Arc<T> {
    fn bulk_insert_ignore_duplicates(
        &self,
        series: &SeriesKey,
        candles: &[Candle],
    ) -> Result<u64, CandleError> {
        (**self).bulk_insert_ignore_duplicates(series, candles)
    }

    fn range_query(
        &self,
        series: &SeriesKey,
        newest: DateTime<Utc>,
        oldest: DateTime<Utc>,
    ) -> Result<Vec<Candle>, CandleError> {
        (**self).range_query(series, newest, oldest)
    }

    fn count_in_range(
        &self,
        series: &SeriesKey,
        newest: DateTime<Utc>,
        oldest: DateTime<Utc>,
    ) -> Result<u64, CandleError> {
        (**self).count_in_range(series, newest, oldest)
    }

    fn point_lookup(
        &self,
        series: &SeriesKey,
        open_time: DateTime<Utc>,
    ) -> Result<Option<Candle>, CandleError> {
        (**self).point_lookup(series, open_time)
    }

    fn bulk_update_reference(
        &self,
        series: &SeriesKey,
        marker: &str,
        anchor: DateTime<Utc>,
    ) -> Result<u64, CandleError> {
        (**self).bulk_update_reference(series, marker, anchor)
    }
}
