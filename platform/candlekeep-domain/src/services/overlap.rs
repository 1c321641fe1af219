use crate::error::CandleError;
use crate::repositories::candle_store::CandleStore;
use crate::services::continuity::ContinuityFinder;
use crate::value_objects::candle::SeriesKey;
use crate::value_objects::overlap::OverlapResult;
use crate::value_objects::range::CandleRange;

/// Classifies a requested range against what the store already holds.
pub struct OverlapAnalyzer<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: CandleStore + ?Sized> OverlapAnalyzer<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn analyze(
        &self,
        series: &SeriesKey,
        range: &CandleRange,
    ) -> Result<OverlapResult, CandleError> {
        let stored = self.store.count_in_range(series, range.start, range.end)?;
        let result = if stored == 0 {
            OverlapResult::none()
        } else if stored >= range.count {
            OverlapResult::complete(range.end)
        } else {
            let connected_end = ContinuityFinder::new(self.store).find_last_continuous(
                series,
                range.start,
                range.end,
            )?;
            OverlapResult::partial(connected_end)
        };

        metrics::counter!(
            "candlekeep.domain.overlap.classified_total",
            "status" => result.status.as_str()
        )
        .increment(1);
        tracing::debug!(
            series = %series,
            start = %range.start,
            end = %range.end,
            stored,
            status = result.status.as_str(),
            connected_end = ?result.connected_end,
            "overlap analyzed"
        );
        Ok(result)
    }
}
