use crate::error::CandleError;
use crate::repositories::candle_store::CandleStore;
use crate::value_objects::candle::SeriesKey;
use crate::value_objects::interval::Interval;
use chrono::{DateTime, Duration, Utc};

/// Ticks read per page by the unbounded scan.
pub const UNBOUNDED_PAGE_TICKS: i64 = 1_000;

/// Gap threshold for an interval label. Unknown labels fall back to the one-minute threshold.
pub fn gap_threshold(label: &str) -> Duration {
    Interval::parse(label)
        .unwrap_or(Interval::Minute1)
        .gap_threshold()
}

/// Walks `times` (newest first) and returns the oldest timestamp still connected to `start`.
///
/// Returns `None` when `times` is empty or does not begin exactly at `start`.
pub fn last_continuous_in(
    times: &[DateTime<Utc>],
    start: DateTime<Utc>,
    threshold: Duration,
) -> Option<DateTime<Utc>> {
    let first = *times.first()?;
    if first != start {
        return None;
    }
    let mut last = first;
    for &ts in &times[1..] {
        if last - ts > threshold {
            break;
        }
        last = ts;
    }
    Some(last)
}

/// Gap-aware scan over the store.
pub struct ContinuityFinder<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: CandleStore + ?Sized> ContinuityFinder<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Oldest timestamp contiguous with `start`, never looking past `bound_end`.
    pub fn find_last_continuous(
        &self,
        series: &SeriesKey,
        start: DateTime<Utc>,
        bound_end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, CandleError> {
        let rows = self.store.range_query(series, start, bound_end)?;
        let times: Vec<DateTime<Utc>> = rows.iter().map(|c| c.open_time).collect();
        Ok(last_continuous_in(
            &times,
            start,
            series.interval.gap_threshold(),
        ))
    }

    /// Same as [`Self::find_last_continuous`] without an end bound. Pages through the store
    /// until a gap or an empty page; meant for diagnostics only.
    pub fn find_last_continuous_unbounded(
        &self,
        series: &SeriesKey,
        start: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, CandleError> {
        tracing::warn!(
            series = %series,
            start = %start,
            "unbounded continuity scan requested"
        );
        metrics::counter!(
            "candlekeep.domain.continuity.unbounded_scans_total",
            "interval" => series.interval.label()
        )
        .increment(1);

        let interval = series.interval;
        let threshold = interval.gap_threshold();
        let mut connected: Option<DateTime<Utc>> = None;
        let mut page_newest = start;
        let mut pages = 0u64;

        loop {
            let Some(page_oldest) = interval.step(page_newest, -(UNBOUNDED_PAGE_TICKS - 1)) else {
                break;
            };
            let rows = self.store.range_query(series, page_newest, page_oldest)?;
            pages += 1;
            let Some(first) = rows.first() else {
                break;
            };

            let mut times = Vec::with_capacity(rows.len() + 1);
            match connected {
                Some(prev) => {
                    // Carry the previous page's tail so a gap across the page seam is seen.
                    if prev - first.open_time > threshold {
                        break;
                    }
                    times.push(prev);
                }
                None if first.open_time != start => break,
                None => {}
            }
            times.extend(rows.iter().map(|c| c.open_time));

            let anchor = times[0];
            let Some(oldest) = last_continuous_in(&times, anchor, threshold) else {
                break;
            };
            connected = Some(oldest);
            if rows.last().map(|c| c.open_time) != Some(oldest) {
                break;
            }
            let Some(next) = interval.step(page_oldest, -1) else {
                break;
            };
            page_newest = next;
        }

        tracing::debug!(pages, connected = ?connected, "unbounded continuity scan finished");
        Ok(connected)
    }
}
