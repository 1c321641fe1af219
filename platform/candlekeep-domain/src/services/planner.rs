use crate::error::CandleError;
use crate::value_objects::candle::SeriesKey;
use crate::value_objects::interval::Interval;
use crate::value_objects::range::{CandleRange, ChunkInfo};
use crate::value_objects::request::CandleRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_LIMIT: u64 = 200;
pub const DEFAULT_MAX_REQUEST_COUNT: u64 = 7_000_000;

/// A validated request: the resolved range and its page-bounded chunks, newest chunk first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionPlan {
    pub series: SeriesKey,
    pub range: CandleRange,
    pub chunks: Vec<ChunkInfo>,
    pub explicit_end: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPlanner {
    page_limit: u64,
    max_request_count: u64,
}

impl Default for RequestPlanner {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            max_request_count: DEFAULT_MAX_REQUEST_COUNT,
        }
    }
}

impl RequestPlanner {
    pub fn new(page_limit: u64, max_request_count: u64) -> Result<Self, String> {
        if page_limit == 0 {
            return Err("page_limit must be > 0".to_string());
        }
        if max_request_count == 0 {
            return Err("max_request_count must be > 0".to_string());
        }
        Ok(Self {
            page_limit,
            max_request_count,
        })
    }

    pub fn page_limit(&self) -> u64 {
        self.page_limit
    }

    pub fn max_request_count(&self) -> u64 {
        self.max_request_count
    }

    /// Validates `request` against `now` and splits it into chunks. Performs no I/O.
    pub fn plan(
        &self,
        series: &SeriesKey,
        request: &CandleRequest,
        now: DateTime<Utc>,
    ) -> Result<CollectionPlan, CandleError> {
        let range = self.resolve(series.interval, request, now)?;
        let chunks = self.split(series, &range)?;
        Ok(CollectionPlan {
            series: series.clone(),
            range,
            chunks,
            explicit_end: request.has_explicit_end(),
        })
    }

    /// Turns a request into a concrete, grid-aligned range.
    pub fn resolve(
        &self,
        interval: Interval,
        request: &CandleRequest,
        now: DateTime<Utc>,
    ) -> Result<CandleRange, CandleError> {
        let current_tick = interval.align(now);
        match *request {
            CandleRequest::Latest { count } => {
                self.check_count(count)?;
                let end = step_back(interval, current_tick, count)?;
                CandleRange::with_count(interval, current_tick, end, count)
            }
            CandleRequest::CountFrom { count, start } => {
                reject_future(start, now)?;
                self.check_count(count)?;
                let start = interval.align(start);
                let end = step_back(interval, start, count)?;
                CandleRange::with_count(interval, start, end, count)
            }
            CandleRequest::Between { start, end } => {
                reject_future(start, now)?;
                reject_future(end, now)?;
                let start = interval.align(start);
                let end = interval.align(end);
                if start < end {
                    return Err(CandleError::InvalidRequest(format!(
                        "start {start} is older than end {end}"
                    )));
                }
                self.check_derived_count(interval, start, end)?;
                CandleRange::new(interval, start, end)
            }
            CandleRequest::Since { end } => {
                reject_future(end, now)?;
                let end = interval.align(end);
                self.check_derived_count(interval, current_tick, end)?;
                CandleRange::new(interval, current_tick, end)
            }
        }
    }

    /// Splits `range` into chunks of at most `page_limit` ticks. Each chunk starts one tick
    /// before the previous chunk's end.
    pub fn split(
        &self,
        series: &SeriesKey,
        range: &CandleRange,
    ) -> Result<Vec<ChunkInfo>, CandleError> {
        let interval = series.interval;
        let expected = range.count.div_ceil(self.page_limit);
        let mut chunks = Vec::with_capacity(expected as usize);
        let mut remaining = range.count;
        let mut cursor = range.start;

        while remaining > 0 {
            let count = remaining.min(self.page_limit);
            let end = step_back(interval, cursor, count)?;
            chunks.push(ChunkInfo {
                sequence_index: chunks.len(),
                instrument: series.instrument.clone(),
                interval,
                start: cursor,
                end,
                count,
            });
            remaining -= count;
            if remaining > 0 {
                cursor = interval.step(end, -1).ok_or_else(out_of_range)?;
            }
        }

        Ok(chunks)
    }

    fn check_count(&self, count: u64) -> Result<(), CandleError> {
        if count == 0 {
            return Err(CandleError::InvalidRequest(
                "count must be greater than zero".to_string(),
            ));
        }
        if count > self.max_request_count {
            return Err(CandleError::RequestTooLarge {
                requested: count,
                limit: self.max_request_count,
            });
        }
        Ok(())
    }

    fn check_derived_count(
        &self,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), CandleError> {
        let derived = interval.ticks_between(start, end).max(0) as u64;
        self.check_count(derived)
    }
}

/// Oldest tick of a `count`-long span whose newest tick is `start`.
fn step_back(
    interval: Interval,
    start: DateTime<Utc>,
    count: u64,
) -> Result<DateTime<Utc>, CandleError> {
    let ticks = i64::try_from(count).map_err(|_| out_of_range())? - 1;
    interval.step(start, -ticks).ok_or_else(out_of_range)
}

fn reject_future(ts: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), CandleError> {
    if ts > now {
        return Err(CandleError::FutureTimestamp { timestamp: ts, now });
    }
    Ok(())
}

fn out_of_range() -> CandleError {
    CandleError::InvalidRequest("range exceeds the representable time span".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 27).unwrap()
    }

    fn series() -> SeriesKey {
        SeriesKey::new("BTC-USDT", Interval::Minute1)
    }

    #[test]
    fn latest_ends_at_the_current_tick() {
        let planner = RequestPlanner::default();
        let range = planner
            .resolve(Interval::Minute1, &CandleRequest::Latest { count: 500 }, now())
            .unwrap();
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap());
        assert_eq!(range.count, 500);
        assert_eq!(range.end, range.start - Duration::minutes(499));
    }

    #[test]
    fn count_from_aligns_start_before_stepping() {
        let planner = RequestPlanner::default();
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 10, 7, 13).unwrap();
        let range = planner
            .resolve(
                Interval::Minute5,
                &CandleRequest::CountFrom { count: 3, start },
                now(),
            )
            .unwrap();
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 6, 1, 10, 5, 0).unwrap());
        assert_eq!(range.end, Utc.with_ymd_and_hms(2024, 6, 1, 9, 55, 0).unwrap());
    }

    #[test]
    fn between_and_since_derive_the_count() {
        let planner = RequestPlanner::default();
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap();
        let between = planner
            .resolve(Interval::Minute1, &CandleRequest::Between { start, end }, now())
            .unwrap();
        assert_eq!(between.count, 61);

        let since = planner
            .resolve(Interval::Minute1, &CandleRequest::Since { end }, now())
            .unwrap();
        assert_eq!(since.count, 91);
        assert_eq!(since.end, end);
    }

    #[test]
    fn future_bounds_are_rejected() {
        let planner = RequestPlanner::default();
        let future = now() + Duration::minutes(5);
        let err = planner
            .resolve(
                Interval::Minute1,
                &CandleRequest::CountFrom {
                    count: 10,
                    start: future,
                },
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, CandleError::FutureTimestamp { .. }));

        let err = planner
            .resolve(Interval::Minute1, &CandleRequest::Since { end: future }, now())
            .unwrap_err();
        assert!(matches!(err, CandleError::FutureTimestamp { .. }));
    }

    #[test]
    fn reversed_between_is_invalid() {
        let planner = RequestPlanner::default();
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let err = planner
            .resolve(Interval::Minute1, &CandleRequest::Between { start, end }, now())
            .unwrap_err();
        assert!(matches!(err, CandleError::InvalidRequest(_)));
    }

    #[test]
    fn ceiling_applies_to_explicit_and_computed_counts() {
        let planner = RequestPlanner::default();
        let err = planner
            .resolve(
                Interval::Minute1,
                &CandleRequest::Latest { count: 7_000_001 },
                now(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            CandleError::RequestTooLarge {
                requested: 7_000_001,
                limit: 7_000_000
            }
        );

        // One-second candles over a year is ~31.5M ticks.
        let end = now() - Duration::days(365);
        let err = planner
            .resolve(Interval::Second1, &CandleRequest::Since { end }, now())
            .unwrap_err();
        assert!(matches!(err, CandleError::RequestTooLarge { .. }));

        let err = planner
            .resolve(Interval::Minute1, &CandleRequest::Latest { count: 0 }, now())
            .unwrap_err();
        assert!(matches!(err, CandleError::InvalidRequest(_)));
    }

    #[test]
    fn split_produces_contiguous_page_bounded_chunks() {
        let planner = RequestPlanner::default();
        let plan = planner
            .plan(&series(), &CandleRequest::Latest { count: 500 }, now())
            .unwrap();
        let counts: Vec<u64> = plan.chunks.iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![200, 200, 100]);
        assert_eq!(plan.chunks[0].start, plan.range.start);
        assert_eq!(plan.chunks[2].end, plan.range.end);
        for pair in plan.chunks.windows(2) {
            assert_eq!(pair[0].end - Duration::minutes(1), pair[1].start);
            assert_eq!(pair[1].sequence_index, pair[0].sequence_index + 1);
        }
        assert!(!plan.explicit_end);
    }

    #[test]
    fn new_rejects_zero_limits() {
        assert!(RequestPlanner::new(0, 10).is_err());
        assert!(RequestPlanner::new(10, 0).is_err());
        assert_eq!(RequestPlanner::new(50, 10).unwrap().page_limit(), 50);
    }
}
