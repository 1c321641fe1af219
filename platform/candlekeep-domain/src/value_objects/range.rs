use crate::error::CandleError;
use crate::value_objects::candle::SeriesKey;
use crate::value_objects::interval::Interval;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive span of interval-aligned ticks. `start` is the newest instant and `end` the
/// oldest, matching the newest-first order of the feed and the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: u64,
}

impl CandleRange {
    pub fn new(
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, CandleError> {
        if !interval.is_aligned(start) || !interval.is_aligned(end) {
            return Err(CandleError::InvalidRequest(format!(
                "range bounds {start}..{end} are not aligned to {interval}"
            )));
        }
        if start < end {
            return Err(CandleError::InvalidRequest(format!(
                "range start {start} is older than range end {end}"
            )));
        }
        let count = interval.ticks_between(start, end);
        Ok(Self {
            start,
            end,
            count: count as u64,
        })
    }

    /// Same as [`CandleRange::new`], additionally checking a caller-supplied count.
    pub fn with_count(
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        count: u64,
    ) -> Result<Self, CandleError> {
        let range = Self::new(interval, start, end)?;
        if range.count != count {
            return Err(CandleError::InconsistentRange {
                supplied: count,
                derived: range.count,
            });
        }
        Ok(range)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts <= self.start && ts >= self.end
    }
}

/// One page-bounded unit of work produced by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub sequence_index: usize,
    pub instrument: String,
    pub interval: Interval,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: u64,
}

impl ChunkInfo {
    pub fn range(&self) -> CandleRange {
        CandleRange {
            start: self.start,
            end: self.end,
            count: self.count,
        }
    }

    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.instrument.clone(), self.interval)
    }
}
