use crate::error::CandleError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four accepted ways of asking for candles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandleRequest {
    /// The `count` most recent candles, ending at the current tick.
    Latest { count: u64 },
    /// `count` candles going back from `start`.
    CountFrom { count: u64, start: DateTime<Utc> },
    /// Every candle between `start` (newest) and `end` (oldest), inclusive.
    Between {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Every candle from the current tick back to `end`.
    Since { end: DateTime<Utc> },
}

impl CandleRequest {
    /// Maps loose optional parameters onto exactly one variant.
    pub fn from_parts(
        count: Option<u64>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Self, CandleError> {
        match (count, start, end) {
            (Some(count), None, None) => Ok(CandleRequest::Latest { count }),
            (Some(count), Some(start), None) => Ok(CandleRequest::CountFrom { count, start }),
            (None, Some(start), Some(end)) => Ok(CandleRequest::Between { start, end }),
            (None, None, Some(end)) => Ok(CandleRequest::Since { end }),
            (count, start, end) => Err(CandleError::InvalidRequest(format!(
                "unsupported parameter combination (count={}, start={}, end={}); expected count, count+start, start+end or end",
                count.is_some(),
                start.is_some(),
                end.is_some()
            ))),
        }
    }

    /// Whether the caller fixed the oldest bound explicitly.
    pub fn has_explicit_end(&self) -> bool {
        matches!(
            self,
            CandleRequest::Between { .. } | CandleRequest::Since { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn from_parts_accepts_exactly_four_combinations() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(
            CandleRequest::from_parts(Some(5), None, None).unwrap(),
            CandleRequest::Latest { count: 5 }
        );
        assert_eq!(
            CandleRequest::from_parts(Some(5), Some(t1), None).unwrap(),
            CandleRequest::CountFrom {
                count: 5,
                start: t1
            }
        );
        assert_eq!(
            CandleRequest::from_parts(None, Some(t1), Some(t0)).unwrap(),
            CandleRequest::Between { start: t1, end: t0 }
        );
        assert_eq!(
            CandleRequest::from_parts(None, None, Some(t0)).unwrap(),
            CandleRequest::Since { end: t0 }
        );
    }

    #[test]
    fn from_parts_rejects_other_combinations() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (count, start, end) in [
            (None, None, None),
            (Some(3), Some(t), Some(t)),
            (None, Some(t), None),
            (Some(3), None, Some(t)),
        ] {
            let err = CandleRequest::from_parts(count, start, end).unwrap_err();
            assert!(matches!(err, CandleError::InvalidRequest(_)));
        }
    }
}
