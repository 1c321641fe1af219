use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapStatus {
    NoOverlap,
    PartialOverlap,
    CompleteOverlap,
}

impl OverlapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlapStatus::NoOverlap => "none",
            OverlapStatus::PartialOverlap => "partial",
            OverlapStatus::CompleteOverlap => "complete",
        }
    }
}

/// How much of a requested range the store already holds.
///
/// `connected_end` is the oldest instant reachable from the range start without crossing a gap.
/// It is only ever set for partial and complete overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlapResult {
    pub status: OverlapStatus,
    pub connected_end: Option<DateTime<Utc>>,
}

impl OverlapResult {
    pub fn none() -> Self {
        Self {
            status: OverlapStatus::NoOverlap,
            connected_end: None,
        }
    }

    pub fn partial(connected_end: Option<DateTime<Utc>>) -> Self {
        Self {
            status: OverlapStatus::PartialOverlap,
            connected_end,
        }
    }

    pub fn complete(range_end: DateTime<Utc>) -> Self {
        Self {
            status: OverlapStatus::CompleteOverlap,
            connected_end: Some(range_end),
        }
    }
}
