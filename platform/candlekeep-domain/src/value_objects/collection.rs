use crate::value_objects::candle::SeriesKey;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Counters of one collection job. Only the chunk collector mutates them.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionState {
    pub requested_count: u64,
    pub collected_count: u64,
    pub completed_chunks: usize,
    pub reached_feed_end: bool,
    pub api_calls_made: u64,
}

impl CollectionState {
    pub fn new(requested_count: u64) -> Self {
        Self {
            requested_count,
            ..Self::default()
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.collected_count >= self.requested_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionPhase {
    Planning,
    FetchingOrServing,
    Merging,
    Done,
    Exhausted,
    Failed,
    Cancelled,
}

impl CollectionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CollectionPhase::Done
                | CollectionPhase::Exhausted
                | CollectionPhase::Failed
                | CollectionPhase::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionPhase::Planning => "planning",
            CollectionPhase::FetchingOrServing => "fetching_or_serving",
            CollectionPhase::Merging => "merging",
            CollectionPhase::Done => "done",
            CollectionPhase::Exhausted => "exhausted",
            CollectionPhase::Failed => "failed",
            CollectionPhase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CollectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published for `get_collection_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionProgress {
    pub job_id: JobId,
    pub series: SeriesKey,
    pub phase: CollectionPhase,
    pub state: CollectionState,
    pub failure: Option<String>,
}
