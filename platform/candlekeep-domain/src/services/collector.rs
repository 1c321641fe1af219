use crate::error::CandleError;
use crate::repositories::candle_feed::CandleFeed;
use crate::repositories::candle_store::CandleStore;
use crate::services::filler::{build_fillers, group_marker, newest_below};
use crate::services::overlap::OverlapAnalyzer;
use crate::services::planner::CollectionPlan;
use crate::services::resolver::{EmptyCandleResolver, ResolveReport};
use crate::value_objects::candle::{Candle, SeriesKey};
use crate::value_objects::collection::{CollectionPhase, CollectionState};
use crate::value_objects::overlap::OverlapStatus;
use crate::value_objects::range::{CandleRange, ChunkInfo};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectorOptions {
    pub fill_empty_candles: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub sequence_index: usize,
    pub error: CandleError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionReport {
    pub phase: CollectionPhase,
    pub state: CollectionState,
    pub failure: Option<ChunkFailure>,
    /// Oldest bound of the last completed chunk. Everything between the plan start and this
    /// instant has been served or fetched.
    pub covered_until: Option<DateTime<Utc>>,
    /// Filler rows linked to an anchor by the per-chunk resolver passes.
    pub resolved_rows: u64,
    /// Chunks whose resolver pass ended with an error.
    pub resolver_errors: usize,
}

struct ChunkOutcome {
    fetched: bool,
    exhausted: bool,
    resolved: ResolveReport,
}

/// Drives a collection plan chunk by chunk: serve from the store what is cached, fetch the rest
/// once, merge, then resolve fillers. Chunks run strictly in plan order.
pub struct ChunkCollector<'a, S: ?Sized, F: ?Sized> {
    store: &'a S,
    feed: &'a F,
    options: CollectorOptions,
    cancel: Option<&'a AtomicBool>,
}

impl<'a, S, F> ChunkCollector<'a, S, F>
where
    S: CandleStore + ?Sized,
    F: CandleFeed + ?Sized,
{
    pub fn new(store: &'a S, feed: &'a F, options: CollectorOptions) -> Self {
        Self {
            store,
            feed,
            options,
            cancel: None,
        }
    }

    /// Flag checked between chunks; once set the job ends `Cancelled`.
    pub fn with_cancel_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn run(
        &self,
        plan: &CollectionPlan,
        progress: &mut dyn FnMut(CollectionPhase, &CollectionState),
    ) -> CollectionReport {
        let span = tracing::info_span!(
            "domain.collector.run",
            series = %plan.series,
            start = %plan.range.start,
            end = %plan.range.end,
            requested = plan.range.count,
            chunks = plan.chunks.len()
        );
        let _enter = span.enter();
        let started = Instant::now();

        let mut state = CollectionState::new(plan.range.count);
        let mut covered_until = None;
        let mut failure = None;
        let mut phase = CollectionPhase::Done;
        let mut resolved_rows = 0;
        let mut resolver_errors = 0;
        progress(CollectionPhase::Planning, &state);

        for chunk in &plan.chunks {
            if self.is_cancelled() {
                tracing::info!(
                    completed = state.completed_chunks,
                    "collection cancelled between chunks"
                );
                phase = CollectionPhase::Cancelled;
                break;
            }

            progress(CollectionPhase::FetchingOrServing, &state);
            match self.process_chunk(chunk, &mut state, progress) {
                Ok(outcome) => {
                    state.completed_chunks += 1;
                    covered_until = Some(chunk.end);
                    resolved_rows += outcome.resolved.rows_updated;
                    if outcome.resolved.error.is_some() {
                        resolver_errors += 1;
                    }
                    tracing::debug!(
                        chunk = chunk.sequence_index,
                        fetched = outcome.fetched,
                        collected = state.collected_count,
                        "chunk completed"
                    );
                    if outcome.exhausted {
                        state.reached_feed_end = true;
                        phase = CollectionPhase::Exhausted;
                        break;
                    }
                    if state.is_satisfied() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        chunk = chunk.sequence_index,
                        error = %error,
                        kind = error.kind(),
                        "chunk failed"
                    );
                    metrics::counter!(
                        "candlekeep.domain.collector.failures_total",
                        "kind" => error.kind()
                    )
                    .increment(1);
                    failure = Some(ChunkFailure {
                        sequence_index: chunk.sequence_index,
                        error,
                    });
                    phase = CollectionPhase::Failed;
                    break;
                }
            }
        }

        progress(phase, &state);
        metrics::counter!("candlekeep.domain.collector.jobs_total", "phase" => phase.as_str())
            .increment(1);
        metrics::histogram!("candlekeep.domain.collector.run_ms", "phase" => phase.as_str())
            .record(started.elapsed().as_millis() as f64);
        tracing::info!(
            phase = phase.as_str(),
            collected = state.collected_count,
            requested = state.requested_count,
            api_calls = state.api_calls_made,
            resolved_rows,
            resolver_errors,
            "collection finished"
        );

        CollectionReport {
            phase,
            state,
            failure,
            covered_until,
            resolved_rows,
            resolver_errors,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    fn process_chunk(
        &self,
        chunk: &ChunkInfo,
        state: &mut CollectionState,
        progress: &mut dyn FnMut(CollectionPhase, &CollectionState),
    ) -> Result<ChunkOutcome, CandleError> {
        let series = chunk.series();
        let range = chunk.range();
        let overlap = OverlapAnalyzer::new(self.store).analyze(&series, &range)?;

        let window = match overlap.status {
            OverlapStatus::CompleteOverlap => None,
            OverlapStatus::NoOverlap => Some(range),
            OverlapStatus::PartialOverlap => match overlap.connected_end {
                None => Some(range),
                Some(connected) => older_than_connected(&series, &range, connected)?,
            },
        };

        let mut outcome = ChunkOutcome {
            fetched: false,
            exhausted: false,
            resolved: ResolveReport::default(),
        };
        match window {
            None => {
                metrics::counter!("candlekeep.domain.collector.chunks_total", "action" => "serve")
                    .increment(1);
                progress(CollectionPhase::Merging, state);
            }
            Some(window) => {
                metrics::counter!("candlekeep.domain.collector.chunks_total", "action" => "fetch")
                    .increment(1);
                let older_than = series.interval.step(window.start, 1).ok_or_else(|| {
                    CandleError::InvalidRequest(format!(
                        "cannot step past {} for {series}",
                        window.start
                    ))
                })?;
                let limit = window.count as usize;
                let fetched = self.feed.fetch(&series, older_than, limit);
                state.api_calls_made += 1;
                let raw = fetched?;
                outcome.fetched = true;
                outcome.exhausted = raw.len() < limit;
                tracing::debug!(
                    chunk = chunk.sequence_index,
                    older_than = %older_than,
                    limit,
                    returned = raw.len(),
                    "feed page received"
                );

                progress(CollectionPhase::Merging, state);
                let fill = self.options.fill_empty_candles;
                let below = fill.then(|| newest_below(&series, &window, &raw)).flatten();
                let mut rows = sanitize(&series, &window, raw);
                if fill {
                    let marker = group_marker(&series, older_than);
                    let fillers = build_fillers(&series, &window, &rows, below.as_ref(), &marker);
                    metrics::counter!("candlekeep.domain.collector.fillers_total")
                        .increment(fillers.len() as u64);
                    rows.extend(fillers);
                }
                let inserted = self.store.bulk_insert_ignore_duplicates(&series, &rows)?;
                metrics::counter!("candlekeep.domain.collector.rows_inserted_total")
                    .increment(inserted);
            }
        }

        outcome.resolved = EmptyCandleResolver::new(self.store).resolve(&series, &range);
        match &outcome.resolved.error {
            Some(error) => tracing::warn!(
                chunk = chunk.sequence_index,
                error = %error,
                rows_updated = outcome.resolved.rows_updated,
                "filler resolution failed; chunk kept"
            ),
            None if outcome.resolved.rows_updated > 0 => tracing::info!(
                chunk = chunk.sequence_index,
                groups = outcome.resolved.groups_resolved,
                rows_updated = outcome.resolved.rows_updated,
                "filler groups resolved"
            ),
            None => {}
        }
        state.collected_count += self
            .store
            .count_in_range(&series, range.start, range.end)?;
        Ok(outcome)
    }
}

/// Sub-range of `range` strictly older than `connected`, or `None` when nothing is left.
fn older_than_connected(
    series: &SeriesKey,
    range: &CandleRange,
    connected: DateTime<Utc>,
) -> Result<Option<CandleRange>, CandleError> {
    let Some(sub_start) = series.interval.step(connected, -1) else {
        return Ok(None);
    };
    if sub_start < range.end {
        return Ok(None);
    }
    CandleRange::new(series.interval, sub_start, range.end).map(Some)
}

/// Keeps feed rows that belong to `series`, sit on the grid inside `window`; newest first and
/// unique per `open_time`.
fn sanitize(series: &SeriesKey, window: &CandleRange, raw: Vec<Candle>) -> Vec<Candle> {
    let received = raw.len();
    let mut rows: Vec<Candle> = raw
        .into_iter()
        .filter(|c| {
            series.owns(c)
                && series.interval.is_aligned(c.open_time)
                && window.contains(c.open_time)
        })
        .map(|mut c| {
            c.empty_reference = None;
            c
        })
        .collect();
    rows.sort_by(|a, b| b.open_time.cmp(&a.open_time));
    rows.dedup_by_key(|c| c.open_time);

    let dropped = received - rows.len();
    if dropped > 0 {
        metrics::counter!("candlekeep.domain.collector.rows_dropped_total")
            .increment(dropped as u64);
        tracing::debug!(dropped, "feed rows dropped during sanitization");
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::memory::MemoryCandleStore;
    use crate::services::planner::RequestPlanner;
    use crate::value_objects::candle::EmptyReference;
    use crate::value_objects::interval::Interval;
    use crate::value_objects::request::CandleRequest;
    use chrono::{Duration, TimeZone};
    use parking_lot::Mutex;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn series() -> SeriesKey {
        SeriesKey::new("BTC-USDT", Interval::Minute1)
    }

    fn candle_at(ts: DateTime<Utc>) -> Candle {
        Candle {
            instrument: "BTC-USDT".to_string(),
            interval: Interval::Minute1,
            open_time: ts,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
            quote_volume: 4.5,
            trade_count: None,
            empty_reference: None,
        }
    }

    /// Serves `older_than - 1 tick` downwards, skipping `holes`, until `history_start`.
    struct GridFeed {
        history_start: DateTime<Utc>,
        holes: Vec<DateTime<Utc>>,
        calls: Mutex<Vec<(DateTime<Utc>, usize)>>,
        fail: bool,
    }

    impl GridFeed {
        fn new(history_start: DateTime<Utc>) -> Self {
            Self {
                history_start,
                holes: Vec::new(),
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    impl CandleFeed for GridFeed {
        fn fetch(
            &self,
            _series: &SeriesKey,
            older_than: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<Candle>, CandleError> {
            self.calls.lock().push((older_than, limit));
            if self.fail {
                return Err(CandleError::FeedTimeout("simulated".to_string()));
            }
            let mut out = Vec::new();
            let mut ts = older_than - Duration::minutes(1);
            while out.len() < limit && ts >= self.history_start {
                if !self.holes.contains(&ts) {
                    out.push(candle_at(ts));
                }
                ts -= Duration::minutes(1);
            }
            Ok(out)
        }
    }

    fn plan(count: u64) -> CollectionPlan {
        RequestPlanner::default()
            .plan(&series(), &CandleRequest::Latest { count }, now())
            .unwrap()
    }

    #[test]
    fn progress_sees_every_transition() {
        let store = MemoryCandleStore::new();
        let feed = GridFeed::new(now() - Duration::days(1));
        let mut phases = Vec::new();
        let report = ChunkCollector::new(&store, &feed, CollectorOptions::default())
            .run(&plan(250), &mut |phase, _| phases.push(phase));

        assert_eq!(report.phase, CollectionPhase::Done);
        assert_eq!(
            phases,
            vec![
                CollectionPhase::Planning,
                CollectionPhase::FetchingOrServing,
                CollectionPhase::Merging,
                CollectionPhase::FetchingOrServing,
                CollectionPhase::Merging,
                CollectionPhase::Done,
            ]
        );
        assert_eq!(report.covered_until, Some(plan(250).range.end));
    }

    #[test]
    fn feed_failure_stops_the_job_at_failed() {
        let store = MemoryCandleStore::new();
        let mut feed = GridFeed::new(now() - Duration::days(1));
        feed.fail = true;
        let report = ChunkCollector::new(&store, &feed, CollectorOptions::default())
            .run(&plan(500), &mut |_, _| {});
        assert_eq!(report.phase, CollectionPhase::Failed);
        let failure = report.failure.unwrap();
        assert_eq!(failure.sequence_index, 0);
        assert!(failure.error.is_feed());
        assert_eq!(feed.calls.lock().len(), 1);
        assert_eq!(report.state.api_calls_made, 1);
        assert_eq!(report.covered_until, None);
    }

    #[test]
    fn cancellation_is_observed_between_chunks() {
        let store = MemoryCandleStore::new();
        let feed = GridFeed::new(now() - Duration::days(1));
        let flag = AtomicBool::new(false);
        let collector = ChunkCollector::new(&store, &feed, CollectorOptions::default())
            .with_cancel_flag(&flag);
        let report = collector.run(&plan(500), &mut |phase, state| {
            if phase == CollectionPhase::Merging && state.completed_chunks == 0 {
                flag.store(true, Ordering::Release);
            }
        });
        assert_eq!(report.phase, CollectionPhase::Cancelled);
        assert_eq!(report.state.completed_chunks, 1);
        assert_eq!(feed.calls.lock().len(), 1);
    }

    #[test]
    fn holes_become_fillers_anchored_to_the_candle_they_copy() {
        let store = MemoryCandleStore::new();
        let plan = plan(10);
        let hole = plan.range.start - Duration::minutes(3);
        let mut feed = GridFeed::new(now() - Duration::days(1));
        feed.holes.push(hole);

        let options = CollectorOptions {
            fill_empty_candles: true,
        };
        let report = ChunkCollector::new(&store, &feed, options).run(&plan, &mut |_, _| {});
        assert_eq!(report.phase, CollectionPhase::Done);
        assert_eq!(report.state.collected_count, 10);

        let filler = store.point_lookup(&series(), hole).unwrap().unwrap();
        assert_eq!(
            filler.empty_reference,
            Some(EmptyReference::Anchor(hole - Duration::minutes(1)))
        );
        assert_eq!(filler.close, 1.5);
        assert_eq!(report.resolved_rows, 0);
    }

    #[test]
    fn empty_bottom_bucket_is_linked_by_the_next_chunk() {
        let store = MemoryCandleStore::new();
        let planner = RequestPlanner::new(5, 1_000).unwrap();
        let plan = planner
            .plan(&series(), &CandleRequest::Latest { count: 10 }, now())
            .unwrap();
        let bottom = plan.chunks[0].end;
        let mut feed = GridFeed::new(now() - Duration::days(1));
        feed.holes.push(bottom);
        let options = CollectorOptions {
            fill_empty_candles: true,
        };

        let first = ChunkCollector::new(&store, &feed, options).run(&plan, &mut |_, _| {});
        assert_eq!(first.phase, CollectionPhase::Done);
        assert_eq!(first.state.collected_count, 10);
        assert_eq!(first.state.api_calls_made, 2);
        assert_eq!(first.resolved_rows, 1);
        let filler = store.point_lookup(&series(), bottom).unwrap().unwrap();
        assert_eq!(
            filler.empty_reference,
            Some(EmptyReference::Anchor(plan.chunks[1].start))
        );

        let second = ChunkCollector::new(&store, &feed, options).run(&plan, &mut |_, _| {});
        assert_eq!(second.phase, CollectionPhase::Done);
        assert_eq!(second.state.api_calls_made, 0);
        assert_eq!(feed.calls.lock().len(), 2);
    }

    #[test]
    fn sanitize_drops_foreign_offgrid_and_duplicate_rows() {
        let range = plan(10).range;
        let mut foreign = candle_at(range.start);
        foreign.instrument = "ETH-USDT".to_string();
        let mut off_grid = candle_at(range.start);
        off_grid.open_time += Duration::seconds(5);
        let outside = candle_at(range.start + Duration::minutes(1));
        let raw = vec![
            candle_at(range.end),
            candle_at(range.start),
            candle_at(range.start),
            foreign,
            off_grid,
            outside,
        ];
        let rows = sanitize(&series(), &range, raw);
        let times: Vec<DateTime<Utc>> = rows.iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![range.start, range.end]);
    }
}
