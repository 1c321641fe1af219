use crate::config::{Config, DEFAULT_JOB_HISTORY};
use candlekeep_domain::error::CandleError;
use candlekeep_domain::repositories::candle_feed::CandleFeed;
use candlekeep_domain::repositories::candle_store::CandleStore;
use candlekeep_domain::services::collector::{ChunkCollector, ChunkFailure, CollectorOptions};
use candlekeep_domain::services::planner::{
    CollectionPlan, RequestPlanner, DEFAULT_MAX_REQUEST_COUNT, DEFAULT_PAGE_LIMIT,
};
use candlekeep_domain::value_objects::candle::{Candle, SeriesKey};
use candlekeep_domain::value_objects::collection::{
    CollectionPhase, CollectionProgress, CollectionState, JobId,
};
use candlekeep_domain::value_objects::interval::Interval;
use candlekeep_domain::value_objects::request::CandleRequest;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOptions {
    pub page_limit: u64,
    pub max_request_count: u64,
    pub fill_empty_candles: bool,
    pub job_history: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            max_request_count: DEFAULT_MAX_REQUEST_COUNT,
            fill_empty_candles: false,
            job_history: DEFAULT_JOB_HISTORY,
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_limit: config.page_limit(),
            max_request_count: config.max_request_count(),
            fill_empty_candles: config.fill_empty_candles(),
            job_history: config.job_history(),
        }
    }
}

/// A validated, registered job waiting to be collected.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub job_id: JobId,
    pub plan: CollectionPlan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandlesResponse {
    pub job_id: JobId,
    /// Newest first, from the plan start down to the oldest processed chunk.
    pub candles: Vec<Candle>,
    pub state: CollectionState,
    pub phase: CollectionPhase,
    pub failure: Option<ChunkFailure>,
    pub resolved_fillers: u64,
    pub resolver_errors: usize,
}

impl CandlesResponse {
    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "job_id": self.job_id.0,
            "phase": self.phase.as_str(),
            "returned": self.candles.len(),
            "fillers": self.candles.iter().filter(|c| c.is_filler()).count(),
            "newest": self.candles.first().map(|c| c.open_time.to_rfc3339()),
            "oldest": self.candles.last().map(|c| c.open_time.to_rfc3339()),
            "state": self.state,
            "resolved_fillers": self.resolved_fillers,
            "resolver_errors": self.resolver_errors,
            "failure": self.failure.as_ref().map(|f| serde_json::json!({
                "chunk": f.sequence_index,
                "kind": f.error.kind(),
                "message": f.error.to_string(),
            })),
        })
    }
}

struct JobEntry {
    progress: CollectionProgress,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct JobRegistry {
    jobs: HashMap<JobId, JobEntry>,
    order: VecDeque<JobId>,
}

impl JobRegistry {
    fn register(&mut self, job_id: JobId, series: &SeriesKey, requested: u64, capacity: usize) {
        self.jobs.insert(
            job_id,
            JobEntry {
                progress: CollectionProgress {
                    job_id,
                    series: series.clone(),
                    phase: CollectionPhase::Planning,
                    state: CollectionState::new(requested),
                    failure: None,
                },
                cancel: Arc::new(AtomicBool::new(false)),
            },
        );
        self.order.push_back(job_id);
        while self.order.len() > capacity.max(1) {
            if let Some(evicted) = self.order.pop_front() {
                self.jobs.remove(&evicted);
            }
        }
    }
}

/// Cache coordinator: plans requests, runs them chunk by chunk against the store and the feed,
/// and keeps a bounded history of job progress.
pub struct CandleService {
    store: Arc<dyn CandleStore>,
    feed: Arc<dyn CandleFeed>,
    planner: RequestPlanner,
    options: ServiceOptions,
    next_job: AtomicU64,
    registry: Mutex<JobRegistry>,
    partitions: Mutex<HashMap<SeriesKey, Arc<Mutex<()>>>>,
}

impl CandleService {
    pub fn new(
        store: Arc<dyn CandleStore>,
        feed: Arc<dyn CandleFeed>,
        options: ServiceOptions,
    ) -> Result<Self, String> {
        let planner = RequestPlanner::new(options.page_limit, options.max_request_count)?;
        if options.job_history == 0 {
            return Err("job_history must be > 0".to_string());
        }
        Ok(Self {
            store,
            feed,
            planner,
            options,
            next_job: AtomicU64::new(1),
            registry: Mutex::new(JobRegistry::default()),
            partitions: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> ServiceOptions {
        self.options
    }

    pub fn get_candles(
        &self,
        instrument: &str,
        interval: Interval,
        request: CandleRequest,
    ) -> Result<CandlesResponse, CandleError> {
        self.get_candles_at(instrument, interval, request, Utc::now())
    }

    pub fn get_candles_at(
        &self,
        instrument: &str,
        interval: Interval,
        request: CandleRequest,
        now: DateTime<Utc>,
    ) -> Result<CandlesResponse, CandleError> {
        let ticket = self.submit_at(instrument, interval, request, now)?;
        self.collect(ticket)
    }

    pub fn submit(
        &self,
        instrument: &str,
        interval: Interval,
        request: CandleRequest,
    ) -> Result<JobTicket, CandleError> {
        self.submit_at(instrument, interval, request, Utc::now())
    }

    /// Validates and plans `request` against `now`. Nothing is registered when validation fails.
    pub fn submit_at(
        &self,
        instrument: &str,
        interval: Interval,
        request: CandleRequest,
        now: DateTime<Utc>,
    ) -> Result<JobTicket, CandleError> {
        let series = SeriesKey::new(instrument, interval);
        let plan = match self.planner.plan(&series, &request, now) {
            Ok(plan) => plan,
            Err(err) => {
                metrics::counter!(
                    "candlekeep.app.requests_rejected_total",
                    "kind" => err.kind()
                )
                .increment(1);
                tracing::info!(series = %series, error = %err, "request rejected");
                return Err(err);
            }
        };

        let job_id = JobId(self.next_job.fetch_add(1, Ordering::Relaxed));
        self.registry
            .lock()
            .register(job_id, &series, plan.range.count, self.options.job_history);
        metrics::counter!("candlekeep.app.jobs_submitted_total").increment(1);
        tracing::debug!(
            job = %job_id,
            series = %series,
            count = plan.range.count,
            chunks = plan.chunks.len(),
            "job submitted"
        );
        Ok(JobTicket { job_id, plan })
    }

    /// Runs a submitted job to a terminal phase. Jobs on the same partition run one at a time.
    pub fn collect(&self, ticket: JobTicket) -> Result<CandlesResponse, CandleError> {
        let JobTicket { job_id, plan } = ticket;
        let span = tracing::info_span!("app.candles.collect", job = %job_id, series = %plan.series);
        let _enter = span.enter();
        let started = Instant::now();

        let cancel = self
            .registry
            .lock()
            .jobs
            .get(&job_id)
            .map(|entry| entry.cancel.clone())
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

        let partition = self.partition_lock(&plan.series);
        let report = {
            let _guard = partition.lock();
            let collector = ChunkCollector::new(
                self.store.as_ref(),
                self.feed.as_ref(),
                CollectorOptions {
                    fill_empty_candles: self.options.fill_empty_candles,
                },
            )
            .with_cancel_flag(&cancel);
            collector.run(&plan, &mut |phase, state| {
                self.publish(job_id, phase, state, None);
            })
        };

        let failure_message = report.failure.as_ref().map(|f| f.error.to_string());
        self.publish(job_id, report.phase, &report.state, failure_message);

        let candles = match report.covered_until {
            Some(oldest) => self
                .store
                .range_query(&plan.series, plan.range.start, oldest)?,
            None => Vec::new(),
        };

        metrics::histogram!("candlekeep.app.collect_ms", "phase" => report.phase.as_str())
            .record(started.elapsed().as_millis() as f64);
        tracing::info!(
            phase = report.phase.as_str(),
            returned = candles.len(),
            "job collected"
        );

        Ok(CandlesResponse {
            job_id,
            candles,
            state: report.state,
            phase: report.phase,
            failure: report.failure,
            resolved_fillers: report.resolved_rows,
            resolver_errors: report.resolver_errors,
        })
    }

    pub fn get_collection_progress(&self, job_id: JobId) -> Option<CollectionProgress> {
        self.registry
            .lock()
            .jobs
            .get(&job_id)
            .map(|entry| entry.progress.clone())
    }

    /// Requests cancellation; the job stops before its next chunk. Returns false for unknown
    /// or already finished jobs.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let registry = self.registry.lock();
        match registry.jobs.get(&job_id) {
            Some(entry) if !entry.progress.phase.is_terminal() => {
                entry.cancel.store(true, Ordering::Release);
                tracing::info!(job = %job_id, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    fn publish(
        &self,
        job_id: JobId,
        phase: CollectionPhase,
        state: &CollectionState,
        failure: Option<String>,
    ) {
        if let Some(entry) = self.registry.lock().jobs.get_mut(&job_id) {
            entry.progress.phase = phase;
            entry.progress.state = state.clone();
            if failure.is_some() {
                entry.progress.failure = failure;
            }
        }
    }

    fn partition_lock(&self, series: &SeriesKey) -> Arc<Mutex<()>> {
        self.partitions
            .lock()
            .entry(series.clone())
            .or_default()
            .clone()
    }
}
