//! Sync orchestration: one pass per stream walks
//! watermark → discover → fetch → parse → filter → upsert, then refreshes
//! downstream aggregates exactly once.

pub mod config;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use aqsync_adapters::{
    AdapterContext, AirNowAdapter, AqsAdapter, DiscoveryBucket, ParseError, SourceAdapter,
};
use aqsync_core::{filter_watched, DateRange, DiscoveryUnit, MonitorKey, SourceKind, Watermark, WatermarkPolicy};
use aqsync_storage::{
    AggregateRefresher, FetchError, HttpFetcher, NoopAggregateRefresher, PgAggregateRefresher,
    PgAirNowSink, PgAqsSink, StagingSink, StoreError, WatermarkStore,
};

pub use config::{SyncConfig, Watchlist};

pub const CRATE_NAME: &str = "aqsync-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    ComputingWatermark,
    Discovering,
    Fetching,
    Parsing,
    Upserting,
    RefreshingAggregates,
}

/// Failure of a single discovery unit. Never ends a pass on its own, except
/// for an unreachable store.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientFetch,
    PermanentFetch,
    Parse,
    Store,
}

impl UnitError {
    pub fn kind(&self) -> FailureKind {
        match self {
            UnitError::Fetch(err) if err.is_transient() => FailureKind::TransientFetch,
            UnitError::Fetch(_) => FailureKind::PermanentFetch,
            UnitError::Parse(_) => FailureKind::Parse,
            UnitError::Store(_) => FailureKind::Store,
        }
    }
}

#[derive(Debug, Error)]
pub enum PassError {
    #[error("a {0} pass is already running")]
    AlreadyRunning(SourceKind),
    #[error("no {0} stream is configured")]
    NotConfigured(SourceKind),
    #[error("{stream} pass aborted: {source}")]
    Aborted {
        stream: SourceKind,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub stream: SourceKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub watermark_before: Option<Watermark>,
    pub watermark_after: Option<Watermark>,
    pub units_discovered: usize,
    pub units_skipped: usize,
    pub units_succeeded: usize,
    pub records_parsed: usize,
    pub records_kept: usize,
    pub records_inserted: usize,
    pub failures: Vec<UnitFailure>,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    pub refreshed: bool,
    pub refresh_error: Option<String>,
    pub report_path: Option<PathBuf>,
}

impl PassSummary {
    fn start(run_id: Uuid, stream: SourceKind) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            stream,
            started_at: now,
            finished_at: now,
            watermark_before: None,
            watermark_after: None,
            units_discovered: 0,
            units_skipped: 0,
            units_succeeded: 0,
            records_parsed: 0,
            records_kept: 0,
            records_inserted: 0,
            failures: Vec::new(),
            failures_by_kind: BTreeMap::new(),
            refreshed: false,
            refresh_error: None,
            report_path: None,
        }
    }

    fn record_failure(&mut self, unit: &DiscoveryUnit, err: &UnitError) {
        let kind = err.kind();
        *self.failures_by_kind.entry(kind).or_default() += 1;
        self.failures.push(UnitFailure {
            unit: unit.to_string(),
            kind,
            message: err.to_string(),
        });
    }
}

/// An API backfill request. Empty `sites` or `parameters` fall back to the
/// watch-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSyncRequest {
    pub begin: NaiveDate,
    pub end: NaiveDate,
    pub sites: Vec<MonitorKey>,
    pub parameters: Vec<String>,
    /// Start from the stream watermark's day when it is later than `begin`.
    pub resume: bool,
}

impl ApiSyncRequest {
    pub fn new(begin: NaiveDate, end: NaiveDate) -> Self {
        Self {
            begin,
            end,
            sites: Vec::new(),
            parameters: Vec::new(),
            resume: false,
        }
    }
}

struct UnitOutcome {
    parsed: usize,
    kept: usize,
    inserted: usize,
}

struct Stream {
    adapter: Arc<dyn SourceAdapter>,
    sink: Arc<dyn StagingSink>,
    watermarks: WatermarkStore,
    gate: Mutex<()>,
    phase: watch::Sender<SyncPhase>,
}

impl Stream {
    fn new(adapter: Arc<dyn SourceAdapter>, sink: Arc<dyn StagingSink>, policy: WatermarkPolicy) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            adapter,
            watermarks: WatermarkStore::new(sink.clone(), policy),
            sink,
            gate: Mutex::new(()),
            phase,
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    watchlist: Watchlist,
    streams: BTreeMap<SourceKind, Stream>,
    refresher: Arc<dyn AggregateRefresher>,
}

impl SyncPipeline {
    /// A pipeline with no streams and a no-op refresher; wire streams with
    /// [`SyncPipeline::with_stream`].
    pub fn new(config: SyncConfig, watchlist: Watchlist) -> Self {
        Self {
            config,
            watchlist,
            streams: BTreeMap::new(),
            refresher: Arc::new(NoopAggregateRefresher),
        }
    }

    /// Production wiring: Postgres staging sinks, the shared rate-limited
    /// fetcher, and both source adapters. The AQS stream is registered only
    /// when API credentials are configured.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let watchlist = Watchlist::load(&config.watchlist_path).await?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await
            .context("connecting to staging database")?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let policy = config.watermark_policy;

        let airnow_sink = PgAirNowSink::new(pool.clone(), &config.airnow_table, config.batch_size)
            .context("configuring airnow staging sink")?;
        let airnow = AirNowAdapter::new(http.clone(), config.airnow.clone());

        let mut pipeline = Self::new(config.clone(), watchlist)
            .with_stream(Arc::new(airnow), Arc::new(airnow_sink), policy);

        if config.aqs_configured() {
            let aqs_sink = PgAqsSink::new(pool.clone(), &config.aqs_table, config.batch_size)
                .context("configuring aqs staging sink")?;
            let aqs = AqsAdapter::new(http, config.aqs_endpoint.clone(), config.aqs_credentials.clone());
            pipeline = pipeline.with_stream(Arc::new(aqs), Arc::new(aqs_sink), policy);
        } else {
            info!("AQS_API_EMAIL/AQS_API_KEY unset; aqs stream disabled");
        }

        if let Some(statement) = &config.refresh_sql {
            pipeline = pipeline.with_refresher(Arc::new(PgAggregateRefresher::new(pool, statement.clone())));
        }
        Ok(pipeline)
    }

    /// Register the stream served by `adapter`, replacing any previous one.
    pub fn with_stream(
        mut self,
        adapter: Arc<dyn SourceAdapter>,
        sink: Arc<dyn StagingSink>,
        policy: WatermarkPolicy,
    ) -> Self {
        self.streams.insert(adapter.source(), Stream::new(adapter, sink, policy));
        self
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn AggregateRefresher>) -> Self {
        self.refresher = refresher;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Phase updates for one stream; `None` when the stream is not wired.
    pub fn subscribe(&self, source: SourceKind) -> Option<watch::Receiver<SyncPhase>> {
        self.streams.get(&source).map(|s| s.phase.subscribe())
    }

    fn stream(&self, source: SourceKind) -> Result<&Stream, PassError> {
        self.streams.get(&source).ok_or(PassError::NotConfigured(source))
    }

    /// Create every registered staging table.
    pub async fn migrate(&self) -> Result<()> {
        for (source, stream) in &self.streams {
            stream
                .sink
                .create_if_missing()
                .await
                .with_context(|| format!("creating {source} staging table"))?;
        }
        Ok(())
    }

    pub async fn watermark(&self, source: SourceKind) -> Result<Option<Watermark>> {
        let stream = self.stream(source)?;
        let keys = self.watchlist.monitor_keys();
        Ok(stream.watermarks.latest_for(&keys).await?)
    }

    /// One AirNow pass up to the current UTC day.
    pub async fn run_once(&self) -> Result<PassSummary, PassError> {
        self.run_once_at(Utc::now()).await
    }

    /// One AirNow pass from the stream watermark's day through `now`'s UTC day.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<PassSummary, PassError> {
        let stream = self.stream(SourceKind::AirNow)?;
        let _pass = stream
            .gate
            .try_lock()
            .map_err(|_| PassError::AlreadyRunning(SourceKind::AirNow))?;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_pass", stream = %SourceKind::AirNow, %run_id);
        let result = self
            .airnow_pass(stream, run_id, now.date_naive())
            .instrument(span)
            .await;
        stream.set_phase(SyncPhase::Idle);
        self.finish(result).await
    }

    async fn airnow_pass(&self, stream: &Stream, run_id: Uuid, today: NaiveDate) -> Result<PassSummary, PassError> {
        let ctx = AdapterContext::new(run_id);
        let keys = self.watchlist.monitor_keys();
        let mut summary = PassSummary::start(run_id, SourceKind::AirNow);

        stream.set_phase(SyncPhase::ComputingWatermark);
        let before = self.read_watermark(stream, &keys).await?;
        summary.watermark_before = before;
        let first_day = before.map(|w| w.date).unwrap_or(self.config.default_start);
        info!(watermark = ?before.map(|w| w.to_string()), %first_day, %today, "starting airnow pass");

        for day in DateRange::new(first_day, today).days() {
            stream.set_phase(SyncPhase::Discovering);
            let units = stream.adapter.discover(&ctx, &DiscoveryBucket::Day(day)).await;
            summary.units_discovered += units.len();

            for unit in units {
                if let (Some(w), DiscoveryUnit::Hour { date, hour }) = (before, &unit) {
                    if w.covers(*date, *hour) {
                        debug!(%unit, "already covered by watermark");
                        summary.units_skipped += 1;
                        continue;
                    }
                }
                self.run_unit(stream, &ctx, &unit, &keys, &mut summary).await?;
            }
        }

        self.complete(stream, &keys, summary).await
    }

    /// One AQS API pass over `request`.
    pub async fn run_backfill(&self, request: ApiSyncRequest) -> Result<PassSummary, PassError> {
        let stream = self.stream(SourceKind::Aqs)?;
        let _pass = stream
            .gate
            .try_lock()
            .map_err(|_| PassError::AlreadyRunning(SourceKind::Aqs))?;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_pass", stream = %SourceKind::Aqs, %run_id);
        let result = self.api_pass(stream, run_id, request).instrument(span).await;
        stream.set_phase(SyncPhase::Idle);
        self.finish(result).await
    }

    async fn api_pass(&self, stream: &Stream, run_id: Uuid, request: ApiSyncRequest) -> Result<PassSummary, PassError> {
        let ctx = AdapterContext::new(run_id);
        let sites = if request.sites.is_empty() {
            self.watchlist.sites()
        } else {
            request.sites.clone()
        };
        let parameters = if request.parameters.is_empty() {
            self.watchlist.parameter_codes()
        } else {
            request.parameters.clone()
        };
        let keys: BTreeSet<MonitorKey> = sites.iter().cloned().collect();
        let mut summary = PassSummary::start(run_id, SourceKind::Aqs);

        stream.set_phase(SyncPhase::ComputingWatermark);
        let before = self.read_watermark(stream, &keys).await?;
        summary.watermark_before = before;

        let begin = match before {
            Some(w) if request.resume && w.date > request.begin => w.date,
            _ => request.begin,
        };
        let range = DateRange::new(begin, request.end);
        info!(%begin, end = %request.end, sites = sites.len(), parameters = parameters.len(), "starting aqs pass");

        stream.set_phase(SyncPhase::Discovering);
        let bucket = DiscoveryBucket::Api {
            sites,
            range,
            parameters,
        };
        let units = stream.adapter.discover(&ctx, &bucket).await;
        summary.units_discovered = units.len();

        for unit in &units {
            self.run_unit(stream, &ctx, unit, &keys, &mut summary).await?;
        }

        self.complete(stream, &keys, summary).await
    }

    /// Run both streams concurrently with independent rate-limit budgets.
    pub async fn run_all(
        &self,
        request: ApiSyncRequest,
    ) -> (Result<PassSummary, PassError>, Result<PassSummary, PassError>) {
        tokio::join!(self.run_once(), self.run_backfill(request))
    }

    async fn read_watermark(
        &self,
        stream: &Stream,
        keys: &BTreeSet<MonitorKey>,
    ) -> Result<Option<Watermark>, PassError> {
        stream
            .watermarks
            .latest_for(keys)
            .await
            .map_err(|source| PassError::Aborted {
                stream: stream.adapter.source(),
                source,
            })
    }

    /// Process one unit, folding its outcome into `summary`. Only an
    /// unreachable store escapes as an error.
    async fn run_unit(
        &self,
        stream: &Stream,
        ctx: &AdapterContext,
        unit: &DiscoveryUnit,
        keys: &BTreeSet<MonitorKey>,
        summary: &mut PassSummary,
    ) -> Result<(), PassError> {
        match self.process_unit(stream, ctx, unit, keys).await {
            Ok(outcome) => {
                summary.units_succeeded += 1;
                summary.records_parsed += outcome.parsed;
                summary.records_kept += outcome.kept;
                summary.records_inserted += outcome.inserted;
                info!(%unit, parsed = outcome.parsed, kept = outcome.kept, inserted = outcome.inserted, "unit staged");
                Ok(())
            }
            Err(UnitError::Store(source)) if source.is_unavailable() => {
                error!(%unit, error = %source, "staging store unavailable; aborting pass");
                Err(PassError::Aborted {
                    stream: stream.adapter.source(),
                    source,
                })
            }
            Err(err) => {
                match &err {
                    UnitError::Fetch(e) => warn!(%unit, url = e.url(), error = %e, "fetch failed; unit left for next pass"),
                    UnitError::Parse(e) => error!(%unit, error = %e, "payload rejected"),
                    UnitError::Store(e) => error!(%unit, error = %e, "staging statement rejected"),
                }
                summary.record_failure(unit, &err);
                Ok(())
            }
        }
    }

    async fn process_unit(
        &self,
        stream: &Stream,
        ctx: &AdapterContext,
        unit: &DiscoveryUnit,
        keys: &BTreeSet<MonitorKey>,
    ) -> Result<UnitOutcome, UnitError> {
        stream.set_phase(SyncPhase::Fetching);
        let payload = stream.adapter.fetch(ctx, unit).await?;

        stream.set_phase(SyncPhase::Parsing);
        let parsed = stream.adapter.parse(&payload)?;
        let parsed_count = parsed.len();
        let kept = filter_watched(parsed, keys);

        stream.set_phase(SyncPhase::Upserting);
        let inserted = if kept.is_empty() {
            0
        } else {
            stream.sink.upsert(&kept).await?
        };
        Ok(UnitOutcome {
            parsed: parsed_count,
            kept: kept.len(),
            inserted,
        })
    }

    async fn complete(
        &self,
        stream: &Stream,
        keys: &BTreeSet<MonitorKey>,
        mut summary: PassSummary,
    ) -> Result<PassSummary, PassError> {
        stream.set_phase(SyncPhase::RefreshingAggregates);
        match self.refresher.refresh().await {
            Ok(()) => summary.refreshed = true,
            Err(err) => {
                error!(error = %err, "aggregate refresh failed");
                summary.refresh_error = Some(err.to_string());
            }
        }

        summary.watermark_after = match stream.watermarks.latest_for(keys).await {
            Ok(w) => w,
            Err(err) => {
                warn!(error = %err, "could not read watermark after pass");
                None
            }
        };
        summary.finished_at = Utc::now();
        info!(
            units = summary.units_discovered,
            skipped = summary.units_skipped,
            failed = summary.failures.len(),
            inserted = summary.records_inserted,
            watermark = ?summary.watermark_after.map(|w| w.to_string()),
            "pass complete"
        );
        Ok(summary)
    }

    async fn finish(&self, result: Result<PassSummary, PassError>) -> Result<PassSummary, PassError> {
        let mut summary = result?;
        if let Some(dir) = &self.config.reports_dir {
            match write_report(dir, &summary).await {
                Ok(path) => summary.report_path = Some(path),
                Err(err) => warn!(error = %err, "could not write pass report"),
            }
        }
        Ok(summary)
    }

    /// Cron job running one AirNow pass per tick, or `None` when scheduling
    /// is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.airnow_sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, inserted = summary.records_inserted, "scheduled airnow pass finished"),
                    Err(PassError::AlreadyRunning(_)) => info!("previous airnow pass still running; tick skipped"),
                    Err(err) => error!(error = %err, "scheduled airnow pass failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Write `summary` to `<dir>/<stream>/<run_id>.json`.
pub async fn write_report(dir: &Path, summary: &PassSummary) -> Result<PathBuf> {
    let stream_dir = dir.join(summary.stream.stream_id());
    fs::create_dir_all(&stream_dir)
        .await
        .with_context(|| format!("creating {}", stream_dir.display()))?;
    let path = stream_dir.join(format!("{}.json", summary.run_id));
    let bytes = serde_json::to_vec_pretty(summary).context("serializing pass summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub async fn run_sync_once_from_env() -> Result<PassSummary> {
    let pipeline = SyncPipeline::connect(SyncConfig::from_env()).await?;
    Ok(pipeline.run_once().await?)
}
