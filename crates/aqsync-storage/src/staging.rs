//! Staging sinks: natural-key insert-if-absent stores, the watermark queries
//! that run against them, and the downstream aggregate refresh trigger.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, info};

use aqsync_core::{
    compute_watermark, truncate_to_hour, Measurement, MonitorKey, NaturalKey, SourceKind,
    Watermark, WatermarkPolicy,
};

/// Per-key set of hour-truncated local timestamps present in a sink.
pub type WatermarkInputs = BTreeMap<MonitorKey, BTreeSet<NaiveDateTime>>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection, pool or transport failure. Aborts the current pass.
    #[error("staging store unavailable: {0}")]
    Unavailable(String),
    /// A statement failed on a reachable store. Fails only the current unit.
    #[error("staging statement rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => StoreError::Unavailable(err.to_string()),
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

/// Capability every staging table offers the orchestrator.
#[async_trait]
pub trait StagingSink: Send + Sync {
    fn source(&self) -> SourceKind;

    async fn create_if_missing(&self) -> Result<(), StoreError>;

    /// Insert records whose natural key is absent; returns the inserted count.
    /// Duplicates, within the input or against stored rows, are skipped silently.
    async fn upsert(&self, records: &[Measurement]) -> Result<usize, StoreError>;

    /// Hours ingested per key within `lookback_hours` of that key's latest hour.
    /// A lookback of zero yields only each key's latest hour.
    async fn watermark_inputs(
        &self,
        keys: &BTreeSet<MonitorKey>,
        lookback_hours: u32,
    ) -> Result<WatermarkInputs, StoreError>;
}

/// First occurrence of every natural key, in input order.
pub fn dedup_first(records: &[Measurement]) -> Vec<&Measurement> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .iter()
        .filter(|m| seen.insert(m.natural_key()))
        .collect()
}

/// Accepts `name` or `schema.name` made of ASCII identifier characters.
pub fn validate_table_name(name: &str) -> Result<String, StoreError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_part(p)) {
        Ok(name.to_string())
    } else {
        Err(StoreError::Rejected(format!("invalid staging table name `{name}`")))
    }
}

fn index_name(table: &str) -> String {
    let bare = table.rsplit('.').next().unwrap_or(table);
    format!("{bare}_natural_key")
}

/// Bind parameters Postgres accepts in a single statement.
const PG_MAX_BINDS: usize = 65_535;

const AIRNOW_COLUMNS: &str = "date_local, time_local, aqsid, site_name, gmt_offset, parameter_name, \
     reporting_units, reported_value, data_source, source_url";
const AIRNOW_NATURAL_KEY: &str = "aqsid, date_local, time_local, parameter_name";

const AQS_COLUMNS: &str = "aqsid, state_code, county_code, site_number, parameter_code, poc, \
     latitude, longitude, date_local, time_local, date_gmt, time_gmt, sample_measurement, \
     units_of_measure, detection_limit, attributes, source_url";
const AQS_NATURAL_KEY: &str =
    "state_code, county_code, site_number, parameter_code, poc, date_local, time_local, date_gmt, time_gmt";

fn column_count(columns: &str) -> usize {
    columns.split(',').count()
}

/// Largest batch not above `requested` whose binds fit one statement.
fn capped_batch_size(requested: usize, columns: &str) -> usize {
    requested.clamp(1, PG_MAX_BINDS / column_count(columns))
}

fn unique_index_sql(table: &str, natural_key: &str) -> String {
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {table} ({natural_key})",
        index_name(table)
    )
}

fn airnow_insert(table: &str, batch: &[&Measurement]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO {table} ({AIRNOW_COLUMNS}) "));
    qb.push_values(batch, |mut b, m| {
        b.push_bind(m.date_local)
            .push_bind(m.time_local)
            .push_bind(m.monitor.as_str().to_string())
            .push_bind(m.site_name.clone())
            .push_bind(m.gmt_offset.clone())
            .push_bind(m.parameter.clone())
            .push_bind(m.unit.clone())
            .push_bind(m.value)
            .push_bind(m.data_source.clone())
            .push_bind(m.source_url.clone());
    });
    qb.push(format!(" ON CONFLICT ({AIRNOW_NATURAL_KEY}) DO NOTHING"));
    qb
}

type AqsRow<'a> = (&'a Measurement, i16, NaiveDate, NaiveTime);

fn aqs_insert(table: &str, batch: &[AqsRow<'_>]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO {table} ({AQS_COLUMNS}) "));
    qb.push_values(batch, |mut b, (m, poc, date_gmt, time_gmt)| {
        b.push_bind(m.monitor.as_str().to_string())
            .push_bind(m.monitor.state_code().to_string())
            .push_bind(m.monitor.county_code().to_string())
            .push_bind(m.monitor.site_number().to_string())
            .push_bind(m.parameter.clone())
            .push_bind(*poc)
            .push_bind(m.latitude)
            .push_bind(m.longitude)
            .push_bind(m.date_local)
            .push_bind(m.time_local)
            .push_bind(*date_gmt)
            .push_bind(*time_gmt)
            .push_bind(m.value)
            .push_bind(m.unit.clone())
            .push_bind(m.detection_limit)
            .push_bind(serde_json::Value::Object(m.attributes.clone()))
            .push_bind(m.source_url.clone());
    });
    qb.push(format!(" ON CONFLICT ({AQS_NATURAL_KEY}) DO NOTHING"));
    qb
}

/// Widest lookback either sink honours, a thousand years. Keeps
/// `make_interval` within `int` and timestamp arithmetic in range.
const MAX_WINDOW_HOURS: u32 = 24 * 366 * 1000;

fn interval_hours(lookback_hours: u32) -> i32 {
    i32::try_from(lookback_hours.min(MAX_WINDOW_HOURS)).unwrap_or(i32::MAX)
}

fn rows_to_inputs(rows: Vec<sqlx::postgres::PgRow>) -> Result<WatermarkInputs, StoreError> {
    let mut inputs = WatermarkInputs::new();
    for row in rows {
        let aqsid: String = row.try_get("aqsid")?;
        let hour: NaiveDateTime = row.try_get("hour_ts")?;
        inputs
            .entry(MonitorKey::new(aqsid))
            .or_default()
            .insert(truncate_to_hour(hour));
    }
    Ok(inputs)
}

async fn query_watermark_inputs(
    pool: &PgPool,
    table: &str,
    keys: &BTreeSet<MonitorKey>,
    lookback_hours: u32,
) -> Result<WatermarkInputs, StoreError> {
    if keys.is_empty() {
        return Ok(WatermarkInputs::new());
    }
    let aqsids: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
    let sql = format!(
        r#"
        WITH latest AS (
            SELECT aqsid, MAX(date_local + time_local) AS max_ts
              FROM {table}
             WHERE aqsid = ANY($1)
             GROUP BY aqsid
        )
        SELECT DISTINCT s.aqsid, date_trunc('hour', s.date_local + s.time_local) AS hour_ts
          FROM {table} s
          JOIN latest l ON l.aqsid = s.aqsid
         WHERE s.date_local + s.time_local >= l.max_ts - make_interval(hours => $2)
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(&aqsids)
        .bind(interval_hours(lookback_hours))
        .fetch_all(pool)
        .await?;
    rows_to_inputs(rows)
}

/// Staging table for AirNow hourly files, unique on
/// `(aqsid, date_local, time_local, parameter_name)`. Batches are capped so one
/// statement never exceeds the bind limit.
#[derive(Debug, Clone)]
pub struct PgAirNowSink {
    pool: PgPool,
    table: String,
    batch_size: usize,
}

impl PgAirNowSink {
    pub fn new(pool: PgPool, table: &str, batch_size: usize) -> Result<Self, StoreError> {
        Ok(Self {
            pool,
            table: validate_table_name(table)?,
            batch_size: capped_batch_size(batch_size, AIRNOW_COLUMNS),
        })
    }
}

#[async_trait]
impl StagingSink for PgAirNowSink {
    fn source(&self) -> SourceKind {
        SourceKind::AirNow
    }

    async fn create_if_missing(&self) -> Result<(), StoreError> {
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                date_local DATE NOT NULL,
                time_local TIME NOT NULL,
                aqsid TEXT NOT NULL,
                site_name TEXT,
                gmt_offset TEXT,
                parameter_name TEXT NOT NULL,
                reporting_units TEXT,
                reported_value NUMERIC(14, 5),
                data_source TEXT,
                source_url TEXT NOT NULL,
                ingested_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            self.table
        );
        sqlx::query(&create).execute(&self.pool).await?;

        sqlx::query(&unique_index_sql(&self.table, AIRNOW_NATURAL_KEY)).execute(&self.pool).await?;
        info!(table = %self.table, "airnow staging table ready");
        Ok(())
    }

    async fn upsert(&self, records: &[Measurement]) -> Result<usize, StoreError> {
        let unique = dedup_first(records);
        let mut inserted = 0usize;
        for batch in unique.chunks(self.batch_size) {
            let mut qb = airnow_insert(&self.table, batch);
            let result = qb.build().execute(&self.pool).await?;
            inserted += result.rows_affected() as usize;
        }
        debug!(table = %self.table, offered = records.len(), inserted, "airnow upsert");
        Ok(inserted)
    }

    async fn watermark_inputs(
        &self,
        keys: &BTreeSet<MonitorKey>,
        lookback_hours: u32,
    ) -> Result<WatermarkInputs, StoreError> {
        query_watermark_inputs(&self.pool, &self.table, keys, lookback_hours).await
    }
}

/// Staging table for AQS API rows, unique on the site, parameter, POC and both
/// local and GMT timestamps.
#[derive(Debug, Clone)]
pub struct PgAqsSink {
    pool: PgPool,
    table: String,
    batch_size: usize,
}

impl PgAqsSink {
    pub fn new(pool: PgPool, table: &str, batch_size: usize) -> Result<Self, StoreError> {
        Ok(Self {
            pool,
            table: validate_table_name(table)?,
            batch_size: capped_batch_size(batch_size, AQS_COLUMNS),
        })
    }
}

#[async_trait]
impl StagingSink for PgAqsSink {
    fn source(&self) -> SourceKind {
        SourceKind::Aqs
    }

    async fn create_if_missing(&self) -> Result<(), StoreError> {
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                aqsid TEXT NOT NULL,
                state_code TEXT NOT NULL,
                county_code TEXT NOT NULL,
                site_number TEXT NOT NULL,
                parameter_code TEXT NOT NULL,
                poc SMALLINT NOT NULL,
                latitude NUMERIC(9, 6),
                longitude NUMERIC(9, 6),
                date_local DATE NOT NULL,
                time_local TIME NOT NULL,
                date_gmt DATE NOT NULL,
                time_gmt TIME NOT NULL,
                sample_measurement NUMERIC(14, 5),
                units_of_measure TEXT,
                detection_limit NUMERIC(14, 5),
                attributes JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                source_url TEXT NOT NULL,
                ingested_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            self.table
        );
        sqlx::query(&create).execute(&self.pool).await?;

        sqlx::query(&unique_index_sql(&self.table, AQS_NATURAL_KEY)).execute(&self.pool).await?;
        info!(table = %self.table, "aqs staging table ready");
        Ok(())
    }

    async fn upsert(&self, records: &[Measurement]) -> Result<usize, StoreError> {
        let mut rows: Vec<AqsRow<'_>> = Vec::with_capacity(records.len());
        for m in dedup_first(records) {
            let (Some(poc), Some(date_gmt), Some(time_gmt)) = (m.poc, m.date_gmt, m.time_gmt) else {
                return Err(StoreError::Rejected(format!(
                    "aqs record for {} at {} {} lacks poc or gmt timestamp",
                    m.monitor, m.date_local, m.time_local
                )));
            };
            rows.push((m, poc, date_gmt, time_gmt));
        }

        let mut inserted = 0usize;
        for batch in rows.chunks(self.batch_size) {
            let mut qb = aqs_insert(&self.table, batch);
            let result = qb.build().execute(&self.pool).await?;
            inserted += result.rows_affected() as usize;
        }
        debug!(table = %self.table, offered = records.len(), inserted, "aqs upsert");
        Ok(inserted)
    }

    async fn watermark_inputs(
        &self,
        keys: &BTreeSet<MonitorKey>,
        lookback_hours: u32,
    ) -> Result<WatermarkInputs, StoreError> {
        query_watermark_inputs(&self.pool, &self.table, keys, lookback_hours).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    keys: HashSet<NaturalKey>,
    rows: Vec<Measurement>,
}

/// In-process sink with the same insert-if-absent semantics as the Postgres
/// tables. Used for dry runs and tests.
#[derive(Debug)]
pub struct MemoryStagingSink {
    source: SourceKind,
    state: Mutex<MemoryState>,
}

impl MemoryStagingSink {
    pub fn new(source: SourceKind) -> Self {
        Self {
            source,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory sink lock poisoned".to_string()))
    }

    /// Snapshot of stored rows in insertion order.
    pub fn rows(&self) -> Vec<Measurement> {
        self.lock().map(|s| s.rows.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.rows.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StagingSink for MemoryStagingSink {
    fn source(&self) -> SourceKind {
        self.source
    }

    async fn create_if_missing(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert(&self, records: &[Measurement]) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let mut inserted = 0usize;
        for record in records {
            if state.keys.insert(record.natural_key()) {
                state.rows.push(record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn watermark_inputs(
        &self,
        keys: &BTreeSet<MonitorKey>,
        lookback_hours: u32,
    ) -> Result<WatermarkInputs, StoreError> {
        let state = self.lock()?;
        let mut latest: BTreeMap<&MonitorKey, NaiveDateTime> = BTreeMap::new();
        for row in state.rows.iter().filter(|r| keys.contains(&r.monitor)) {
            let ts = row.date_local.and_time(row.time_local);
            latest
                .entry(&row.monitor)
                .and_modify(|max| *max = (*max).max(ts))
                .or_insert(ts);
        }

        let lookback = Duration::hours(i64::from(interval_hours(lookback_hours)));
        let mut inputs = WatermarkInputs::new();
        for row in &state.rows {
            let Some(max) = latest.get(&row.monitor) else {
                continue;
            };
            let ts = row.date_local.and_time(row.time_local);
            if ts >= max.checked_sub_signed(lookback).unwrap_or(NaiveDateTime::MIN) {
                inputs
                    .entry(row.monitor.clone())
                    .or_default()
                    .insert(truncate_to_hour(ts));
            }
        }
        Ok(inputs)
    }
}

/// Answers "resume from where" for one stream from the contents of its sink.
#[derive(Clone)]
pub struct WatermarkStore {
    sink: Arc<dyn StagingSink>,
    policy: WatermarkPolicy,
}

impl WatermarkStore {
    pub fn new(sink: Arc<dyn StagingSink>, policy: WatermarkPolicy) -> Self {
        Self { sink, policy }
    }

    /// `Ok(None)` when none of `keys` has ingested data yet.
    pub async fn latest_for(&self, keys: &BTreeSet<MonitorKey>) -> Result<Option<Watermark>, StoreError> {
        let lookback = match self.policy {
            WatermarkPolicy::MaxSeen => 0,
            WatermarkPolicy::FirstGap { lookback_hours } => lookback_hours,
        };
        let inputs = self.sink.watermark_inputs(keys, lookback).await?;
        Ok(compute_watermark(&inputs, self.policy))
    }
}

/// Downstream trigger run once after each completed pass.
#[async_trait]
pub trait AggregateRefresher: Send + Sync {
    async fn refresh(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAggregateRefresher;

#[async_trait]
impl AggregateRefresher for NoopAggregateRefresher {
    async fn refresh(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Runs one configured statement, typically a stored procedure call.
#[derive(Debug, Clone)]
pub struct PgAggregateRefresher {
    pool: PgPool,
    statement: String,
}

impl PgAggregateRefresher {
    pub fn new(pool: PgPool, statement: impl Into<String>) -> Self {
        Self {
            pool,
            statement: statement.into(),
        }
    }
}

#[async_trait]
impl AggregateRefresher for PgAggregateRefresher {
    async fn refresh(&self) -> Result<(), StoreError> {
        sqlx::query(&self.statement).execute(&self.pool).await?;
        Ok(())
    }
}
