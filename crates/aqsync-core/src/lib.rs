//! Core domain model for aqsync: monitors, measurements, natural keys, watermarks
//! and the discovery-unit arithmetic shared by every source.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "aqsync-core";

/// The AQS API rejects requests naming more than five parameter codes.
pub const MAX_PARAMS_PER_REQUEST: usize = 5;

/// Logical stream a measurement was ingested through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Hourly pipe-delimited files published by AirNow.
    AirNow,
    /// EPA AQS `sampleData/bySite` REST API.
    Aqs,
}

impl SourceKind {
    pub fn stream_id(self) -> &'static str {
        match self {
            SourceKind::AirNow => "airnow",
            SourceKind::Aqs => "aqs",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stream_id())
    }
}

/// Site identifier in AQSID form: state (2) + county (3) + site (4).
///
/// AirNow files may carry a 3-digit country prefix (12 characters); the key is
/// kept verbatim so the watch-list comparison stays exact, and the component
/// accessors read from the trailing nine characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorKey(String);

impl MonitorKey {
    pub fn new(aqsid: impl Into<String>) -> Self {
        Self(aqsid.into().trim().to_string())
    }

    pub fn from_parts(state_code: &str, county_code: &str, site_number: &str) -> Self {
        Self(format!(
            "{:0>2}{:0>3}{:0>4}",
            state_code.trim(),
            county_code.trim(),
            site_number.trim()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn site_part(&self) -> &str {
        let len = self.0.len();
        if len >= 9 && self.0.is_char_boundary(len - 9) {
            &self.0[len - 9..]
        } else {
            &self.0
        }
    }

    pub fn state_code(&self) -> &str {
        self.site_part().get(0..2).unwrap_or_default()
    }

    pub fn county_code(&self) -> &str {
        self.site_part().get(2..5).unwrap_or_default()
    }

    pub fn site_number(&self) -> &str {
        self.site_part().get(5..9).unwrap_or_default()
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One parsed observation, common to both sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub source: SourceKind,
    pub monitor: MonitorKey,
    /// AirNow parameter name (`OZONE`, `PM2.5`) or AQS parameter code (`44201`).
    pub parameter: String,
    pub poc: Option<i16>,
    pub date_local: NaiveDate,
    pub time_local: NaiveTime,
    pub date_gmt: Option<NaiveDate>,
    pub time_gmt: Option<NaiveTime>,
    pub value: Option<Decimal>,
    pub unit: Option<String>,
    pub site_name: Option<String>,
    pub gmt_offset: Option<String>,
    pub latitude: Option<Decimal>,
    pub longitude: Option<Decimal>,
    pub detection_limit: Option<Decimal>,
    pub data_source: Option<String>,
    pub source_url: String,
    /// Source columns without a typed home (AQS method, qualifier, ...).
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Measurement {
    pub fn natural_key(&self) -> NaturalKey {
        match self.source {
            SourceKind::AirNow => NaturalKey {
                source: self.source,
                monitor: self.monitor.clone(),
                parameter: self.parameter.clone(),
                poc: None,
                date_local: self.date_local,
                time_local: self.time_local,
                date_gmt: None,
                time_gmt: None,
            },
            SourceKind::Aqs => NaturalKey {
                source: self.source,
                monitor: self.monitor.clone(),
                parameter: self.parameter.clone(),
                poc: self.poc,
                date_local: self.date_local,
                time_local: self.time_local,
                date_gmt: self.date_gmt,
                time_gmt: self.time_gmt,
            },
        }
    }

    /// Local observation time truncated to the hour, the watermark grain.
    pub fn local_hour(&self) -> NaiveDateTime {
        truncate_to_hour(self.date_local.and_time(self.time_local))
    }
}

/// Dedup identity of a measurement; the AirNow variant leaves POC and GMT unset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub source: SourceKind,
    pub monitor: MonitorKey,
    pub parameter: String,
    pub poc: Option<i16>,
    pub date_local: NaiveDate,
    pub time_local: NaiveTime,
    pub date_gmt: Option<NaiveDate>,
    pub time_gmt: Option<NaiveTime>,
}

/// Resume point of a stream: ingestion is complete through `hour` on `date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    pub date: NaiveDate,
    pub hour: u32,
}

impl Watermark {
    pub fn new(date: NaiveDate, hour: u32) -> Self {
        Self {
            date,
            hour: hour.min(23),
        }
    }

    pub fn from_datetime(ts: NaiveDateTime) -> Self {
        Self::new(ts.date(), ts.hour())
    }

    /// True when the hour unit `(date, hour)` is already covered.
    pub fn covers(&self, date: NaiveDate, hour: u32) -> bool {
        date == self.date && hour <= self.hour
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:02}:00", self.date, self.hour)
    }
}

/// How a key's resume hour is derived from the hours present in the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WatermarkPolicy {
    /// Latest ingested hour; a gap below it is never revisited.
    MaxSeen,
    /// Hour before the first missing hour inside the lookback window that ends
    /// at the key's latest hour.
    FirstGap { lookback_hours: u32 },
}

impl Default for WatermarkPolicy {
    fn default() -> Self {
        WatermarkPolicy::FirstGap { lookback_hours: 24 }
    }
}

pub fn truncate_to_hour(ts: NaiveDateTime) -> NaiveDateTime {
    ts.date()
        .and_time(NaiveTime::from_hms_opt(ts.hour(), 0, 0).unwrap_or(NaiveTime::MIN))
}

/// Resume hour of one key. `hours` must already be hour-truncated.
pub fn resume_hour_for_key(
    hours: &BTreeSet<NaiveDateTime>,
    policy: WatermarkPolicy,
) -> Option<NaiveDateTime> {
    let max = *hours.last()?;
    match policy {
        WatermarkPolicy::MaxSeen => Some(max),
        WatermarkPolicy::FirstGap { lookback_hours } => {
            let window_start = max - Duration::hours(i64::from(lookback_hours));
            let mut window = hours.range(window_start..=max);
            let mut prev = *window.next()?;
            for &hour in window {
                if hour - prev > Duration::hours(1) {
                    return Some(prev);
                }
                prev = hour;
            }
            Some(max)
        }
    }
}

/// Stream watermark: the minimum resume hour over every key with data.
/// Keys without any ingested hour do not participate; `None` means first run.
pub fn compute_watermark(
    hours_by_key: &BTreeMap<MonitorKey, BTreeSet<NaiveDateTime>>,
    policy: WatermarkPolicy,
) -> Option<Watermark> {
    hours_by_key
        .values()
        .filter_map(|hours| resume_hour_for_key(hours, policy))
        .min()
        .map(Watermark::from_datetime)
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub begin: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(begin: NaiveDate, end: NaiveDate) -> Self {
        Self { begin, end }
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.begin.iter_days().take_while(move |d| *d <= end)
    }
}

/// Split an inclusive range into sub-ranges that never cross a calendar year.
/// Returns nothing when `begin > end`.
pub fn split_year_aligned(range: DateRange) -> Vec<DateRange> {
    let mut out = Vec::new();
    let mut begin = range.begin;
    while begin <= range.end {
        let year_end = NaiveDate::from_ymd_opt(begin.year(), 12, 31).unwrap_or(range.end);
        let end = year_end.min(range.end);
        out.push(DateRange::new(begin, end));
        match end.succ_opt() {
            Some(next) => begin = next,
            None => break,
        }
    }
    out
}

/// Split parameter codes into batches of at most `max` (clamped to >= 1),
/// preserving order.
pub fn chunk_parameters(params: &[String], max: usize) -> Vec<Vec<String>> {
    params.chunks(max.max(1)).map(<[String]>::to_vec).collect()
}

/// One fetchable chunk of remote data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryUnit {
    /// One AirNow hourly file (UTC date and hour).
    Hour { date: NaiveDate, hour: u32 },
    /// One AQS request: a site, a same-year date range, up to five parameters.
    ApiBatch {
        site: MonitorKey,
        range: DateRange,
        parameters: Vec<String>,
    },
}

impl fmt::Display for DiscoveryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryUnit::Hour { date, hour } => write!(f, "{}T{:02}", date.format("%Y%m%d"), hour),
            DiscoveryUnit::ApiBatch {
                site,
                range,
                parameters,
            } => write!(
                f,
                "{}:{}-{}:{}",
                site,
                range.begin.format("%Y%m%d"),
                range.end.format("%Y%m%d"),
                parameters.join(",")
            ),
        }
    }
}

/// Cross product of sites, year-aligned sub-ranges and parameter batches.
pub fn api_units(sites: &[MonitorKey], range: DateRange, parameters: &[String]) -> Vec<DiscoveryUnit> {
    let ranges = split_year_aligned(range);
    let batches = chunk_parameters(parameters, MAX_PARAMS_PER_REQUEST);
    let mut units = Vec::with_capacity(sites.len() * ranges.len() * batches.len());
    for site in sites {
        for sub in &ranges {
            for batch in &batches {
                units.push(DiscoveryUnit::ApiBatch {
                    site: site.clone(),
                    range: *sub,
                    parameters: batch.clone(),
                });
            }
        }
    }
    units
}

/// Raw bytes of one fetched unit plus provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl RawPayload {
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Keep only measurements whose monitor is watched, preserving input order.
pub fn filter_watched(records: Vec<Measurement>, watch: &BTreeSet<MonitorKey>) -> Vec<Measurement> {
    records
        .into_iter()
        .filter(|m| watch.contains(&m.monitor))
        .collect()
}
