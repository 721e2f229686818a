//! AirNow hourly file feed: per-day listing discovery and the pipe-delimited
//! `HourlyData_{yyyymmdd}{hh}.dat` format.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use aqsync_core::{DiscoveryUnit, Measurement, MonitorKey, RawPayload, SourceKind};
use aqsync_storage::{FetchError, HttpFetcher};

use crate::{
    parse_clock, parse_decimal, text_or_none, AdapterContext, DiscoveryBucket, ParseError,
    SourceAdapter,
};

pub const LISTING_LIMIT_KEY: &str = "airnow-listing";
pub const FILE_LIMIT_KEY: &str = "airnow-files";
pub const DEFAULT_BASE: &str = "https://files.airnowtech.org/airnow";

const COLUMN_COUNT: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirNowEndpoints {
    pub listing_base: String,
    pub file_base: String,
}

impl Default for AirNowEndpoints {
    fn default() -> Self {
        Self {
            listing_base: DEFAULT_BASE.to_string(),
            file_base: DEFAULT_BASE.to_string(),
        }
    }
}

impl AirNowEndpoints {
    pub fn listing_url(&self, date: NaiveDate) -> String {
        format!(
            "{}/{}/{}/",
            self.listing_base.trim_end_matches('/'),
            date.format("%Y"),
            date.format("%Y%m%d")
        )
    }

    pub fn file_url(&self, date: NaiveDate, hour: u32) -> String {
        format!(
            "{}/{}/{}/{}",
            self.file_base.trim_end_matches('/'),
            date.format("%Y"),
            date.format("%Y%m%d"),
            file_name(date, hour)
        )
    }
}

pub fn file_name(date: NaiveDate, hour: u32) -> String {
    format!("HourlyData_{}{:02}.dat", date.format("%Y%m%d"), hour)
}

/// Hours of `date` whose hourly file is named in a directory listing. Reads
/// HTML anchors and S3-style `<Key>` entries; results are unique and ascending.
pub fn hours_from_listing(listing: &str, date: NaiveDate) -> Vec<u32> {
    let prefix = format!("HourlyData_{}", date.format("%Y%m%d"));
    let document = Html::parse_document(listing);
    let mut candidates: Vec<String> = Vec::new();

    if let Ok(anchors) = Selector::parse("a[href]") {
        candidates.extend(
            document
                .select(&anchors)
                .filter_map(|n| n.value().attr("href"))
                .map(str::to_string),
        );
    }
    if let Ok(keys) = Selector::parse("key") {
        candidates.extend(document.select(&keys).map(|n| n.text().collect::<String>()));
    }

    candidates
        .iter()
        .filter_map(|c| hour_in_name(c, &prefix))
        .collect::<BTreeSet<u32>>()
        .into_iter()
        .collect()
}

fn hour_in_name(candidate: &str, prefix: &str) -> Option<u32> {
    let candidate = candidate.trim();
    let start = candidate.find(prefix)? + prefix.len();
    let rest = candidate.get(start..)?;
    let digits = rest.get(..2)?;
    if rest.get(2..) != Some(".dat") || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = digits.parse().ok()?;
    (hour < 24).then_some(hour)
}

/// US `MM/DD/YY`, or `MM/DD/YYYY` when the year has four digits.
fn parse_valid_date(raw: &str, url: &str, row: usize) -> Result<NaiveDate, ParseError> {
    let trimmed = raw.trim();
    let four_digit_year = trimmed.rsplit('/').next().is_some_and(|y| y.len() == 4);
    let format = if four_digit_year { "%m/%d/%Y" } else { "%m/%d/%y" };
    NaiveDate::parse_from_str(trimmed, format).map_err(|_| ParseError::InvalidField {
        url: url.to_string(),
        row,
        field: "valid date",
        value: trimmed.to_string(),
    })
}

/// Parse one hourly file. Rows are
/// `date|time|aqsid|site|gmt_offset|parameter|units|value|data_source`.
pub fn parse_hourly_file(url: &str, text: &str) -> Result<Vec<Measurement>, ParseError> {
    let mut out = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let row = index + 1;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split('|').collect();
        if cols.len() != COLUMN_COUNT {
            return Err(ParseError::ColumnCount {
                url: url.to_string(),
                row,
                found: cols.len(),
            });
        }

        let aqsid = cols[2].trim();
        if aqsid.is_empty() {
            return Err(ParseError::MissingField {
                url: url.to_string(),
                row,
                field: "aqsid",
            });
        }
        let parameter = cols[5].trim();
        if parameter.is_empty() {
            return Err(ParseError::MissingField {
                url: url.to_string(),
                row,
                field: "parameter name",
            });
        }

        out.push(Measurement {
            source: SourceKind::AirNow,
            monitor: MonitorKey::new(aqsid),
            parameter: parameter.to_string(),
            poc: None,
            date_local: parse_valid_date(cols[0], url, row)?,
            time_local: parse_clock(cols[1], url, row, "valid time")?,
            date_gmt: None,
            time_gmt: None,
            value: parse_decimal(cols[7], url, row, "value")?,
            unit: text_or_none(cols[6]),
            site_name: text_or_none(cols[3]),
            gmt_offset: text_or_none(cols[4]),
            latitude: None,
            longitude: None,
            detection_limit: None,
            data_source: text_or_none(cols[8]),
            source_url: url.to_string(),
            attributes: Default::default(),
        });
    }
    Ok(out)
}

pub struct AirNowAdapter {
    http: Arc<HttpFetcher>,
    endpoints: AirNowEndpoints,
}

impl AirNowAdapter {
    pub fn new(http: Arc<HttpFetcher>, endpoints: AirNowEndpoints) -> Self {
        Self { http, endpoints }
    }
}

#[async_trait]
impl SourceAdapter for AirNowAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::AirNow
    }

    async fn discover(&self, ctx: &AdapterContext, bucket: &DiscoveryBucket) -> Vec<DiscoveryUnit> {
        let DiscoveryBucket::Day(date) = bucket else {
            warn!(?bucket, "airnow discovery needs a day bucket");
            return Vec::new();
        };
        let url = self.endpoints.listing_url(*date);
        match self.http.fetch_bytes(ctx.run_id, LISTING_LIMIT_KEY, &url).await {
            Ok(resp) => {
                let listing = String::from_utf8_lossy(&resp.body);
                let hours = hours_from_listing(&listing, *date);
                debug!(%date, found = hours.len(), "airnow listing parsed");
                hours
                    .into_iter()
                    .map(|hour| DiscoveryUnit::Hour { date: *date, hour })
                    .collect()
            }
            Err(err) => {
                warn!(%date, error = %err, "airnow listing unavailable; no units this pass");
                Vec::new()
            }
        }
    }

    async fn fetch(&self, ctx: &AdapterContext, unit: &DiscoveryUnit) -> Result<RawPayload, FetchError> {
        let DiscoveryUnit::Hour { date, hour } = unit else {
            return Err(FetchError::Permanent {
                url: unit.to_string(),
                reason: "airnow adapter only fetches hour units".to_string(),
            });
        };
        let url = self.endpoints.file_url(*date, *hour);
        let resp = self.http.fetch_bytes(ctx.run_id, FILE_LIMIT_KEY, &url).await?;
        Ok(resp.into_payload())
    }

    fn parse(&self, payload: &RawPayload) -> Result<Vec<Measurement>, ParseError> {
        parse_hourly_file(&payload.url, &payload.text())
    }
}
