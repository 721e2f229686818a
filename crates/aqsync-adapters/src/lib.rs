//! Source adapter contracts plus the AirNow file-feed and AQS API adapters.
//!
//! An adapter owns the three source-specific steps of a pass: enumerating
//! units for a bucket, fetching one unit through the shared rate-limited
//! fetcher, and parsing the payload into [`Measurement`]s. Watch-list filtering
//! and staging happen in the orchestrator.

pub mod airnow;
pub mod aqs;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use aqsync_core::{DateRange, DiscoveryUnit, Measurement, MonitorKey, RawPayload, SourceKind};
use aqsync_storage::FetchError;

pub use airnow::{AirNowAdapter, AirNowEndpoints};
pub use aqs::{AqsAdapter, AqsCredentials};

pub const CRATE_NAME: &str = "aqsync-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

/// Scope handed to discovery: one UTC day for the file feed, or a site,
/// range and parameter selection for the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryBucket {
    Day(NaiveDate),
    Api {
        sites: Vec<MonitorKey>,
        range: DateRange,
        parameters: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{url} row {row}: expected 9 columns, found {found}")]
    ColumnCount { url: String, row: usize, found: usize },
    #[error("{url} row {row}: invalid {field} `{value}`")]
    InvalidField {
        url: String,
        row: usize,
        field: &'static str,
        value: String,
    },
    #[error("{url} row {row}: missing required field `{field}`")]
    MissingField {
        url: String,
        row: usize,
        field: &'static str,
    },
    #[error("{url}: malformed JSON: {reason}")]
    Json { url: String, reason: String },
    #[error("{url}: api reported failure: {reason}")]
    ApiFailure { url: String, reason: String },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceKind;

    /// Ordered units for `bucket`. Never fails: an unreachable listing yields
    /// no units and is retried on the next pass.
    async fn discover(&self, ctx: &AdapterContext, bucket: &DiscoveryBucket) -> Vec<DiscoveryUnit>;

    async fn fetch(&self, ctx: &AdapterContext, unit: &DiscoveryUnit) -> Result<RawPayload, FetchError>;

    /// All rows of the payload, unfiltered. Any structural error rejects the
    /// whole payload.
    fn parse(&self, payload: &RawPayload) -> Result<Vec<Measurement>, ParseError>;
}

/// Decimal from text. Empty input is `None`; anything else must be numeric.
pub(crate) fn parse_decimal(
    raw: &str,
    url: &str,
    row: usize,
    field: &'static str,
) -> Result<Option<Decimal>, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map(Some)
        .map_err(|_| ParseError::InvalidField {
            url: url.to_string(),
            row,
            field,
            value: trimmed.to_string(),
        })
}

/// `HH:MM`, tolerating a trailing `:SS`.
pub(crate) fn parse_clock(
    raw: &str,
    url: &str,
    row: usize,
    field: &'static str,
) -> Result<NaiveTime, ParseError> {
    let trimmed = raw.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| ParseError::InvalidField {
            url: url.to_string(),
            row,
            field,
            value: trimmed.to_string(),
        })
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
