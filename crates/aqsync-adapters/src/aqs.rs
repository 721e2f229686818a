//! EPA AQS `sampleData/bySite` API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Url;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tracing::warn;

use aqsync_core::{api_units, DiscoveryUnit, Measurement, MonitorKey, RawPayload, SourceKind};
use aqsync_storage::{FetchError, HttpFetcher};

use crate::{parse_clock, parse_decimal, AdapterContext, DiscoveryBucket, ParseError, SourceAdapter};

pub const LIMIT_KEY: &str = "aqs";
pub const DEFAULT_ENDPOINT: &str = "https://aqs.epa.gov/data/api/sampleData/bySite";

/// Columns lifted into typed measurement fields; everything else lands in
/// `attributes`.
const TYPED_FIELDS: &[&str] = &[
    "state_code",
    "county_code",
    "site_number",
    "parameter_code",
    "poc",
    "date_local",
    "time_local",
    "date_gmt",
    "time_gmt",
    "sample_measurement",
    "units_of_measure",
    "latitude",
    "longitude",
    "detection_limit",
];

#[derive(Clone, PartialEq, Eq)]
pub struct AqsCredentials {
    pub email: String,
    pub key: String,
}

impl std::fmt::Debug for AqsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AqsCredentials")
            .field("email", &self.email)
            .field("key", &"***")
            .finish()
    }
}

/// Request URL for one API unit; `None` for file-feed units or an unusable
/// endpoint.
pub fn request_url(endpoint: &str, credentials: &AqsCredentials, unit: &DiscoveryUnit) -> Option<Url> {
    let DiscoveryUnit::ApiBatch {
        site,
        range,
        parameters,
    } = unit
    else {
        return None;
    };
    let params = parameters.join(",");
    let bdate = range.begin.format("%Y%m%d").to_string();
    let edate = range.end.format("%Y%m%d").to_string();
    Url::parse_with_params(
        endpoint,
        &[
            ("email", credentials.email.as_str()),
            ("key", credentials.key.as_str()),
            ("param", params.as_str()),
            ("bdate", bdate.as_str()),
            ("edate", edate.as_str()),
            ("state", site.state_code()),
            ("county", site.county_code()),
            ("site", site.site_number()),
        ],
    )
    .ok()
}

fn required<'a>(
    record: &'a Map<String, Value>,
    field: &'static str,
    url: &str,
    row: usize,
) -> Result<&'a Value, ParseError> {
    match record.get(field) {
        Some(Value::Null) | None => Err(ParseError::MissingField {
            url: url.to_string(),
            row,
            field,
        }),
        Some(value) => Ok(value),
    }
}

/// Codes arrive as strings but tolerate bare numbers.
fn code_text(value: &Value, field: &'static str, url: &str, row: usize) -> Result<String, ParseError> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ParseError::InvalidField {
            url: url.to_string(),
            row,
            field,
            value: other.to_string(),
        }),
    }
}

fn optional_decimal(
    record: &Map<String, Value>,
    field: &'static str,
    url: &str,
    row: usize,
) -> Result<Option<Decimal>, ParseError> {
    match record.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => parse_decimal(&n.to_string(), url, row, field),
        Some(Value::String(s)) => parse_decimal(s, url, row, field),
        Some(other) => Err(ParseError::InvalidField {
            url: url.to_string(),
            row,
            field,
            value: other.to_string(),
        }),
    }
}

fn optional_text(record: &Map<String, Value>, field: &str) -> Option<String> {
    record
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn date_field(value: &Value, field: &'static str, url: &str, row: usize) -> Result<NaiveDate, ParseError> {
    let raw = value.as_str().unwrap_or_default().trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| ParseError::InvalidField {
        url: url.to_string(),
        row,
        field,
        value: value.to_string(),
    })
}

fn header_failure(doc: &Value) -> Option<String> {
    let header = doc.get("Header")?.as_array()?.first()?;
    let status = header.get("status")?.as_str()?;
    if !status.eq_ignore_ascii_case("failed") {
        return None;
    }
    let detail = header
        .get("error")
        .and_then(Value::as_array)
        .map(|errs| {
            errs.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| status.to_string());
    Some(detail)
}

/// Parse a `sampleData` response body. A missing `Data` array is an empty
/// result; a `Header` with status `Failed` rejects the payload.
pub fn parse_sample_data(url: &str, body: &[u8]) -> Result<Vec<Measurement>, ParseError> {
    let doc: Value = serde_json::from_slice(body).map_err(|e| ParseError::Json {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if let Some(reason) = header_failure(&doc) {
        return Err(ParseError::ApiFailure {
            url: url.to_string(),
            reason,
        });
    }
    let rows = match doc.get("Data") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(rows)) => rows,
        Some(_) => {
            return Err(ParseError::Json {
                url: url.to_string(),
                reason: "`Data` is not an array".to_string(),
            })
        }
    };

    let mut out = Vec::with_capacity(rows.len());
    for (index, value) in rows.iter().enumerate() {
        let row = index + 1;
        let Some(record) = value.as_object() else {
            return Err(ParseError::Json {
                url: url.to_string(),
                reason: format!("row {row} is not an object"),
            });
        };

        let state = code_text(required(record, "state_code", url, row)?, "state_code", url, row)?;
        let county = code_text(required(record, "county_code", url, row)?, "county_code", url, row)?;
        let site = code_text(required(record, "site_number", url, row)?, "site_number", url, row)?;
        let parameter_code =
            code_text(required(record, "parameter_code", url, row)?, "parameter_code", url, row)?;
        let poc_raw = code_text(required(record, "poc", url, row)?, "poc", url, row)?;
        let poc: i16 = poc_raw.parse().map_err(|_| ParseError::InvalidField {
            url: url.to_string(),
            row,
            field: "poc",
            value: poc_raw.clone(),
        })?;
        let date_local = date_field(required(record, "date_local", url, row)?, "date_local", url, row)?;
        let time_local = parse_clock(
            required(record, "time_local", url, row)?.as_str().unwrap_or_default(),
            url,
            row,
            "time_local",
        )?;
        let date_gmt = date_field(required(record, "date_gmt", url, row)?, "date_gmt", url, row)?;
        let time_gmt = parse_clock(
            required(record, "time_gmt", url, row)?.as_str().unwrap_or_default(),
            url,
            row,
            "time_gmt",
        )?;

        let attributes: Map<String, Value> = record
            .iter()
            .filter(|(k, _)| !TYPED_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        out.push(Measurement {
            source: SourceKind::Aqs,
            monitor: MonitorKey::from_parts(&state, &county, &site),
            parameter: parameter_code,
            poc: Some(poc),
            date_local,
            time_local,
            date_gmt: Some(date_gmt),
            time_gmt: Some(time_gmt),
            value: optional_decimal(record, "sample_measurement", url, row)?,
            unit: optional_text(record, "units_of_measure"),
            site_name: None,
            gmt_offset: None,
            latitude: optional_decimal(record, "latitude", url, row)?,
            longitude: optional_decimal(record, "longitude", url, row)?,
            detection_limit: optional_decimal(record, "detection_limit", url, row)?,
            data_source: Some("AQS".to_string()),
            source_url: url.to_string(),
            attributes,
        });
    }
    Ok(out)
}

pub struct AqsAdapter {
    http: Arc<HttpFetcher>,
    endpoint: String,
    credentials: AqsCredentials,
}

impl AqsAdapter {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>, credentials: AqsCredentials) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            credentials,
        }
    }
}

#[async_trait]
impl SourceAdapter for AqsAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Aqs
    }

    async fn discover(&self, _ctx: &AdapterContext, bucket: &DiscoveryBucket) -> Vec<DiscoveryUnit> {
        match bucket {
            DiscoveryBucket::Api {
                sites,
                range,
                parameters,
            } => api_units(sites, *range, parameters),
            DiscoveryBucket::Day(date) => {
                warn!(%date, "aqs discovery needs site and parameter selection");
                Vec::new()
            }
        }
    }

    async fn fetch(&self, ctx: &AdapterContext, unit: &DiscoveryUnit) -> Result<RawPayload, FetchError> {
        let Some(url) = request_url(&self.endpoint, &self.credentials, unit) else {
            return Err(FetchError::Permanent {
                url: unit.to_string(),
                reason: format!("cannot build aqs request from endpoint `{}`", self.endpoint),
            });
        };
        let resp = self.http.fetch_bytes(ctx.run_id, LIMIT_KEY, url.as_str()).await?;
        Ok(resp.into_payload())
    }

    fn parse(&self, payload: &RawPayload) -> Result<Vec<Measurement>, ParseError> {
        parse_sample_data(&payload.url, &payload.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqsync_storage::HttpClientConfig;
    use aqsync_core::DateRange;
    use chrono::NaiveTime;

    fn creds() -> AqsCredentials {
        AqsCredentials {
            email: "ops@example.org".into(),
            key: "s3cret".into(),
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn single_unit(site: MonitorKey, range: DateRange, parameters: Vec<String>) -> DiscoveryUnit {
        DiscoveryUnit::ApiBatch {
            site,
            range,
            parameters,
        }
    }

    #[test]
    fn request_url_carries_all_query_fields() {
        let unit = single_unit(
            MonitorKey::new("320030043"),
            DateRange::new(d(2023, 1, 1), d(2023, 12, 31)),
            vec!["44201".into(), "88101".into()],
        );
        let url = request_url(DEFAULT_ENDPOINT, &creds(), &unit).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let get = |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert!(url.as_str().starts_with(DEFAULT_ENDPOINT));
        assert_eq!(get("email"), "ops@example.org");
        assert_eq!(get("param"), "44201,88101");
        assert_eq!(get("bdate"), "20230101");
        assert_eq!(get("edate"), "20231231");
        assert_eq!(get("state"), "32");
        assert_eq!(get("county"), "003");
        assert_eq!(get("site"), "0043");
    }

    #[test]
    fn hour_units_have_no_api_url() {
        let unit = DiscoveryUnit::Hour { date: d(2024, 1, 2), hour: 0 };
        assert!(request_url(DEFAULT_ENDPOINT, &creds(), &unit).is_none());
    }

    #[test]
    fn credentials_debug_hides_key() {
        assert!(!format!("{:?}", creds()).contains("s3cret"));
    }

    #[test]
    fn parses_data_rows_and_keeps_extra_columns() {
        let body = br#"{
            "Header": [{"status": "Success", "rows": 2}],
            "Data": [
                {"state_code": "32", "county_code": "003", "site_number": "0043",
                 "parameter_code": "44201", "poc": 1, "latitude": 36.1,
                 "longitude": -115.1, "date_local": "2024-01-02", "time_local": "00:00",
                 "date_gmt": "2024-01-02", "time_gmt": "08:00",
                 "sample_measurement": 0.031, "units_of_measure": "Parts per million",
                 "detection_limit": "0.005", "method": "INSTRUMENTAL - ULTRA VIOLET",
                 "qualifier": null},
                {"state_code": "32", "county_code": "003", "site_number": "0043",
                 "parameter_code": "44201", "poc": "2", "date_local": "2024-01-02",
                 "time_local": "01:00", "date_gmt": "2024-01-02", "time_gmt": "09:00",
                 "sample_measurement": null, "detection_limit": ""}
            ]
        }"#;
        let rows = parse_sample_data("u", body).unwrap();
        assert_eq!(rows.len(), 2);

        let first = &rows[0];
        assert_eq!(first.monitor.as_str(), "320030043");
        assert_eq!(first.parameter, "44201");
        assert_eq!(first.poc, Some(1));
        assert_eq!(first.time_gmt, Some(NaiveTime::from_hms_opt(8, 0, 0).unwrap()));
        assert_eq!(first.value, Some(Decimal::new(31, 3)));
        assert_eq!(first.detection_limit, Some(Decimal::new(5, 3)));
        assert_eq!(first.latitude, Some(Decimal::new(361, 1)));
        assert_eq!(first.unit.as_deref(), Some("Parts per million"));
        assert_eq!(
            first.attributes.get("method").and_then(Value::as_str),
            Some("INSTRUMENTAL - ULTRA VIOLET")
        );
        assert!(!first.attributes.contains_key("sample_measurement"));

        let second = &rows[1];
        assert_eq!(second.poc, Some(2));
        assert_eq!(second.value, None);
        assert_eq!(second.detection_limit, None);
        assert_ne!(first.natural_key(), second.natural_key());
    }

    #[test]
    fn missing_data_section_is_empty() {
        assert!(parse_sample_data("u", br#"{"Header": [{"status": "No data matched your selection"}]}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn failed_header_is_rejected() {
        let body = br#"{"Header": [{"status": "Failed", "error": ["invalid key"]}], "Data": []}"#;
        match parse_sample_data("u", body) {
            Err(ParseError::ApiFailure { reason, .. }) => assert_eq!(reason, "invalid key"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn missing_required_field_rejects_the_payload() {
        let body = br#"{"Data": [{"state_code": "32", "county_code": "003", "site_number": "0043",
            "parameter_code": "44201", "date_local": "2024-01-02", "time_local": "00:00",
            "date_gmt": "2024-01-02", "time_gmt": "08:00"}]}"#;
        assert!(matches!(
            parse_sample_data("u", body),
            Err(ParseError::MissingField { field: "poc", row: 1, .. })
        ));
    }

    #[test]
    fn non_numeric_measurement_rejects_the_payload() {
        let body = br#"{"Data": [{"state_code": "32", "county_code": "003", "site_number": "0043",
            "parameter_code": "44201", "poc": 1, "date_local": "2024-01-02", "time_local": "00:00",
            "date_gmt": "2024-01-02", "time_gmt": "08:00", "sample_measurement": "high"}]}"#;
        assert!(matches!(
            parse_sample_data("u", body),
            Err(ParseError::InvalidField { field: "sample_measurement", .. })
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(parse_sample_data("u", b"<html>"), Err(ParseError::Json { .. })));
    }

    #[tokio::test]
    async fn discovery_is_the_unit_cross_product() {
        let http = Arc::new(HttpFetcher::new(Default::default()).expect("fetcher"));
        let adapter = AqsAdapter::new(http, DEFAULT_ENDPOINT, creds());
        let ctx = AdapterContext::new(uuid::Uuid::new_v4());
        let bucket = DiscoveryBucket::Api {
            sites: vec![MonitorKey::new("320030043")],
            range: DateRange::new(d(2023, 11, 1), d(2024, 1, 31)),
            parameters: (0..6).map(|i| format!("8810{i}")).collect(),
        };
        let units = adapter.discover(&ctx, &bucket).await;
        assert_eq!(units.len(), 4);
        assert!(adapter
            .discover(&ctx, &DiscoveryBucket::Day(d(2024, 1, 2)))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn unreachable_api_is_a_transient_fetch_failure_with_masked_url() {
        let config = HttpClientConfig {
            timeout: std::time::Duration::from_secs(5),
            default_interval: std::time::Duration::ZERO,
            ..Default::default()
        };
        let http = Arc::new(HttpFetcher::new(config).unwrap());
        let adapter = AqsAdapter::new(http, "http://127.0.0.1:9/data/sampleData/bySite", creds());
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let unit = single_unit(
            MonitorKey::new("320030043"),
            DateRange::new(day, day),
            vec!["44201".into()],
        );

        let err = adapter
            .fetch(&AdapterContext::new(uuid::Uuid::new_v4()), &unit)
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert!(!err.url().contains("s3cret"));
        assert!(!err.to_string().contains("s3cret"));
    }
}
