//! Rate-limited HTTP fetch utilities and the staging store for aqsync.

pub mod staging;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use aqsync_core::RawPayload;

pub use staging::{
    AggregateRefresher, MemoryStagingSink, NoopAggregateRefresher, PgAggregateRefresher,
    PgAirNowSink, PgAqsSink, StagingSink, StoreError, WatermarkInputs, WatermarkStore,
};

pub const CRATE_NAME: &str = "aqsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Query parameters whose values never leave the fetcher unmasked.
const SECRET_QUERY_KEYS: &[&str] = &["key", "email"];

/// Mask credential query parameters so URLs are safe to log and persist.
pub fn redact_url(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.to_string();
    };
    if parsed.query().is_none() {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            let masked = SECRET_QUERY_KEYS.contains(&k.as_ref()) && !v.is_empty();
            (k.into_owned(), if masked { "***".to_string() } else { v.into_owned() })
        })
        .collect();
    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}

/// Inline retry policy. The default performs no retries: a transient failure
/// leaves the unit for the next pass.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between requests, keyed by rate-limit key.
    pub min_intervals: HashMap<String, Duration>,
    /// Spacing for keys missing from `min_intervals`.
    pub default_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            min_intervals: HashMap::new(),
            default_interval: Duration::from_secs(1),
        }
    }
}

/// Blocks callers so that consecutive acquisitions are at least `interval`
/// apart. Waiters are served one at a time; the lock is held across the sleep.
#[derive(Debug)]
pub struct MinIntervalLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl MinIntervalLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn into_payload(self) -> RawPayload {
        RawPayload {
            url: self.final_url,
            body: self.body,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient fetch failure for {url}: {reason}")]
    Transient { url: String, reason: String },
    #[error("permanent fetch failure for {url}: {reason}")]
    Permanent { url: String, reason: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub fn url(&self) -> &str {
        match self {
            FetchError::Transient { url, .. } | FetchError::Permanent { url, .. } => url,
        }
    }

    pub fn from_status(status: StatusCode, url: &str) -> Self {
        let url = redact_url(url);
        let reason = format!("http status {}", status.as_u16());
        match classify_status(status) {
            RetryDisposition::Retryable => FetchError::Transient { url, reason },
            RetryDisposition::NonRetryable => FetchError::Permanent { url, reason },
        }
    }

    pub fn from_reqwest(err: &reqwest::Error, url: &str) -> Self {
        let url = redact_url(url);
        let mut reason = err.to_string();
        if let Some(raw) = err.url() {
            reason = reason.replace(raw.as_str(), &redact_url(raw.as_str()));
        }
        match classify_reqwest_error(err) {
            RetryDisposition::Retryable => FetchError::Transient { url, reason },
            RetryDisposition::NonRetryable => FetchError::Permanent { url, reason },
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limiters: Mutex<HashMap<String, Arc<MinIntervalLimiter>>>,
    min_intervals: HashMap<String, Duration>,
    default_interval: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limiters: Mutex::new(HashMap::new()),
            min_intervals: config.min_intervals,
            default_interval: config.default_interval,
            backoff: config.backoff,
        })
    }

    async fn limiter_for(&self, limit_key: &str) -> Arc<MinIntervalLimiter> {
        let mut map = self.limiters.lock().await;
        map.entry(limit_key.to_string())
            .or_insert_with(|| {
                let interval = self
                    .min_intervals
                    .get(limit_key)
                    .copied()
                    .unwrap_or(self.default_interval);
                Arc::new(MinIntervalLimiter::new(interval))
            })
            .clone()
    }

    /// GET `url`, waiting on the limiter for `limit_key` before every attempt.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        limit_key: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let limiter = self.limiter_for(limit_key).await;
        let span = info_span!("http_fetch", %run_id, limit_key, url = %redact_url(url));

        async {
            let mut attempt = 0usize;
            loop {
                limiter.acquire().await;
                let err = match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = redact_url(resp.url().as_str());
                        if status.is_success() {
                            match resp.bytes().await {
                                Ok(body) => {
                                    return Ok(FetchedResponse {
                                        status,
                                        final_url,
                                        body: body.to_vec(),
                                    })
                                }
                                Err(err) => FetchError::from_reqwest(&err, &final_url),
                            }
                        } else {
                            FetchError::from_status(status, &final_url)
                        }
                    }
                    Err(err) => FetchError::from_reqwest(&err, url),
                };

                if err.is_transient() && attempt < self.backoff.max_retries {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(attempt, ?delay, error = %err, "retrying transient fetch failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_splits_transient_and_permanent() {
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);

        let err = FetchError::from_status(StatusCode::SERVICE_UNAVAILABLE, "http://x/a");
        assert!(err.is_transient());
        assert_eq!(err.url(), "http://x/a");
        assert!(!FetchError::from_status(StatusCode::FORBIDDEN, "http://x/b").is_transient());
    }

    #[test]
    fn credentials_are_masked_in_urls() {
        let url = "https://aqs.example/api/sampleData/bySite?email=a%40b.org&key=secret&param=44201&state=32";
        let redacted = redact_url(url);
        assert!(!redacted.contains("secret"));
        assert!(!redacted.contains("b.org"));
        assert!(redacted.contains("param=44201"));
        assert!(redacted.contains("state=32"));

        let plain = "https://files.example/airnow/2024/20240102/HourlyData_2024010200.dat";
        assert_eq!(redact_url(plain), plain);
        assert_eq!(FetchError::from_status(StatusCode::NOT_FOUND, url).url(), redacted);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(BackoffPolicy::default().max_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_consecutive_requests() {
        let limiter = MinIntervalLimiter::new(Duration::from_secs(7));
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_does_not_wait_once_interval_has_passed() {
        let limiter = MinIntervalLimiter::new(Duration::from_secs(5));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        let before = Instant::now();
        limiter.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn limiters_are_independent_per_key() {
        let mut min_intervals = HashMap::new();
        min_intervals.insert("aqs".to_string(), Duration::from_secs(7));
        let fetcher = HttpFetcher::new(HttpClientConfig {
            min_intervals,
            default_interval: Duration::from_secs(5),
            ..Default::default()
        })
        .expect("fetcher");

        let aqs = fetcher.limiter_for("aqs").await;
        let listing = fetcher.limiter_for("airnow-listing").await;
        assert_eq!(aqs.interval(), Duration::from_secs(7));
        assert_eq!(listing.interval(), Duration::from_secs(5));
        assert!(Arc::ptr_eq(&aqs, &fetcher.limiter_for("aqs").await));

        let start = Instant::now();
        aqs.acquire().await;
        listing.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
