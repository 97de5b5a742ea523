//! Upstream API access: request pacing, response classification and retrying page fetches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nrega_core::RawRecord;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "nrega-fetch";

const ERROR_BODY_SNIPPET: usize = 200;

/// Process-wide gate enforcing a minimum spacing between upstream requests.
///
/// Waiters queue on a fair mutex, so callers are released in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_release: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_release: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn acquire(&self) {
        let mut last = self.last_release.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.min_interval).await;
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    /// Pre-jitter delay after the `retry_index`-th failure (0-based).
    pub fn delay_for_attempt(&self, retry_index: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry_index.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs).min(self.max_delay)
    }

    pub fn jittered_delay(&self, retry_index: u32) -> Duration {
        let base = self.delay_for_attempt(retry_index);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream rate limited the request (HTTP 429)")]
    RateLimited,
    #[error("upstream server error (HTTP {status})")]
    Server { status: u16 },
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("upstream rejected the request (HTTP {status}): {body}")]
    Client { status: u16, body: String },
    #[error("malformed response body: {0}")]
    Malformed(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited
                | FetchError::Server { .. }
                | FetchError::Timeout(_)
                | FetchError::Connect(_)
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_connect() {
            FetchError::Connect(err.to_string())
        } else if err.is_decode() || err.is_body() {
            FetchError::Malformed(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// One page request: a state filter, a fiscal-year filter and the pagination window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub state_name: String,
    pub fin_year: String,
    pub offset: usize,
    pub limit: usize,
    /// Hard stop for this request, retries included.
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct ApiPage {
    #[serde(default)]
    records: Option<Vec<JsonValue>>,
}

/// Map one HTTP response to records or a classified error.
pub fn classify_response(response: RawResponse) -> Result<Vec<RawRecord>, FetchError> {
    match response.status {
        200..=299 => {
            let page: ApiPage = serde_json::from_slice(&response.body)
                .map_err(|err| FetchError::Malformed(err.to_string()))?;
            Ok(page
                .records
                .unwrap_or_default()
                .into_iter()
                .map(RawRecord::from_value)
                .collect())
        }
        429 => Err(FetchError::RateLimited),
        500..=599 => Err(FetchError::Server {
            status: response.status,
        }),
        status => Err(FetchError::Client {
            status,
            body: String::from_utf8_lossy(&response.body)
                .chars()
                .take(ERROR_BODY_SNIPPET)
                .collect(),
        }),
    }
}

/// A single HTTP attempt against the upstream API.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn send(&self, query: &PageQuery) -> Result<RawResponse, FetchError>;
}

/// Anything that can hand the sync loop a page of records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<RawRecord>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub resource_id: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl ApiConfig {
    pub fn resource_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.resource_id.trim_start_matches('/')
        )
    }

    pub fn query_pairs(&self, query: &PageQuery) -> Vec<(&'static str, String)> {
        vec![
            ("api-key", self.api_key.clone()),
            ("format", "json".to_string()),
            ("filters[state_name]", query.state_name.clone()),
            ("filters[fin_year]", query.fin_year.clone()),
            ("offset", query.offset.to_string()),
            ("limit", query.limit.to_string()),
        ]
    }
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: ApiConfig,
}

impl HttpTransport {
    pub fn new(config: ApiConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl PageTransport for HttpTransport {
    async fn send(&self, query: &PageQuery) -> Result<RawResponse, FetchError> {
        let resp = self
            .client
            .get(self.config.resource_url())
            .query(&self.config.query_pairs(query))
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?.to_vec();
        Ok(RawResponse { status, body })
    }
}

/// Paced, retrying page fetcher. Transient failures back off exponentially; fatal ones return at once.
pub struct RetryingFetcher {
    transport: Arc<dyn PageTransport>,
    limiter: Arc<RateLimiter>,
    backoff: BackoffPolicy,
}

impl RetryingFetcher {
    pub fn new(
        transport: Arc<dyn PageTransport>,
        limiter: Arc<RateLimiter>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            limiter,
            backoff,
        }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    async fn fetch_with_retries(&self, query: &PageQuery) -> Result<Vec<RawRecord>, FetchError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            self.limiter.acquire().await;
            attempt += 1;

            let sent = match query.deadline {
                Some(at) => tokio::time::timeout_at(at, self.transport.send(query))
                    .await
                    .unwrap_or_else(|_| Err(FetchError::Timeout("deadline reached awaiting upstream".into()))),
                None => self.transport.send(query).await,
            };
            let outcome = sent.and_then(classify_response);

            match outcome {
                Ok(records) => {
                    debug!(attempt, records = records.len(), "page fetched");
                    return Ok(records);
                }
                Err(err) if err.is_transient() => {
                    let delay = self.backoff.jittered_delay(attempt - 1);
                    let past_deadline = query
                        .deadline
                        .is_some_and(|at| Instant::now() + delay >= at);
                    if attempt >= max_attempts || past_deadline {
                        if past_deadline {
                            warn!(attempt, error = %err, "deadline leaves no room for another attempt");
                        }
                        return Err(FetchError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient upstream failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl RecordSource for RetryingFetcher {
    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<RawRecord>, FetchError> {
        let span = info_span!(
            "http_fetch",
            state = %query.state_name,
            fin_year = %query.fin_year,
            offset = query.offset,
            limit = query.limit
        );
        self.fetch_with_retries(query).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedTransport {
        responses: std::sync::Mutex<VecDeque<Result<RawResponse, FetchError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<RawResponse, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PageTransport for ScriptedTransport {
        async fn send(&self, _query: &PageQuery) -> Result<RawResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(status(503)))
        }
    }

    fn status(code: u16) -> RawResponse {
        RawResponse {
            status: code,
            body: Vec::new(),
        }
    }

    fn ok_page(body: &str) -> RawResponse {
        RawResponse {
            status: 200,
            body: body.as_bytes().to_vec(),
        }
    }

    fn query() -> PageQuery {
        PageQuery {
            state_name: "ASSAM".into(),
            fin_year: "2024-2025".into(),
            offset: 0,
            limit: 100,
            deadline: None,
        }
    }

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: Duration::ZERO,
        }
    }

    fn fetcher(transport: Arc<ScriptedTransport>, backoff: BackoffPolicy) -> RetryingFetcher {
        RetryingFetcher::new(
            transport,
            Arc::new(RateLimiter::new(Duration::ZERO)),
            backoff,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_acquires_are_spaced_by_min_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(250));
        let mut released = Vec::new();
        for _ in 0..5 {
            limiter.acquire().await;
            released.push(Instant::now());
        }
        for pair in released.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_one_clock() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(100)));
        let start = Instant::now();
        let handles = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect::<Vec<_>>();
        let mut released = Vec::new();
        for handle in handles {
            released.push(handle.await.unwrap());
        }
        released.sort();
        for pair in released.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
        assert!(released[3] - start >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_released_in_arrival_order() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(100)));
        let arrived = Arc::new(std::sync::Mutex::new(Vec::new()));
        let released = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handles = (0..8)
            .map(|id| {
                let limiter = limiter.clone();
                let arrived = arrived.clone();
                let released = released.clone();
                tokio::spawn(async move {
                    arrived.lock().unwrap().push(id);
                    limiter.acquire().await;
                    released.lock().unwrap().push(id);
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap();
        }
        let arrived = arrived.lock().unwrap().clone();
        assert_eq!(arrived.len(), 8);
        assert_eq!(*released.lock().unwrap(), arrived);
    }

    #[test]
    fn backoff_is_exponential_monotonic_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 8,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
            jitter: Duration::ZERO,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(350));

        let delays = (0..10).map(|k| policy.delay_for_attempt(k)).collect::<Vec<_>>();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = BackoffPolicy {
            jitter: Duration::from_millis(50),
            ..policy(3)
        };
        for _ in 0..100 {
            let d = policy.jittered_delay(0);
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(1050));
        }
    }

    #[test]
    fn classifies_status_codes_and_bodies() {
        assert!(matches!(classify_response(status(429)), Err(FetchError::RateLimited)));
        assert!(classify_response(status(502)).unwrap_err().is_transient());

        let not_found = classify_response(RawResponse {
            status: 403,
            body: b"{\"error\":\"invalid api key\"}".to_vec(),
        })
        .unwrap_err();
        assert!(!not_found.is_transient());
        assert!(not_found.to_string().contains("invalid api key"));

        let malformed = classify_response(ok_page("<html>")).unwrap_err();
        assert!(matches!(malformed, FetchError::Malformed(_)));
        assert!(!malformed.is_transient());

        assert!(classify_response(ok_page("{}")).unwrap().is_empty());
        assert!(classify_response(ok_page("{\"records\":[]}")).unwrap().is_empty());
        let records = classify_response(ok_page("{\"records\":[{\"district_code\":\"1\"}]}")).unwrap();
        assert_eq!(records[0].text("district_code").as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_with_growing_backoff() {
        let transport = ScriptedTransport::new(vec![
            Ok(status(429)),
            Ok(status(429)),
            Ok(ok_page("{\"records\":[{\"a\":1}]}")),
        ]);
        let fetcher = fetcher(transport.clone(), policy(5));

        let start = Instant::now();
        let records = fetcher.fetch_page(&query()).await.expect("third attempt succeeds");
        let elapsed = start.elapsed();

        assert_eq!(records.len(), 1);
        assert_eq!(transport.calls(), 3);
        assert!(elapsed >= Duration::from_millis(3000), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(3100), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_status_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Ok(status(404)), Ok(ok_page("{}"))]);
        let fetcher = fetcher(transport.clone(), policy(5));

        let err = fetcher.fetch_page(&query()).await.unwrap_err();
        assert!(matches!(err, FetchError::Client { status: 404, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_as_fatal() {
        let transport = ScriptedTransport::new(vec![
            Err(FetchError::Timeout("deadline".into())),
            Ok(status(500)),
            Ok(status(503)),
        ]);
        let fetcher = fetcher(transport.clone(), policy(3));

        let err = fetcher.fetch_page(&query()).await.unwrap_err();
        assert!(!err.is_transient());
        match err {
            FetchError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, FetchError::Server { status: 503 }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_stops_at_the_deadline() {
        let transport = ScriptedTransport::new(Vec::new());
        let fetcher = fetcher(transport.clone(), policy(5));

        let start = Instant::now();
        let err = fetcher
            .fetch_page(&PageQuery {
                deadline: Some(start + Duration::from_millis(2500)),
                ..query()
            })
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        // attempt 1 at 0s, attempt 2 at 1s; the next 2s backoff would cross 2.5s
        assert_eq!(transport.calls(), 2);
        assert!(elapsed >= Duration::from_millis(1000), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "elapsed {elapsed:?}");
        match err {
            FetchError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, FetchError::Server { status: 503 }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_response_is_cut_at_the_deadline() {
        struct Stalled;

        #[async_trait]
        impl PageTransport for Stalled {
            async fn send(&self, _query: &PageQuery) -> Result<RawResponse, FetchError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ok_page("{}"))
            }
        }

        let fetcher = RetryingFetcher::new(
            Arc::new(Stalled),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            policy(5),
        );
        let start = Instant::now();
        let err = fetcher
            .fetch_page(&PageQuery {
                deadline: Some(start + Duration::from_millis(500)),
                ..query()
            })
            .await
            .unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "elapsed {elapsed:?}");
        match err {
            FetchError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*last, FetchError::Timeout(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn query_carries_auth_format_filters_and_window() {
        let config = ApiConfig {
            base_url: "https://api.data.gov.in/resource/".into(),
            resource_id: "ee03643a".into(),
            api_key: "secret".into(),
            timeout: Duration::from_secs(5),
            user_agent: None,
        };
        assert_eq!(config.resource_url(), "https://api.data.gov.in/resource/ee03643a");

        let pairs = config.query_pairs(&PageQuery {
            offset: 200,
            ..query()
        });
        assert!(pairs.contains(&("api-key", "secret".to_string())));
        assert!(pairs.contains(&("format", "json".to_string())));
        assert!(pairs.contains(&("filters[state_name]", "ASSAM".to_string())));
        assert!(pairs.contains(&("filters[fin_year]", "2024-2025".to_string())));
        assert!(pairs.contains(&("offset", "200".to_string())));
        assert!(pairs.contains(&("limit", "100".to_string())));
    }
}
