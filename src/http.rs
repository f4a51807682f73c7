//! Rate-limited JSON fetcher shared by all registry clients.
//!
//! One pooled client serves every registry, so connection reuse and the
//! process-wide token bucket apply across ecosystems. Recoverable failures
//! (timeouts, 5xx, malformed payloads, missing packages) all collapse to
//! an absent result; the only error callers must handle is the source-host
//! API running out of quota, which aborts the scan.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::{Client, Url};
use thiserror::Error;

const USER_AGENT: &str = concat!(
    "slopguard/",
    env!("CARGO_PKG_VERSION"),
    " (https://github.com/slopguard/slopguard)"
);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Maximum attempts per logical call
const MAX_ATTEMPTS: u32 = 3;

/// Base backoff for 5xx and connection failures
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Longest `Retry-After` we are willing to honor
const MAX_RETRY_AFTER_SECS: u64 = 300;

/// Poll interval while waiting for the token bucket to refill
const BUCKET_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Token bucket capacity (burst size)
const BUCKET_CAPACITY: f64 = 20.0;

/// Bucket refill rate in tokens per second
const BUCKET_REFILL_RATE: f64 = 10.0;

/// The one failure the HTTP layer surfaces as an error.
///
/// Everything recoverable is reported as an absent value instead; a scan
/// treats absence as "signal unavailable" and keeps going.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The source-code-host API refused us with zero remaining quota.
    /// Not retried; the scan aborts and reports partial results.
    #[error("rate limit exhausted for {host}; set GITHUB_TOKEN to raise the hourly quota")]
    RateLimitExhausted { host: String },
}

/// Token bucket refilled from the wall-clock delta on each acquire
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens: BUCKET_CAPACITY,
            last_refill: Instant::now(),
        }
    }

    /// Refill from elapsed time, then take one token if available
    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * BUCKET_REFILL_RATE).min(BUCKET_CAPACITY);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Shared JSON-over-HTTPS client with rate limiting, retry and backoff
pub struct HttpFetcher {
    client: Client,
    bucket: Mutex<TokenBucket>,
    github_token: Option<String>,
    github_host: String,
}

impl HttpFetcher {
    /// Create a fetcher.
    ///
    /// `github_host` is the host treated as the source-code-host API: it
    /// gets Bearer credentials when a token is configured, and its quota
    /// exhaustion is fatal.
    pub fn new(github_token: Option<String>, github_host: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            bucket: Mutex::new(TokenBucket::new()),
            github_token,
            github_host: github_host.to_string(),
        })
    }

    /// GET a URL and parse the body as JSON.
    ///
    /// Returns `Ok(None)` for missing packages (404/410), malformed
    /// payloads and exhausted retries.
    pub async fn get_json(&self, url: &str) -> Result<Option<serde_json::Value>, FetchError> {
        match self.get_with_retries(url).await? {
            Some(body) => match serde_json::from_str(&body) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    tracing::debug!(url, %err, "discarding malformed JSON payload");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// GET a URL and return the raw body.
    ///
    /// The Go proxy version list and vanity-import pages are plain text.
    pub async fn get_text(&self, url: &str) -> Result<Option<String>, FetchError> {
        self.get_with_retries(url).await
    }

    async fn get_with_retries(&self, url: &str) -> Result<Option<String>, FetchError> {
        let is_github = self.is_github_url(url);

        for attempt in 1..=MAX_ATTEMPTS {
            self.acquire_token().await;

            let mut request = self.client.get(url);
            if is_github {
                if let Some(token) = &self.github_token {
                    request = request.bearer_auth(token);
                }
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    tracing::debug!(url, attempt, %err, "request failed");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(BACKOFF_BASE * attempt).await;
                    }
                    continue;
                }
            };

            let status = response.status();

            if status.is_success() {
                return Ok(response.text().await.ok());
            }

            match status.as_u16() {
                404 | 410 => return Ok(None),
                429 => {
                    match honored_retry_after(&response) {
                        Some(wait) if attempt < MAX_ATTEMPTS => {
                            tracing::debug!(url, attempt, wait_secs = wait.as_secs(), "429, honoring Retry-After");
                            tokio::time::sleep(wait).await;
                            continue;
                        }
                        _ => return Ok(None),
                    }
                }
                403 if is_github && quota_exhausted(&response) => {
                    return Err(FetchError::RateLimitExhausted {
                        host: self.github_host.clone(),
                    });
                }
                500..=599 => {
                    tracing::debug!(url, attempt, %status, "server error");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(BACKOFF_BASE * attempt).await;
                    }
                    continue;
                }
                _ => {
                    tracing::debug!(url, %status, "unexpected status, treating as absent");
                    return Ok(None);
                }
            }
        }

        Ok(None)
    }

    /// Block until the process-wide token bucket yields a token
    async fn acquire_token(&self) {
        loop {
            {
                let mut bucket = self.bucket.lock().expect("token bucket poisoned");
                if bucket.try_acquire() {
                    return;
                }
            }
            tokio::time::sleep(BUCKET_POLL_INTERVAL).await;
        }
    }

    fn is_github_url(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let authority = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return false,
        };
        authority == self.github_host
    }
}

/// Parse a `Retry-After` header worth honoring (seconds form, ≤ 300 s)
fn honored_retry_after(response: &reqwest::Response) -> Option<Duration> {
    let secs: u64 = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;

    (secs <= MAX_RETRY_AFTER_SECS).then(|| Duration::from_secs(secs))
}

/// GitHub signals quota exhaustion with 403 + `x-ratelimit-remaining: 0`
fn quota_exhausted(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(None, "api.github.com").unwrap()
    }

    #[test]
    fn test_bucket_starts_full() {
        let mut bucket = TokenBucket::new();
        for _ in 0..BUCKET_CAPACITY as usize {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_bucket_refills_from_elapsed_time() {
        let mut bucket = TokenBucket::new();
        while bucket.try_acquire() {}

        // Simulate 500ms elapsed: 10 tokens/s -> 5 tokens back
        bucket.last_refill = Instant::now() - Duration::from_millis(500);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new();
        bucket.last_refill = Instant::now() - Duration::from_secs(3600);
        let mut acquired = 0;
        while bucket.try_acquire() {
            acquired += 1;
        }
        assert_eq!(acquired, BUCKET_CAPACITY as usize);
    }

    #[tokio::test]
    async fn test_get_json_success() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/pkg.json");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"name":"rails","downloads":500000000}"#);
        });

        let value = fetcher()
            .get_json(&server.url("/pkg.json"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value["name"], "rails");
        assert_eq!(value["downloads"], 500_000_000u64);
    }

    #[tokio::test]
    async fn test_get_json_not_found_is_absent() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/missing.json");
            then.status(404);
        });

        let value = fetcher().get_json(&server.url("/missing.json")).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_get_json_malformed_is_absent() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/broken.json");
            then.status(200).body("{not json");
        });

        let value = fetcher().get_json(&server.url("/broken.json")).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET").path("/flaky.json");
            then.status(503);
        });

        let value = fetcher().get_json(&server.url("/flaky.json")).await.unwrap();
        assert!(value.is_none());
        assert_eq!(mock.hits(), MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_429_with_retry_after_is_retried() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET").path("/limited.json");
            then.status(429).header("retry-after", "0");
        });

        let value = fetcher().get_json(&server.url("/limited.json")).await.unwrap();
        assert!(value.is_none());
        // Retries count against the same budget
        assert_eq!(mock.hits(), MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_429_with_excessive_retry_after_is_absent() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET").path("/limited.json");
            then.status(429).header("retry-after", "3600");
        });

        let value = fetcher().get_json(&server.url("/limited.json")).await.unwrap();
        assert!(value.is_none());
        assert_eq!(mock.hits(), 1);
    }

    #[tokio::test]
    async fn test_github_quota_exhaustion_is_fatal() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/repos/rails/rails");
            then.status(403).header("x-ratelimit-remaining", "0");
        });

        let host = server.address().to_string();
        let fetcher = HttpFetcher::new(None, &host).unwrap();
        let result = fetcher.get_json(&server.url("/repos/rails/rails")).await;

        assert!(matches!(result, Err(FetchError::RateLimitExhausted { .. })));
    }

    #[tokio::test]
    async fn test_github_403_with_quota_left_is_absent() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/repos/rails/rails");
            then.status(403).header("x-ratelimit-remaining", "42");
        });

        let host = server.address().to_string();
        let fetcher = HttpFetcher::new(None, &host).unwrap();
        let value = fetcher.get_json(&server.url("/repos/rails/rails")).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_bearer_token_sent_to_github_host_only() {
        let server = MockServer::start();
        let with_auth = server.mock(|when, then| {
            when.method("GET")
                .path("/repos/rails/rails")
                .header("authorization", "Bearer test-token");
            then.status(200).body("{}");
        });

        let host = server.address().to_string();
        let fetcher = HttpFetcher::new(Some("test-token".to_string()), &host).unwrap();
        fetcher.get_json(&server.url("/repos/rails/rails")).await.unwrap();
        assert_eq!(with_auth.hits(), 1);
    }
}
