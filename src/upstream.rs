//! A5 + C6: the upstream Anthropic client and its retrying caller.
//!
//! Adapted from the plain `AnthropicClient` this proxy grew out of: same
//! reqwest client construction and header handling, generalized to forward
//! the caller's raw JSON body unchanged and to retry transient failures
//! with exponential backoff instead of surfacing them on the first try.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::error::{ProxyError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Thin wrapper around reqwest pointed at the configured upstream URL.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    url: String,
    credential: String,
}

impl UpstreamClient {
    pub fn new(url: String, credential: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build upstream HTTP client");
        Self { client, url, credential }
    }

    /// Send the caller's request body to upstream unmodified and return
    /// either the parsed JSON response or a classified error. `forwarded`
    /// carries the caller's own headers (already stripped of credentials and
    /// hop-by-hop headers by the HTTP layer); `anthropic-version` passes
    /// through unchanged if the caller set one, otherwise this client's
    /// default is used.
    async fn send(&self, body: &Value, forwarded: &HeaderMap) -> std::result::Result<Value, SendError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.credential)
            .header("content-type", "application/json");

        if !forwarded.contains_key("anthropic-version") {
            request = request.header("anthropic-version", ANTHROPIC_VERSION);
        }
        for (name, value) in forwarded.iter() {
            request = request.header(name, value);
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_millis = parse_retry_after(response.headers());
            let reset_millis = parse_ratelimit_reset(response.headers());
            return Err(SendError::RateLimited { retry_after_millis, reset_millis });
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::ServerError { status: status.as_u16(), body });
        }

        if !status.is_success() {
            let body: Value = response
                .json()
                .await
                .unwrap_or_else(|_| serde_json::json!({"message": "upstream returned a non-JSON error body"}));
            return Err(SendError::Rejected { status: status.as_u16(), body });
        }

        response
            .json()
            .await
            .map_err(|e| SendError::Network(format!("failed to parse upstream response: {e}")))
    }
}

/// Internal classification of a single upstream call's failure.
enum SendError {
    Network(String),
    RateLimited { retry_after_millis: Option<u64>, reset_millis: Option<u64> },
    ServerError { status: u16, body: String },
    Rejected { status: u16, body: Value },
}

impl SendError {
    fn is_retryable(&self) -> bool {
        matches!(self, SendError::Network(_) | SendError::RateLimited { .. } | SendError::ServerError { .. })
    }
}

/// Retries an `UpstreamClient` call with exponential backoff and jitter,
/// honoring `Retry-After` when upstream sends one.
pub struct RetryingCaller<'a> {
    pub client: &'a UpstreamClient,
    pub policy: &'a RetryPolicy,
}

impl<'a> RetryingCaller<'a> {
    pub fn new(client: &'a UpstreamClient, policy: &'a RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Call upstream, retrying retryable failures up to `max_retries` times
    /// beyond the first attempt.
    pub async fn call(&self, body: &Value, forwarded_headers: &HeaderMap) -> Result<Value> {
        let mut attempt = 0u32;
        loop {
            match self.client.send(body, forwarded_headers).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = err.is_retryable();
                    if !retryable || attempt >= self.policy.max_retries {
                        return Err(self.to_proxy_error(err));
                    }

                    let delay = self.backoff_delay(attempt, &err);
                    tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying upstream call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn to_proxy_error(&self, err: SendError) -> ProxyError {
        match err {
            SendError::Network(msg) => ProxyError::UpstreamExhausted(msg),
            SendError::RateLimited { .. } => {
                ProxyError::UpstreamRateLimitExhausted("429 from upstream on every attempt".to_string())
            }
            SendError::ServerError { status, body } => {
                ProxyError::UpstreamExhausted(format!("upstream {status}: {body}"))
            }
            SendError::Rejected { status, body } => ProxyError::UpstreamRejected { status, body },
        }
    }

    fn backoff_delay(&self, attempt: u32, err: &SendError) -> Duration {
        if let SendError::RateLimited { retry_after_millis: Some(millis), .. } = err {
            return Duration::from_millis(millis + 500);
        }
        if let SendError::RateLimited { reset_millis: Some(millis), .. } = err {
            return Duration::from_millis(millis + 1000);
        }

        let base = self.policy.base_delay_millis.saturating_mul(1u64 << attempt.min(16));
        let capped = base.min(self.policy.max_delay_millis);
        let jitter_span = (capped as f64 * self.policy.jitter_fraction) as u64;
        let jitter = if jitter_span > 0 { rand::rng().random_range(0..=jitter_span) } else { 0 };
        Duration::from_millis(capped + jitter)
    }
}

/// Parse a `Retry-After` header as either delta-seconds or an HTTP-date,
/// per RFC 9110 §10.2.3. Anthropic's API sends delta-seconds but the
/// broader HTTP ecosystem (and some edge proxies) can send a date.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get("retry-after")?.to_str().ok()?;

    if let Ok(seconds) = raw.trim().parse::<u64>() {
        return Some(seconds * 1000);
    }

    let when = DateTime::parse_from_rfc2822(raw.trim()).ok()?;
    let now = Utc::now();
    let millis = (when.with_timezone(&Utc) - now).num_milliseconds();
    Some(millis.max(0) as u64)
}

/// Parse Anthropic's token-bucket reset headers
/// (`anthropic-ratelimit-{requests,tokens}-reset`, RFC 3339 timestamps).
/// Returns the delay until reset only if it falls within the next 120s, per
/// the source's handling of reset hints as a near-term signal rather than a
/// long-horizon schedule.
fn parse_ratelimit_reset(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    const RESET_HEADERS: [&str; 2] =
        ["anthropic-ratelimit-tokens-reset", "anthropic-ratelimit-requests-reset"];

    let now = Utc::now();
    RESET_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .filter_map(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|when| (when.with_timezone(&Utc) - now).num_milliseconds())
        .filter(|&millis| (0..=120_000).contains(&millis))
        .map(|millis| millis as u64)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("3"));
        assert_eq!(parse_retry_after(&headers), Some(3000));
    }

    #[test]
    fn test_parse_retry_after_http_date_in_future() {
        let future = Utc::now() + chrono::Duration::seconds(10);
        let formatted = future.to_rfc2822();
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_str(&formatted).unwrap());
        let parsed = parse_retry_after(&headers).unwrap();
        assert!(parsed > 0 && parsed <= 11_000);
    }

    #[test]
    fn test_parse_retry_after_missing_header() {
        let headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_backoff_delay_grows_with_attempt() {
        let policy = RetryPolicy { max_retries: 5, base_delay_millis: 100, max_delay_millis: 10_000, jitter_fraction: 0.0 };
        let client = UpstreamClient::new("http://localhost".to_string(), "key".to_string(), Duration::from_secs(1));
        let caller = RetryingCaller::new(&client, &policy);

        let d0 = caller.backoff_delay(0, &SendError::Network("x".into()));
        let d1 = caller.backoff_delay(1, &SendError::Network("x".into()));
        let d2 = caller.backoff_delay(2, &SendError::Network("x".into()));
        assert!(d0 < d1);
        assert!(d1 < d2);
    }

    #[test]
    fn test_backoff_delay_respects_cap() {
        let policy = RetryPolicy { max_retries: 20, base_delay_millis: 1000, max_delay_millis: 5000, jitter_fraction: 0.0 };
        let client = UpstreamClient::new("http://localhost".to_string(), "key".to_string(), Duration::from_secs(1));
        let caller = RetryingCaller::new(&client, &policy);

        let d = caller.backoff_delay(10, &SendError::Network("x".into()));
        assert_eq!(d, Duration::from_millis(5000));
    }

    #[test]
    fn test_backoff_delay_honors_retry_after_header() {
        let policy = RetryPolicy::default();
        let client = UpstreamClient::new("http://localhost".to_string(), "key".to_string(), Duration::from_secs(1));
        let caller = RetryingCaller::new(&client, &policy);

        let d = caller.backoff_delay(
            0,
            &SendError::RateLimited { retry_after_millis: Some(3000), reset_millis: None },
        );
        assert_eq!(d, Duration::from_millis(3500));
    }

    #[test]
    fn test_backoff_delay_falls_back_to_ratelimit_reset_header() {
        let policy = RetryPolicy::default();
        let client = UpstreamClient::new("http://localhost".to_string(), "key".to_string(), Duration::from_secs(1));
        let caller = RetryingCaller::new(&client, &policy);

        let d = caller.backoff_delay(
            0,
            &SendError::RateLimited { retry_after_millis: None, reset_millis: Some(5000) },
        );
        assert_eq!(d, Duration::from_millis(6000));
    }

    #[test]
    fn test_parse_ratelimit_reset_within_horizon() {
        let reset_at = Utc::now() + chrono::Duration::seconds(30);
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-ratelimit-tokens-reset", HeaderValue::from_str(&reset_at.to_rfc3339()).unwrap());
        let parsed = parse_ratelimit_reset(&headers).unwrap();
        assert!(parsed > 0 && parsed <= 30_000);
    }

    #[test]
    fn test_parse_ratelimit_reset_beyond_horizon_is_ignored() {
        let reset_at = Utc::now() + chrono::Duration::seconds(300);
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-ratelimit-tokens-reset", HeaderValue::from_str(&reset_at.to_rfc3339()).unwrap());
        assert_eq!(parse_ratelimit_reset(&headers), None);
    }
}
