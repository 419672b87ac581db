//! Outbound pacing, HTTP fetch utilities and review persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use revwatch_core::Review;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub mod postgres;
pub mod store;

pub use postgres::PgReviewStore;
pub use store::{FileReviewStore, ReviewStore};

pub const CRATE_NAME: &str = "revwatch-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable content address of a review's identity key.
pub fn review_fingerprint(review: &Review) -> String {
    sha256_hex(review.identity_key().canonical().as_bytes())
}

/// Gate every outbound request passes through before it is issued.
#[async_trait]
pub trait Throttle: Send + Sync {
    async fn wait(&self);
}

/// Global minimum-interval pacer: consecutive releases are at least
/// `1 / rate` apart, however many tasks are waiting.
#[derive(Debug)]
pub struct OutboundThrottle {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl OutboundThrottle {
    /// A non-positive or non-finite rate disables pacing.
    pub fn new(calls_per_second: f64) -> Self {
        let min_interval = if calls_per_second.is_finite() && calls_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / calls_per_second)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

#[async_trait]
impl Throttle for OutboundThrottle {
    async fn wait(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot
        };

        let delay = slot.saturating_duration_since(Instant::now());
        if !delay.is_zero() {
            debug!(wait_ms = delay.as_millis() as u64, "outbound throttle pacing");
        }
        tokio::time::sleep_until(slot).await;
    }
}

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
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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
    pub user_agents: Vec<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agents: Vec::new(),
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetcher is shutting down")]
    Closed,
}

/// Outbound GET capability shared by every fetch strategy.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    throttle: Arc<dyn Throttle>,
    user_agents: Vec<String>,
    next_agent: AtomicUsize,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, throttle: Arc<dyn Throttle>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            throttle,
            user_agents: config.user_agents,
            next_agent: AtomicUsize::new(0),
            backoff: config.backoff,
        })
    }

    fn next_user_agent(&self) -> Option<&str> {
        if self.user_agents.is_empty() {
            return None;
        }
        let idx = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
        self.user_agents.get(idx).map(String::as_str)
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            self.throttle.wait().await;

            let mut request = self.client.get(url);
            if let Some(agent) = self.next_user_agent() {
                request = request.header(USER_AGENT, agent);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl Transport for HttpFetcher {
    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }
}
