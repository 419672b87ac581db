//! Engine configuration: YAML file with every field defaulted, then env overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use revwatch_sources::dates::DEFAULT_SOURCE_ZONE;
use revwatch_sources::{FeedConfig, RenderConfig, ResolverConfig, WebDriverConfig};
use revwatch_storage::{BackoffPolicy, HttpClientConfig};
use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerConfig;

pub const DEFAULT_CONFIG_PATH: &str = "revwatch.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// When set, reviews and subscriptions live in PostgreSQL; otherwise in `state_path`.
    pub database_url: Option<String>,
    pub state_path: PathBuf,
    pub webdriver_url: String,
    pub telegram_token: Option<String>,
    pub telegram_api_base: String,
    /// IANA zone of the storefront; every review date is a calendar day there.
    pub source_timezone: Tz,
    pub http: HttpSection,
    pub catalog: CatalogSection,
    pub feed: FeedSection,
    pub render: RenderSection,
    pub poll: PollSection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            state_path: PathBuf::from("./revwatch-state.json"),
            webdriver_url: "http://127.0.0.1:9515".to_string(),
            telegram_token: None,
            telegram_api_base: "https://api.telegram.org".to_string(),
            source_timezone: DEFAULT_SOURCE_ZONE,
            http: HttpSection::default(),
            catalog: CatalogSection::default(),
            feed: FeedSection::default(),
            render: RenderSection::default(),
            poll: PollSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    /// Outbound calls per second, shared by every fetch strategy.
    pub request_rate: f64,
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub timeout_secs: u64,
    pub global_concurrency: usize,
    pub user_agents: Vec<String>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            request_rate: 3.0,
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            timeout_secs: 20,
            global_concurrency: 16,
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15".to_string(),
                "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0".to_string(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSection {
    pub card_url_template: String,
    pub first_shard: u32,
    pub last_shard: u32,
    pub cache_ttl_secs: u64,
}

impl Default for CatalogSection {
    fn default() -> Self {
        let resolver = ResolverConfig::default();
        Self {
            card_url_template: resolver.card_url_template,
            first_shard: resolver.first_shard,
            last_shard: resolver.last_shard,
            cache_ttl_secs: resolver.cache_ttl.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    pub endpoints: Vec<String>,
    pub page_size: u32,
    pub max_pages: u32,
}

impl Default for FeedSection {
    fn default() -> Self {
        let feed = FeedConfig::default();
        Self {
            endpoints: feed.endpoints,
            page_size: feed.page_size,
            max_pages: feed.max_pages,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSection {
    pub main_domain: String,
    pub max_items: usize,
    pub max_scroll_rounds: usize,
    pub settle_ms: u64,
    pub load_timeout_secs: u64,
    pub collect_timeout_secs: u64,
    pub max_sessions: usize,
}

impl Default for RenderSection {
    fn default() -> Self {
        let render = RenderConfig::default();
        Self {
            main_domain: render.main_domain,
            max_items: render.max_items,
            max_scroll_rounds: render.max_scroll_rounds,
            settle_ms: u64::try_from(render.settle_delay.as_millis()).unwrap_or(u64::MAX),
            load_timeout_secs: render.load_timeout.as_secs(),
            collect_timeout_secs: render.collect_timeout.as_secs(),
            max_sessions: render.max_sessions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSection {
    pub interval_secs: u64,
    pub tick_secs: u64,
    pub job_timeout_secs: u64,
    pub max_concurrent_jobs: usize,
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            tick_secs: 60,
            job_timeout_secs: 300,
            max_concurrent_jobs: 4,
        }
    }
}

impl EngineConfig {
    /// Reads `path` (or `revwatch.yaml` when absent), then applies `REVWATCH_*` env overrides.
    ///
    /// An explicitly named file must exist; the default one is optional.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path).await?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if tokio::fs::try_exists(default_path).await.unwrap_or(false) {
                    Self::from_file(default_path).await?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    async fn from_file(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REVWATCH_DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(url) = lookup("REVWATCH_WEBDRIVER_URL") {
            self.webdriver_url = url;
        }
        if let Some(token) = lookup("REVWATCH_TELEGRAM_TOKEN") {
            self.telegram_token = Some(token);
        }
        if let Some(rate) = lookup("REVWATCH_REQUEST_RATE") {
            self.http.request_rate = rate
                .parse()
                .with_context(|| format!("REVWATCH_REQUEST_RATE is not a number: {rate}"))?;
        }
        if let Some(path) = lookup("REVWATCH_STATE_PATH") {
            self.state_path = PathBuf::from(path);
        }
        if let Some(zone) = lookup("REVWATCH_SOURCE_TIMEZONE") {
            self.source_timezone = zone
                .parse::<Tz>()
                .map_err(|err| anyhow!("REVWATCH_SOURCE_TIMEZONE is not a time zone: {zone}: {err}"))?;
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http.timeout_secs),
            user_agents: self.http.user_agents.clone(),
            global_concurrency: self.http.global_concurrency,
            backoff: BackoffPolicy {
                max_retries: self.http.max_retries,
                base_delay: Duration::from_millis(self.http.backoff_base_ms),
                max_delay: Duration::from_millis(self.http.backoff_max_ms),
            },
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            card_url_template: self.catalog.card_url_template.clone(),
            first_shard: self.catalog.first_shard,
            last_shard: self.catalog.last_shard,
            cache_ttl: Duration::from_secs(self.catalog.cache_ttl_secs),
        }
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            endpoints: self.feed.endpoints.clone(),
            page_size: self.feed.page_size,
            max_pages: self.feed.max_pages,
            timezone: self.source_timezone,
        }
    }

    /// Page collection is capped at four fifths of the job timeout.
    pub fn render_config(&self) -> RenderConfig {
        let job_timeout = Duration::from_secs(self.poll.job_timeout_secs);
        RenderConfig {
            main_domain: self.render.main_domain.clone(),
            max_items: self.render.max_items,
            max_scroll_rounds: self.render.max_scroll_rounds,
            settle_delay: Duration::from_millis(self.render.settle_ms),
            load_timeout: Duration::from_secs(self.render.load_timeout_secs),
            collect_timeout: Duration::from_secs(self.render.collect_timeout_secs)
                .min(job_timeout * 4 / 5),
            max_sessions: self.render.max_sessions,
            timezone: self.source_timezone,
            ..RenderConfig::default()
        }
    }

    pub fn webdriver_config(&self) -> WebDriverConfig {
        WebDriverConfig {
            endpoint: self.webdriver_url.clone(),
            user_agent: self.http.user_agents.first().cloned(),
            ..WebDriverConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll.interval_secs),
            tick: Duration::from_secs(self.poll.tick_secs),
            job_timeout: Duration::from_secs(self.poll.job_timeout_secs),
            max_concurrent_jobs: self.poll.max_concurrent_jobs.max(1),
            timezone: self.source_timezone,
        }
    }
}
