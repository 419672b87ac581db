//! Review pipeline orchestration: merging, change detection, notification and polling.

use std::sync::Arc;

use anyhow::{Context, Result};
use revwatch_sources::{
    FeedReviewSource, ProductResolver, RenderedReviewSource, WebDriverBackend,
};
use revwatch_storage::{FileReviewStore, HttpFetcher, OutboundThrottle, PgReviewStore, ReviewStore, Throttle};
use tracing::info;

pub mod config;
pub mod detector;
pub mod merge;
pub mod notify;
pub mod pipeline;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use detector::{ChangeDetector, Detection};
pub use merge::merge_reviews;
pub use notify::{LogNotifier, Notifier, TelegramNotifier};
pub use pipeline::{DetectError, FetchedProduct, ProductReport, ReviewPipeline};
pub use scheduler::{PollScheduler, SchedulerConfig, SubscribeOutcome, SweepSummary};

pub const CRATE_NAME: &str = "revwatch-sync";

/// Fully wired production components sharing one outbound throttle.
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn ReviewStore>,
    pub pipeline: Arc<ReviewPipeline>,
    pub detector: Arc<ChangeDetector>,
    pub notifier: Arc<dyn Notifier>,
}

impl Engine {
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let store = open_store(&config).await?;

        let throttle: Arc<dyn Throttle> = Arc::new(OutboundThrottle::new(config.http.request_rate));
        let http = Arc::new(
            HttpFetcher::new(config.http_client_config(), throttle.clone())
                .context("building http client")?,
        );
        let resolver = Arc::new(ProductResolver::new(http.clone(), config.resolver_config()));
        let primary = Arc::new(FeedReviewSource::new(http, config.feed_config()));
        let backend = Arc::new(
            WebDriverBackend::new(config.webdriver_config()).context("building webdriver client")?,
        );
        let secondary = Arc::new(RenderedReviewSource::new(backend, throttle, config.render_config()));

        let pipeline = Arc::new(ReviewPipeline::new(resolver, primary, secondary));
        let detector = Arc::new(ChangeDetector::new(pipeline.clone()));

        let notifier: Arc<dyn Notifier> = match &config.telegram_token {
            Some(token) => Arc::new(TelegramNotifier::new(&config.telegram_api_base, token)?),
            None => {
                info!("no telegram token configured; notifications go to the log");
                Arc::new(LogNotifier)
            }
        };

        Ok(Self {
            config: Arc::new(config),
            store,
            pipeline,
            detector,
            notifier,
        })
    }

    pub fn scheduler(&self) -> Arc<PollScheduler> {
        Arc::new(PollScheduler::new(
            self.detector.clone(),
            self.store.clone(),
            self.notifier.clone(),
            self.config.scheduler_config(),
        ))
    }
}

/// PostgreSQL when a database URL is configured, the JSON state file otherwise.
pub async fn open_store(config: &EngineConfig) -> Result<Arc<dyn ReviewStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgReviewStore::connect(url).await?;
            info!("using postgres review store");
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(FileReviewStore::open(config.state_path.clone()).await?)),
    }
}
