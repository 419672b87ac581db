//! Recurring per-subscription polling.
//!
//! Jobs live in an explicit table keyed by `(subscriber, article)`. A single
//! tick reconciles the table with the store and sweeps every due job; each
//! job moves `Scheduled → Running → {Idle | Notifying} → Scheduled`, or to
//! `Removed` on unsubscribe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use revwatch_core::{newest_review, ArticleId, Subscription, SubscriptionKey};
use revwatch_sources::dates::{today_in, DEFAULT_SOURCE_ZONE};
use revwatch_storage::ReviewStore;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::detector::ChangeDetector;
use crate::notify::{format_review_message, Notifier};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub tick: Duration,
    /// Overall bound on one job run; an overrun counts as a failure.
    pub job_timeout: Duration,
    pub max_concurrent_jobs: usize,
    /// Zone whose "today" seeds a checkpoint for a product without reviews.
    pub timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3_600),
            tick: Duration::from_secs(60),
            job_timeout: Duration::from_secs(300),
            max_concurrent_jobs: 4,
            timezone: DEFAULT_SOURCE_ZONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Scheduled,
    Running,
    Idle,
    Notifying,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    NoNews,
    Delivered { count: usize, checkpoint: NaiveDate },
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct PollJob {
    pub subscription: Subscription,
    pub state: JobState,
    pub next_due: Instant,
    pub last_outcome: Option<JobOutcome>,
}

impl PollJob {
    fn new(subscription: Subscription, next_due: Instant) -> Self {
        Self {
            subscription,
            state: JobState::Scheduled,
            next_due,
            last_outcome: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepSummary {
    pub run_id: Uuid,
    pub ran: usize,
    pub delivered_reviews: usize,
    pub no_news: usize,
    pub failed: usize,
}

impl SweepSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            ran: 0,
            delivered_reviews: 0,
            no_news: 0,
            failed: 0,
        }
    }

    fn record(&mut self, outcome: &JobOutcome) {
        self.ran += 1;
        match outcome {
            JobOutcome::NoNews => self.no_news += 1,
            JobOutcome::Delivered { count, .. } => self.delivered_reviews += count,
            JobOutcome::Failed(_) | JobOutcome::TimedOut => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Created { checkpoint: NaiveDate },
    AlreadySubscribed,
}

pub struct PollScheduler {
    detector: Arc<ChangeDetector>,
    store: Arc<dyn ReviewStore>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    jobs: Mutex<BTreeMap<SubscriptionKey, PollJob>>,
}

impl PollScheduler {
    pub fn new(
        detector: Arc<ChangeDetector>,
        store: Arc<dyn ReviewStore>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            detector,
            store,
            notifier,
            config,
            jobs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Rebuilds the job table from stored subscriptions; every job is due at once.
    pub async fn load_from_store(&self) -> Result<usize> {
        let subscriptions = self
            .store
            .list_subscriptions()
            .await
            .context("listing subscriptions")?;
        let now = Instant::now();
        let mut jobs = self.jobs.lock().await;
        jobs.clear();
        for subscription in subscriptions {
            jobs.insert(subscription.key(), PollJob::new(subscription, now));
        }
        info!(jobs = jobs.len(), "job table loaded");
        Ok(jobs.len())
    }

    /// Aligns the job table with the store's subscription rows.
    pub async fn reconcile(&self) -> Result<()> {
        let rows: BTreeMap<SubscriptionKey, Subscription> = self
            .store
            .list_subscriptions()
            .await
            .context("listing subscriptions")?
            .into_iter()
            .map(|s| (s.key(), s))
            .collect();
        let next_due = Instant::now() + self.config.poll_interval;
        let mut jobs = self.jobs.lock().await;

        let gone: Vec<SubscriptionKey> = jobs.keys().filter(|k| !rows.contains_key(*k)).cloned().collect();
        for key in gone {
            info!(%key, "subscription no longer stored; removing job");
            mark_removed(&mut jobs, &key);
        }

        for (key, row) in rows {
            match jobs.get_mut(&key) {
                Some(job) if job.state != JobState::Removed => {
                    if row.checkpoint > job.subscription.checkpoint {
                        job.subscription.checkpoint = row.checkpoint;
                    }
                }
                _ => {
                    info!(%key, "new subscription picked up");
                    jobs.insert(key, PollJob::new(row, next_due));
                }
            }
        }
        Ok(())
    }

    pub async fn subscribe(&self, subscriber_id: &str, article: &ArticleId) -> Result<SubscribeOutcome> {
        let key = SubscriptionKey {
            subscriber_id: subscriber_id.to_string(),
            article_id: article.clone(),
        };
        if matches!(self.job_state(&key).await, Some(state) if state != JobState::Removed) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        // Another process may own the row while this job table is empty.
        let stored = self
            .store
            .list_subscriptions()
            .await
            .context("listing subscriptions")?;
        if stored.iter().any(|subscription| subscription.key() == key) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        let checkpoint = self.seed_checkpoint(article).await?;
        let subscription = Subscription {
            subscriber_id: key.subscriber_id.clone(),
            article_id: article.clone(),
            checkpoint,
        };
        if !self.store.add_subscription(&subscription).await? {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        let next_due = Instant::now() + self.config.poll_interval;
        self.jobs
            .lock()
            .await
            .insert(key.clone(), PollJob::new(subscription, next_due));
        info!(%key, %checkpoint, "subscribed");
        Ok(SubscribeOutcome::Created { checkpoint })
    }

    /// Newest stored review date; otherwise fetch, save, and use the newest
    /// fetched date; otherwise today.
    async fn seed_checkpoint(&self, article: &ArticleId) -> Result<NaiveDate> {
        let stored = self.store.get_latest_review(article).await?;
        if let Some(date) = stored.and_then(|review| review.date.known()) {
            return Ok(date);
        }

        let fetched = self
            .detector
            .pipeline()
            .fetch(article)
            .await
            .with_context(|| format!("fetching reviews for {article}"))?;
        self.store.save_reviews(article, &fetched.reviews).await?;
        Ok(newest_review(&fetched.reviews)
            .and_then(|review| review.date.known())
            .unwrap_or_else(|| today_in(self.config.timezone)))
    }

    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> Result<bool> {
        let removed = self.store.remove_subscription(key).await?;
        mark_removed(&mut *self.jobs.lock().await, key);
        info!(%key, removed, "unsubscribed");
        Ok(removed)
    }

    pub async fn job_state(&self, key: &SubscriptionKey) -> Option<JobState> {
        self.jobs.lock().await.get(key).map(|job| job.state)
    }

    pub async fn jobs(&self) -> Vec<PollJob> {
        self.jobs.lock().await.values().cloned().collect()
    }

    async fn set_state(&self, key: &SubscriptionKey, state: JobState) {
        if let Some(job) = self.jobs.lock().await.get_mut(key) {
            if job.state != JobState::Removed {
                job.state = state;
            }
        }
    }

    pub async fn tick(&self) -> Result<SweepSummary> {
        self.reconcile().await?;
        Ok(self.sweep_at(Instant::now()).await)
    }

    /// Runs every job due at `now`, at most `max_concurrent_jobs` at a time.
    pub async fn sweep_at(&self, now: Instant) -> SweepSummary {
        let run_id = Uuid::new_v4();
        let due: Vec<Subscription> = {
            let mut jobs = self.jobs.lock().await;
            jobs.values_mut()
                .filter(|job| job.state == JobState::Scheduled && job.next_due <= now)
                .map(|job| {
                    job.state = JobState::Running;
                    job.subscription.clone()
                })
                .collect()
        };

        let span = info_span!("sweep", %run_id, due = due.len());
        async {
            let outcomes: Vec<(SubscriptionKey, JobOutcome)> = stream::iter(due)
                .map(|subscription| async move {
                    let key = subscription.key();
                    let outcome = self.run_with_timeout(subscription).await;
                    (key, outcome)
                })
                .buffer_unordered(self.config.max_concurrent_jobs.max(1))
                .collect()
                .await;

            let mut summary = SweepSummary::new(run_id);
            let next_due = now + self.config.poll_interval;
            let mut jobs = self.jobs.lock().await;
            for (key, outcome) in outcomes {
                summary.record(&outcome);
                let state = match jobs.get(&key) {
                    Some(job) => job.state,
                    None => continue,
                };
                if state == JobState::Removed {
                    jobs.remove(&key);
                    continue;
                }
                if let Some(job) = jobs.get_mut(&key) {
                    if !matches!(state, JobState::Running | JobState::Idle | JobState::Notifying) {
                        continue;
                    }
                    if let JobOutcome::Delivered { checkpoint, .. } = &outcome {
                        job.subscription.checkpoint = job.subscription.checkpoint.max(*checkpoint);
                    }
                    job.state = JobState::Scheduled;
                    job.next_due = next_due;
                    job.last_outcome = Some(outcome);
                }
            }
            info!(
                ran = summary.ran,
                delivered = summary.delivered_reviews,
                failed = summary.failed,
                "sweep finished"
            );
            summary
        }
        .instrument(span)
        .await
    }

    async fn run_with_timeout(&self, subscription: Subscription) -> JobOutcome {
        let key = subscription.key();
        match tokio::time::timeout(self.config.job_timeout, self.run_job(subscription)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(%key, timeout = ?self.config.job_timeout, "poll job timed out; checkpoint unchanged");
                JobOutcome::TimedOut
            }
        }
    }

    async fn run_job(&self, subscription: Subscription) -> JobOutcome {
        let key = subscription.key();
        let span = info_span!("poll_job", subscriber_id = %key.subscriber_id, article_id = %key.article_id);
        async move {
            let detection = match self
                .detector
                .detect(&subscription.article_id, subscription.checkpoint)
                .await
            {
                Ok(detection) => detection,
                Err(err) => {
                    warn!(error = %err, "poll job failed; checkpoint unchanged");
                    return JobOutcome::Failed(err.to_string());
                }
            };

            if detection.new_reviews.is_empty() {
                self.set_state(&key, JobState::Idle).await;
                debug!("no new reviews");
                return JobOutcome::NoNews;
            }

            if let Err(err) = self
                .store
                .save_reviews(&subscription.article_id, &detection.current)
                .await
            {
                warn!(error = %err, "could not save reviews; retrying next tick");
                return JobOutcome::Failed(err.to_string());
            }

            self.set_state(&key, JobState::Notifying).await;
            let mut delivered = detection.new_reviews;
            delivered.sort_by(|a, b| a.date.cmp(&b.date));
            for review in &delivered {
                let message = format_review_message(&detection.product, review);
                if let Err(err) = self.notifier.send(&key.subscriber_id, &message).await {
                    warn!(error = %err, "notification not delivered");
                }
            }

            let checkpoint = subscription.advanced_checkpoint(&delivered);
            match self.store.update_checkpoint(&key, checkpoint).await {
                Ok(true) => {}
                Ok(false) => debug!("subscription removed while notifying"),
                Err(err) => {
                    warn!(error = %err, "could not advance checkpoint");
                    return JobOutcome::Failed(err.to_string());
                }
            }
            info!(count = delivered.len(), %checkpoint, "new reviews delivered");
            JobOutcome::Delivered {
                count: delivered.len(),
                checkpoint,
            }
        }
        .instrument(span)
        .await
    }

    /// Loads the job table and ticks on a fixed period until the returned scheduler shuts down.
    pub async fn start(self: Arc<Self>) -> Result<JobScheduler> {
        self.load_from_store().await?;

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let poller = Arc::clone(&self);
        let job = Job::new_repeated_async(self.config.tick, move |_uuid, _lock| {
            let poller = Arc::clone(&poller);
            Box::pin(async move {
                if let Err(err) = poller.tick().await {
                    error!(error = %err, "poll tick failed");
                }
            })
        })
        .context("creating poll tick job")?;
        sched.add(job).await.context("adding poll tick job")?;
        sched.start().await.context("starting scheduler")?;
        info!(tick = ?self.config.tick, interval = ?self.config.poll_interval, "poll scheduler started");
        Ok(sched)
    }
}

/// A running job is flagged and dropped when it finishes; any other is dropped now.
fn mark_removed(jobs: &mut BTreeMap<SubscriptionKey, PollJob>, key: &SubscriptionKey) {
    let running = matches!(
        jobs.get(key).map(|job| job.state),
        Some(JobState::Running | JobState::Idle | JobState::Notifying)
    );
    if running {
        if let Some(job) = jobs.get_mut(key) {
            job.state = JobState::Removed;
        }
    } else {
        jobs.remove(key);
    }
}
