//! Review Store contract and a JSON-snapshot implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use revwatch_core::{newest_review, ArticleId, Review, Subscription, SubscriptionKey};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn get_latest_review(&self, article_id: &ArticleId) -> Result<Option<Review>>;

    async fn get_reviews(&self, article_id: &ArticleId) -> Result<Vec<Review>>;

    /// Replaces the stored set for the product.
    async fn save_reviews(&self, article_id: &ArticleId, reviews: &[Review]) -> Result<()>;

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// Returns `false` when the pair already exists; its checkpoint is left as is.
    async fn add_subscription(&self, subscription: &Subscription) -> Result<bool>;

    async fn remove_subscription(&self, key: &SubscriptionKey) -> Result<bool>;

    /// Moves the checkpoint forward only; an earlier date is ignored.
    /// Returns `false` when the subscription no longer exists.
    async fn update_checkpoint(&self, key: &SubscriptionKey, checkpoint: NaiveDate) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredReviewSet {
    last_updated: DateTime<Utc>,
    reviews: Vec<Review>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    #[serde(default)]
    reviews: BTreeMap<ArticleId, StoredReviewSet>,
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

/// Whole-state JSON snapshot, rewritten atomically on every mutation.
/// Without a path it lives in memory only.
#[derive(Debug)]
pub struct FileReviewStore {
    path: Option<PathBuf>,
    state: Mutex<StoreSnapshot>,
}

impl FileReviewStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreSnapshot::default()),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking store path {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            StoreSnapshot::default()
        };
        info!(
            path = %path.display(),
            products = snapshot.reviews.len(),
            subscriptions = snapshot.subscriptions.len(),
            "opened review store"
        );
        Ok(Self {
            path: Some(path),
            state: Mutex::new(snapshot),
        })
    }

    async fn persist(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing store snapshot")?;
        write_atomically(path, &bytes).await
    }
}

/// Temp file in the destination directory, then rename over the target.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating store directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp store file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp store file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp store file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp store {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[async_trait]
impl ReviewStore for FileReviewStore {
    async fn get_latest_review(&self, article_id: &ArticleId) -> Result<Option<Review>> {
        let state = self.state.lock().await;
        Ok(state
            .reviews
            .get(article_id)
            .and_then(|set| newest_review(&set.reviews))
            .cloned())
    }

    async fn get_reviews(&self, article_id: &ArticleId) -> Result<Vec<Review>> {
        let state = self.state.lock().await;
        Ok(state
            .reviews
            .get(article_id)
            .map(|set| set.reviews.clone())
            .unwrap_or_default())
    }

    async fn save_reviews(&self, article_id: &ArticleId, reviews: &[Review]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.reviews.insert(
            article_id.clone(),
            StoredReviewSet {
                last_updated: Utc::now(),
                reviews: reviews.to_vec(),
            },
        );
        self.persist(&state).await
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let state = self.state.lock().await;
        Ok(state.subscriptions.clone())
    }

    async fn add_subscription(&self, subscription: &Subscription) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = subscription.key();
        if state.subscriptions.iter().any(|s| s.key() == key) {
            return Ok(false);
        }
        state.subscriptions.push(subscription.clone());
        self.persist(&state).await?;
        Ok(true)
    }

    async fn remove_subscription(&self, key: &SubscriptionKey) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| &s.key() != key);
        if state.subscriptions.len() == before {
            return Ok(false);
        }
        self.persist(&state).await?;
        Ok(true)
    }

    async fn update_checkpoint(&self, key: &SubscriptionKey, checkpoint: NaiveDate) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(sub) = state.subscriptions.iter_mut().find(|s| &s.key() == key) else {
            return Ok(false);
        };
        if checkpoint <= sub.checkpoint {
            return Ok(true);
        }
        sub.checkpoint = checkpoint;
        self.persist(&state).await?;
        Ok(true)
    }
}
