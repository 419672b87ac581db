//! PostgreSQL-backed Review Store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use revwatch_core::{ArticleId, Review, ReviewDate, SourceTag, Subscription, SubscriptionKey};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::review_fingerprint;
use crate::store::ReviewStore;

const REVIEW_COLUMNS: &str =
    "review_date, review_date_text, rating, body, author_name, color, size, source";

#[derive(Debug, Clone)]
pub struct PgReviewStore {
    pool: PgPool,
}

impl PgReviewStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("review store migrations applied");
        Ok(())
    }
}

fn review_from_row(row: &PgRow) -> Result<Review> {
    let date: Option<NaiveDate> = row.try_get("review_date")?;
    let date_text: Option<String> = row.try_get("review_date_text")?;
    let rating: i16 = row.try_get("rating")?;
    let source: String = row.try_get("source")?;

    let date = match (date, date_text) {
        (Some(date), _) => ReviewDate::Known(date),
        (None, text) => ReviewDate::Unparsed(text.unwrap_or_default()),
    };
    let source = match source.as_str() {
        "secondary" => SourceTag::Secondary,
        _ => SourceTag::Primary,
    };

    Ok(Review {
        date,
        rating: Review::rating_from(rating.into())
            .with_context(|| format!("stored rating {rating} out of range"))?,
        text: row.try_get("body")?,
        author_name: row.try_get("author_name")?,
        color: row.try_get("color")?,
        size: row.try_get("size")?,
        source,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription> {
    let article: String = row.try_get("article_id")?;
    Ok(Subscription {
        subscriber_id: row.try_get("subscriber_id")?,
        article_id: ArticleId::parse(&article)
            .with_context(|| format!("stored article id {article:?}"))?,
        checkpoint: row.try_get("checkpoint_date")?,
    })
}

#[async_trait]
impl ReviewStore for PgReviewStore {
    async fn get_latest_review(&self, article_id: &ArticleId) -> Result<Option<Review>> {
        let row = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews \
             WHERE article_id = $1 AND review_date IS NOT NULL \
             ORDER BY review_date DESC, position ASC LIMIT 1"
        ))
        .bind(article_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("selecting latest review")?;
        row.as_ref().map(review_from_row).transpose()
    }

    async fn get_reviews(&self, article_id: &ArticleId) -> Result<Vec<Review>> {
        let rows = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews WHERE article_id = $1 ORDER BY position ASC"
        ))
        .bind(article_id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("selecting reviews")?;
        rows.iter().map(review_from_row).collect()
    }

    async fn save_reviews(&self, article_id: &ArticleId, reviews: &[Review]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("opening transaction")?;
        sqlx::query("DELETE FROM reviews WHERE article_id = $1")
            .bind(article_id.as_str())
            .execute(&mut *tx)
            .await
            .context("clearing previous review set")?;

        for (position, review) in reviews.iter().enumerate() {
            let (date, date_text) = match &review.date {
                ReviewDate::Known(date) => (Some(*date), None),
                ReviewDate::Unparsed(text) => (None, Some(text.as_str())),
            };
            sqlx::query(
                "INSERT INTO reviews \
                 (article_id, fingerprint, position, review_date, review_date_text, rating, body, author_name, color, size, source) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 ON CONFLICT (article_id, fingerprint) DO NOTHING",
            )
            .bind(article_id.as_str())
            .bind(review_fingerprint(review))
            .bind(position as i32)
            .bind(date)
            .bind(date_text)
            .bind(i16::from(review.rating))
            .bind(&review.text)
            .bind(&review.author_name)
            .bind(review.color.as_deref())
            .bind(review.size.as_deref())
            .bind(review.source.to_string())
            .execute(&mut *tx)
            .await
            .context("inserting review")?;
        }

        tx.commit().await.context("committing review set")?;
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(
            "SELECT subscriber_id, article_id, checkpoint_date FROM subscriptions \
             ORDER BY subscriber_id, article_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("selecting subscriptions")?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn add_subscription(&self, subscription: &Subscription) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO subscriptions (subscriber_id, article_id, checkpoint_date) \
             VALUES ($1, $2, $3) ON CONFLICT (subscriber_id, article_id) DO NOTHING",
        )
        .bind(&subscription.subscriber_id)
        .bind(subscription.article_id.as_str())
        .bind(subscription.checkpoint)
        .execute(&self.pool)
        .await
        .context("inserting subscription")?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_subscription(&self, key: &SubscriptionKey) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM subscriptions WHERE subscriber_id = $1 AND article_id = $2")
                .bind(&key.subscriber_id)
                .bind(key.article_id.as_str())
                .execute(&self.pool)
                .await
                .context("deleting subscription")?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_checkpoint(&self, key: &SubscriptionKey, checkpoint: NaiveDate) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET checkpoint_date = GREATEST(checkpoint_date, $3) \
             WHERE subscriber_id = $1 AND article_id = $2",
        )
        .bind(&key.subscriber_id)
        .bind(key.article_id.as_str())
        .bind(checkpoint)
        .execute(&self.pool)
        .await
        .context("advancing checkpoint")?;
        Ok(result.rows_affected() > 0)
    }
}
