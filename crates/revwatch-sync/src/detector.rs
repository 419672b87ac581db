use std::sync::Arc;

use chrono::NaiveDate;
use revwatch_core::{ArticleId, ProductRef, Review};
use tracing::debug;

use crate::pipeline::{DetectError, ReviewPipeline};

/// Result of one detection run.
#[derive(Debug, Clone)]
pub struct Detection {
    pub product: ProductRef,
    /// The full merged set, newest first.
    pub current: Vec<Review>,
    /// Reviews strictly newer than the checkpoint, newest first.
    pub new_reviews: Vec<Review>,
}

/// Reviews dated strictly after `checkpoint`. Unparsed dates never qualify.
pub fn reviews_after(reviews: &[Review], checkpoint: NaiveDate) -> Vec<Review> {
    reviews
        .iter()
        .filter(|review| review.is_newer_than(checkpoint))
        .cloned()
        .collect()
}

pub struct ChangeDetector {
    pipeline: Arc<ReviewPipeline>,
}

impl ChangeDetector {
    pub fn new(pipeline: Arc<ReviewPipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<ReviewPipeline> {
        &self.pipeline
    }

    pub async fn detect(&self, article: &ArticleId, checkpoint: NaiveDate) -> Result<Detection, DetectError> {
        let fetched = self.pipeline.fetch(article).await?;
        let new_reviews = reviews_after(&fetched.reviews, checkpoint);
        debug!(%article, %checkpoint, new = new_reviews.len(), total = fetched.reviews.len(), "change detection");
        Ok(Detection {
            product: fetched.product,
            current: fetched.reviews,
            new_reviews,
        })
    }

    /// An empty result means "no news"; failures are errors, never an empty list.
    pub async fn new_reviews_since(
        &self,
        article: &ArticleId,
        checkpoint: NaiveDate,
    ) -> Result<Vec<Review>, DetectError> {
        Ok(self.detect(article, checkpoint).await?.new_reviews)
    }
}
