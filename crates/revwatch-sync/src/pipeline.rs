//! Resolve → fetch both sources → merge, plus the manual multi-product fetch.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use revwatch_core::{split_product_inputs, ArticleId, ProductRef, Review};
use revwatch_sources::{ProductCatalog, ResolveError, ReviewSource, SourceError};
use revwatch_storage::ReviewStore;
use thiserror::Error;
use tracing::{info, warn};

use crate::merge::merge_reviews;

/// Products fetched at once by a manual request.
const MANUAL_FETCH_PARALLELISM: usize = 2;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("product could not be resolved: {0}")]
    ResolutionFailed(#[from] ResolveError),
    #[error("unable to fetch reviews: primary: {primary}; secondary: {secondary}")]
    SourcesFailed {
        primary: SourceError,
        secondary: SourceError,
    },
}

impl DetectError {
    /// `true` when the article simply does not exist upstream.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResolutionFailed(ResolveError::NotFound { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct FetchedProduct {
    pub product: ProductRef,
    /// Merged, newest first.
    pub reviews: Vec<Review>,
}

/// Outcome of one product in a manual fetch.
#[derive(Debug)]
pub enum ProductReport {
    Fetched(FetchedProduct),
    NotFound { article: ArticleId },
    Failed { input: String, reason: String },
}

pub struct ReviewPipeline {
    catalog: Arc<dyn ProductCatalog>,
    primary: Arc<dyn ReviewSource>,
    secondary: Arc<dyn ReviewSource>,
}

impl ReviewPipeline {
    pub fn new(
        catalog: Arc<dyn ProductCatalog>,
        primary: Arc<dyn ReviewSource>,
        secondary: Arc<dyn ReviewSource>,
    ) -> Self {
        Self {
            catalog,
            primary,
            secondary,
        }
    }

    /// Both sources always run; one failing is tolerated, both failing is not.
    pub async fn fetch(&self, article: &ArticleId) -> Result<FetchedProduct, DetectError> {
        let product = self.catalog.resolve(article).await?;

        let (primary, secondary) = tokio::join!(
            self.primary.fetch_reviews(&product),
            self.secondary.fetch_reviews(&product)
        );
        let reviews = match (primary, secondary) {
            (Ok(primary), Ok(secondary)) => merge_reviews(primary, secondary),
            (Ok(primary), Err(err)) => {
                warn!(%article, source = %self.secondary.tag(), error = %err, "review source failed; using the other");
                merge_reviews(primary, Vec::new())
            }
            (Err(err), Ok(secondary)) => {
                warn!(%article, source = %self.primary.tag(), error = %err, "review source failed; using the other");
                merge_reviews(Vec::new(), secondary)
            }
            (Err(primary), Err(secondary)) => {
                return Err(DetectError::SourcesFailed { primary, secondary });
            }
        };

        info!(%article, count = reviews.len(), "reviews merged");
        Ok(FetchedProduct { product, reviews })
    }

    /// Fetches every product named in `input` and saves each successful set.
    ///
    /// Reports come back in input order; a failing product never hides the others.
    pub async fn fetch_products(&self, input: &str, store: &dyn ReviewStore) -> Vec<ProductReport> {
        stream::iter(split_product_inputs(input))
            .map(|raw| async move { self.fetch_one(raw, store).await })
            .buffered(MANUAL_FETCH_PARALLELISM)
            .collect()
            .await
    }

    async fn fetch_one(&self, raw: String, store: &dyn ReviewStore) -> ProductReport {
        let article = match ArticleId::from_input(&raw) {
            Ok(article) => article,
            Err(err) => {
                return ProductReport::Failed {
                    input: raw,
                    reason: err.to_string(),
                }
            }
        };

        match self.fetch(&article).await {
            Ok(fetched) => {
                if let Err(err) = store.save_reviews(&article, &fetched.reviews).await {
                    warn!(%article, error = %err, "could not save fetched reviews");
                }
                ProductReport::Fetched(fetched)
            }
            Err(err) if err.is_not_found() => ProductReport::NotFound { article },
            Err(err) => ProductReport::Failed {
                input: raw,
                reason: err.to_string(),
            },
        }
    }
}
