//! Product resolution and the two review acquisition strategies.

use async_trait::async_trait;
use revwatch_core::{ProductRef, Review, SourceTag};
use scraper::{ElementRef, Selector};
use thiserror::Error;

pub mod dates;
pub mod feed;
pub mod rendered;
pub mod resolver;
pub mod webdriver;

pub use feed::{FeedConfig, FeedReviewSource};
pub use rendered::{RenderConfig, RenderedReviewSource};
pub use resolver::{ProductCatalog, ProductResolver, ResolveError, ResolverConfig};
pub use webdriver::{RenderBackend, RenderSession, WebDriverBackend, WebDriverConfig};

pub const CRATE_NAME: &str = "revwatch-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{tag} source unavailable: {reason}")]
    Unavailable { tag: SourceTag, reason: String },
    #[error("rendering session failed: {0}")]
    Session(String),
}

/// One way of obtaining the current reviews of a product.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    fn tag(&self) -> SourceTag;

    async fn fetch_reviews(&self, product: &ProductRef) -> Result<Vec<Review>, SourceError>;
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(element: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}
