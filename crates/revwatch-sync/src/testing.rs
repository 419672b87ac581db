//! In-memory collaborators shared by this crate's unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use revwatch_core::{ArticleId, ProductRef, Review, ReviewDate, SourceTag};
use revwatch_sources::{ProductCatalog, ResolveError, ReviewSource, SourceError};

use crate::notify::Notifier;

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn dated(date: &str, rating: u8, author: &str, text: &str) -> Review {
    Review {
        date: ReviewDate::Known(NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap()),
        rating,
        text: text.into(),
        author_name: author.into(),
        color: None,
        size: None,
        source: SourceTag::Primary,
    }
}

pub struct FakeCatalog {
    known: HashSet<String>,
    pub calls: AtomicUsize,
}

impl FakeCatalog {
    pub fn knowing(articles: &[&str]) -> Self {
        Self {
            known: articles.iter().map(ToString::to_string).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProductCatalog for FakeCatalog {
    async fn resolve(&self, article: &ArticleId) -> Result<ProductRef, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.known.contains(article.as_str()) {
            return Err(ResolveError::NotFound {
                article: article.clone(),
                probed: 18,
            });
        }
        Ok(ProductRef {
            article_id: article.clone(),
            internal_group_id: format!("group-{article}"),
            name: format!("Product {article}"),
            brand: "Brand".into(),
            seller_id: "1".into(),
            colors: vec![],
            sizes: vec![],
        })
    }
}

pub struct FakeSource {
    tag: SourceTag,
    reviews: Mutex<Option<Vec<Review>>>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeSource {
    pub fn ok(tag: SourceTag, reviews: Vec<Review>) -> Self {
        Self {
            tag,
            reviews: Mutex::new(Some(reviews)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(tag: SourceTag) -> Self {
        Self {
            reviews: Mutex::new(None),
            ..Self::ok(tag, Vec::new())
        }
    }

    pub fn slow(tag: SourceTag, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::ok(tag, Vec::new())
        }
    }

    pub fn set_reviews(&self, reviews: Vec<Review>) {
        *self.reviews.lock().unwrap() = Some(reviews);
    }
}

#[async_trait]
impl ReviewSource for FakeSource {
    fn tag(&self) -> SourceTag {
        self.tag
    }

    async fn fetch_reviews(&self, _product: &ProductRef) -> Result<Vec<Review>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reviews = self.reviews.lock().unwrap().clone();
        reviews.ok_or_else(|| SourceError::Unavailable {
            tag: self.tag,
            reason: "scripted failure".into(),
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, subscriber_id: &str, message: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((subscriber_id.to_string(), message.to_string()));
        if self.fail {
            anyhow::bail!("delivery refused");
        }
        Ok(())
    }
}
