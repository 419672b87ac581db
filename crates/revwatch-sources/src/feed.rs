//! Primary source: the paginated structured review feed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use revwatch_core::{ProductRef, Review, SourceTag};
use revwatch_storage::{FetchError, Transport};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::dates::{normalize_feed_timestamp, DEFAULT_SOURCE_ZONE};
use crate::{ReviewSource, SourceError};

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Equivalent feed mirrors; the product's group id is appended to each.
    pub endpoints: Vec<String>,
    pub page_size: u32,
    pub max_pages: u32,
    /// Creation timestamps are reduced to calendar dates in this zone.
    pub timezone: Tz,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "https://feedbacks1.wb.ru/feedbacks/v1/".to_string(),
                "https://feedbacks2.wb.ru/feedbacks/v1/".to_string(),
            ],
            page_size: 99,
            max_pages: 50,
            timezone: DEFAULT_SOURCE_ZONE,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    #[serde(default)]
    feedbacks: Option<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedEntry {
    created_date: String,
    product_valuation: i64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    wb_user_details: Option<FeedUser>,
}

#[derive(Debug, Deserialize)]
struct FeedUser {
    #[serde(default)]
    name: Option<String>,
}

/// One decoded feed page. `entries` counts raw items, parsed or not.
#[derive(Debug, Default)]
pub struct FeedPage {
    pub entries: usize,
    pub reviews: Vec<Review>,
    pub skipped: usize,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn entry_to_review(entry: FeedEntry, zone: Tz) -> Option<Review> {
    let rating = Review::rating_from(entry.product_valuation)?;
    Some(Review {
        date: normalize_feed_timestamp(&entry.created_date, zone),
        rating,
        text: entry.text.unwrap_or_default().trim().to_string(),
        author_name: entry
            .wb_user_details
            .and_then(|u| u.name)
            .unwrap_or_default()
            .trim()
            .to_string(),
        color: non_empty(entry.color),
        size: non_empty(entry.size),
        source: SourceTag::Primary,
    })
}

/// Decodes a feed page; malformed entries are skipped one by one.
pub fn parse_feed_page(body: &[u8], zone: Tz) -> Result<FeedPage, serde_json::Error> {
    let envelope: FeedEnvelope = serde_json::from_slice(body)?;
    let raw = envelope.feedbacks.unwrap_or_default();
    let mut page = FeedPage {
        entries: raw.len(),
        ..FeedPage::default()
    };

    for value in raw {
        let parsed = serde_json::from_value::<FeedEntry>(value)
            .map_err(|err| err.to_string())
            .and_then(|entry| entry_to_review(entry, zone).ok_or_else(|| "rating out of range".to_string()));
        match parsed {
            Ok(review) => page.reviews.push(review),
            Err(reason) => {
                warn!(%reason, "skipping malformed feed entry");
                page.skipped += 1;
            }
        }
    }
    Ok(page)
}

pub struct FeedReviewSource {
    transport: Arc<dyn Transport>,
    config: FeedConfig,
}

impl FeedReviewSource {
    pub fn new(transport: Arc<dyn Transport>, config: FeedConfig) -> Self {
        Self { transport, config }
    }

    fn page_url(&self, endpoint: &str, group_id: &str, page: u32) -> String {
        format!(
            "{endpoint}{group_id}?page={page}&take={}",
            self.config.page_size
        )
    }
}

#[async_trait]
impl ReviewSource for FeedReviewSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Primary
    }

    async fn fetch_reviews(&self, product: &ProductRef) -> Result<Vec<Review>, SourceError> {
        let group_id = product.internal_group_id.as_str();
        let mut reviews = Vec::new();
        let mut answered = 0usize;
        let mut last_failure: Option<String> = None;

        for page in 1..=self.config.max_pages {
            let mut page_entries = 0usize;

            // Mirrors may each hold part of a page, so every one is asked.
            for endpoint in &self.config.endpoints {
                let url = self.page_url(endpoint, group_id, page);
                let decoded = match self.transport.get(&url).await {
                    Ok(response) => parse_feed_page(&response.body, self.config.timezone).map_err(|source| {
                        FetchError::Decode {
                            url: response.final_url.clone(),
                            source,
                        }
                        .to_string()
                    }),
                    Err(err) => Err(err.to_string()),
                };

                match decoded {
                    Ok(parsed) => {
                        answered += 1;
                        page_entries += parsed.entries;
                        debug!(%url, entries = parsed.entries, skipped = parsed.skipped, "feed page");
                        reviews.extend(parsed.reviews);
                    }
                    Err(reason) => {
                        warn!(%url, %reason, "feed request failed; treating as empty");
                        last_failure = Some(reason);
                    }
                }
            }

            if page_entries == 0 {
                break;
            }
            if page == self.config.max_pages {
                warn!(group_id, page, "feed page ceiling reached");
            }
        }

        if answered == 0 {
            return Err(SourceError::Unavailable {
                tag: SourceTag::Primary,
                reason: last_failure.unwrap_or_else(|| "no feed endpoints configured".to_string()),
            });
        }

        info!(article = %product.article_id, count = reviews.len(), "primary feed fetched");
        Ok(reviews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use revwatch_core::{ArticleId, ReviewDate};
    use revwatch_storage::FetchedResponse;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    fn fixture(name: &str) -> Vec<u8> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/feed")
            .join(name);
        std::fs::read(path).expect("feed fixture")
    }

    fn product() -> ProductRef {
        ProductRef {
            article_id: ArticleId::parse("146972802").unwrap(),
            internal_group_id: "128776532".into(),
            name: "Термокружка".into(),
            brand: "HomeTrail".into(),
            seller_id: "1043321".into(),
            colors: vec![],
            sizes: vec![],
        }
    }

    /// Serves canned bodies by exact URL; unknown URLs answer 503.
    struct CannedFeed {
        pages: HashMap<String, Vec<u8>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for CannedFeed {
        async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            match self.pages.get(url) {
                Some(body) => Ok(FetchedResponse {
                    status: reqwest::StatusCode::OK,
                    final_url: url.to_string(),
                    body: body.clone(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn config() -> FeedConfig {
        FeedConfig {
            endpoints: vec!["https://f1.test/".into(), "https://f2.test/".into()],
            page_size: 99,
            max_pages: 5,
            ..FeedConfig::default()
        }
    }

    #[test]
    fn malformed_entries_are_skipped_individually() {
        let page = parse_feed_page(&fixture("page1.json"), DEFAULT_SOURCE_ZONE).unwrap();
        assert_eq!(page.entries, 4);
        assert_eq!(page.skipped, 2);
        assert_eq!(page.reviews.len(), 2);

        let first = &page.reviews[0];
        assert_eq!(first.date, ReviewDate::Known(NaiveDate::from_ymd_opt(2024, 1, 12).unwrap()));
        assert_eq!(first.rating, 3);
        assert_eq!(first.author_name, "Борис");
        assert_eq!(first.size.as_deref(), Some("350 мл"));
        assert_eq!(first.source, SourceTag::Primary);
    }

    #[test]
    fn null_feedbacks_is_an_empty_page() {
        let page = parse_feed_page(&fixture("empty.json"), DEFAULT_SOURCE_ZONE).unwrap();
        assert_eq!(page.entries, 0);
        assert!(page.reviews.is_empty());
    }

    #[tokio::test]
    async fn both_mirrors_are_queried_until_an_empty_page() {
        let mut pages = HashMap::new();
        // Mirror one is down for page 1; mirror two carries it.
        pages.insert("https://f2.test/128776532?page=1&take=99".to_string(), fixture("page1.json"));
        pages.insert("https://f1.test/128776532?page=2&take=99".to_string(), fixture("empty.json"));
        pages.insert("https://f2.test/128776532?page=2&take=99".to_string(), fixture("empty.json"));
        let transport = Arc::new(CannedFeed {
            pages,
            calls: Mutex::new(Vec::new()),
        });
        let source = FeedReviewSource::new(transport.clone(), config());

        let reviews = source.fetch_reviews(&product()).await.unwrap();
        assert_eq!(reviews.len(), 2);
        assert_eq!(transport.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn page_ceiling_bounds_a_feed_that_never_ends() {
        let mut pages = HashMap::new();
        for page in 1..=10 {
            pages.insert(format!("https://f1.test/128776532?page={page}&take=99"), fixture("page1.json"));
        }
        let transport = Arc::new(CannedFeed {
            pages,
            calls: Mutex::new(Vec::new()),
        });
        let source = FeedReviewSource::new(transport.clone(), config());

        let reviews = source.fetch_reviews(&product()).await.unwrap();
        assert_eq!(reviews.len(), 10);
        assert_eq!(transport.calls.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn every_request_failing_is_reported_as_unavailable() {
        let transport = Arc::new(CannedFeed {
            pages: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        });
        let source = FeedReviewSource::new(transport, config());

        let err = source.fetch_reviews(&product()).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { tag: SourceTag::Primary, .. }));
    }
}
