//! Secondary source: the client-rendered feedback page, read through a headless browser.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use revwatch_core::{ProductRef, Review, SourceTag};
use revwatch_storage::Throttle;
use scraper::{ElementRef, Html, Selector};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::dates::{normalize_rendered_date, today_in, DEFAULT_SOURCE_ZONE};
use crate::webdriver::{RenderBackend, RenderSession};
use crate::{select_first_text, ReviewSource, SourceError};

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub main_domain: String,
    /// Item ceiling per product.
    pub max_items: usize,
    pub max_scroll_rounds: usize,
    pub settle_delay: Duration,
    pub load_timeout: Duration,
    /// Bound on one page collection. Keep it below the poll job timeout so
    /// the session is closed before the job is cancelled.
    pub collect_timeout: Duration,
    pub max_sessions: usize,
    pub sort_toggle_selector: String,
    pub newest_first_label: String,
    /// Zone "today" and "yesterday" labels are resolved in.
    pub timezone: Tz,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            main_domain: "https://www.wildberries.ru".to_string(),
            max_items: 1000,
            max_scroll_rounds: 200,
            settle_delay: Duration::from_secs(2),
            load_timeout: Duration::from_secs(30),
            collect_timeout: Duration::from_secs(240),
            max_sessions: 2,
            sort_toggle_selector: ".sorting__mobile--arrow".to_string(),
            newest_first_label: "По дате ↓".to_string(),
            timezone: DEFAULT_SOURCE_ZONE,
        }
    }
}

struct ItemSelectors {
    item: Selector,
    date: Selector,
    star: Selector,
    text: Selector,
    author: Selector,
    color: Selector,
    size: Selector,
}

impl ItemSelectors {
    fn new() -> Result<Self, SourceError> {
        let parse = |css: &str| Selector::parse(css).map_err(|e| SourceError::Session(e.to_string()));
        Ok(Self {
            item: parse("li.comments__item")?,
            date: parse("span.feedback__date")?,
            star: parse("span.star")?,
            text: parse("p.feedback__text")?,
            author: parse("p.feedback__header")?,
            color: parse("li.feedback__params-item--color")?,
            size: parse("li.feedback__params-item--size")?,
        })
    }
}

/// Reviews parsed from one snapshot of the page.
#[derive(Debug, Default)]
pub struct RenderedBatch {
    /// Review items present in the document, parsed or not.
    pub total_items: usize,
    pub reviews: Vec<Review>,
    pub skipped: usize,
}

fn item_to_review(item: &ElementRef<'_>, sel: &ItemSelectors, today: NaiveDate) -> Option<Review> {
    let date_text = select_first_text(item, &sel.date)?;
    let text = select_first_text(item, &sel.text)?;
    let author_name = select_first_text(item, &sel.author)?;
    let stars = i64::try_from(item.select(&sel.star).count()).ok()?;
    let rating = Review::rating_from(stars)?;
    Some(Review {
        date: normalize_rendered_date(&date_text, today),
        rating,
        text,
        author_name,
        color: select_first_text(item, &sel.color),
        size: select_first_text(item, &sel.size),
        source: SourceTag::Secondary,
    })
}

/// Parses review items from a page snapshot, ignoring the first `already_seen`.
pub fn parse_rendered_reviews(
    html: &str,
    today: NaiveDate,
    already_seen: usize,
) -> Result<RenderedBatch, SourceError> {
    let sel = ItemSelectors::new()?;
    let document = Html::parse_document(html);
    let items: Vec<ElementRef<'_>> = document.select(&sel.item).collect();
    let mut batch = RenderedBatch {
        total_items: items.len(),
        ..RenderedBatch::default()
    };

    for item in items.iter().skip(already_seen) {
        match item_to_review(item, &sel, today) {
            Some(review) => batch.reviews.push(review),
            None => batch.skipped += 1,
        }
    }
    if batch.skipped > 0 {
        debug!(skipped = batch.skipped, "rendered items without required fields");
    }
    Ok(batch)
}

pub struct RenderedReviewSource {
    backend: Arc<dyn RenderBackend>,
    throttle: Arc<dyn Throttle>,
    sessions: Semaphore,
    config: RenderConfig,
}

impl RenderedReviewSource {
    pub fn new(backend: Arc<dyn RenderBackend>, throttle: Arc<dyn Throttle>, config: RenderConfig) -> Self {
        Self {
            backend,
            throttle,
            sessions: Semaphore::new(config.max_sessions.max(1)),
            config,
        }
    }

    fn feedbacks_url(&self, product: &ProductRef) -> String {
        format!(
            "{}/catalog/{}/feedbacks",
            self.config.main_domain.trim_end_matches('/'),
            product.article_id
        )
    }

    async fn ensure_newest_first(&self, session: &mut dyn RenderSession) {
        let selector = self.config.sort_toggle_selector.as_str();
        match session.element_text(selector).await {
            Ok(Some(label)) if label.contains(&self.config.newest_first_label) => {
                debug!("feedbacks already sorted newest first");
            }
            Ok(Some(label)) => {
                self.throttle.wait().await;
                match session.click(selector).await {
                    Ok(true) => {
                        debug!(%label, "toggled feedback ordering");
                        tokio::time::sleep(self.config.settle_delay).await;
                    }
                    Ok(false) => warn!("sort toggle vanished before click"),
                    Err(err) => warn!(error = %err, "could not toggle feedback ordering"),
                }
            }
            Ok(None) => warn!(selector, "sort toggle not found; keeping page order"),
            Err(err) => warn!(error = %err, "could not read sort toggle"),
        }
    }

    async fn collect(
        &self,
        session: &mut dyn RenderSession,
        product: &ProductRef,
    ) -> Result<Vec<Review>, SourceError> {
        let url = self.feedbacks_url(product);
        self.throttle.wait().await;
        session.goto(&url).await?;
        session.wait_until_ready(self.config.load_timeout).await?;
        self.ensure_newest_first(session).await;

        let today = today_in(self.config.timezone);
        let mut reviews = Vec::new();
        let mut seen = 0usize;

        for round in 0..self.config.max_scroll_rounds {
            let html = session.page_source().await?;
            let batch = parse_rendered_reviews(&html, today, seen)?;
            if round > 0 && batch.total_items <= seen {
                debug!(round, seen, "no new items after scroll");
                break;
            }
            seen = batch.total_items;
            reviews.extend(batch.reviews);
            if seen >= self.config.max_items {
                info!(article = %product.article_id, seen, "rendered item ceiling reached");
                break;
            }

            self.throttle.wait().await;
            session.scroll_to_bottom().await?;
            tokio::time::sleep(self.config.settle_delay).await;
        }

        reviews.truncate(self.config.max_items);
        Ok(reviews)
    }
}

#[async_trait]
impl ReviewSource for RenderedReviewSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Secondary
    }

    async fn fetch_reviews(&self, product: &ProductRef) -> Result<Vec<Review>, SourceError> {
        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|_| SourceError::Session("render session pool closed".into()))?;

        let mut session = self.backend.open().await?;
        let limit = self.config.collect_timeout;
        let result = match tokio::time::timeout(limit, self.collect(session.as_mut(), product)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(article = %product.article_id, ?limit, "page collection timed out");
                Err(SourceError::Session(format!("page not collected within {limit:?}")))
            }
        };
        if let Err(err) = session.close().await {
            warn!(error = %err, "failed to close render session");
        }

        let reviews = result.map_err(|err| SourceError::Unavailable {
            tag: SourceTag::Secondary,
            reason: err.to_string(),
        })?;
        info!(article = %product.article_id, count = reviews.len(), "secondary page rendered");
        Ok(reviews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revwatch_core::{ArticleId, ReviewDate};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fixture() -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/rendered/feedbacks.html");
        std::fs::read_to_string(path).expect("rendered fixture")
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
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

    #[test]
    fn fixture_items_parse_and_incomplete_ones_are_skipped() {
        let today = day(2024, 3, 1);
        let batch = parse_rendered_reviews(&fixture(), today, 0).unwrap();
        assert_eq!(batch.total_items, 4);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.reviews.len(), 3);

        let boris = &batch.reviews[0];
        assert_eq!(boris.author_name, "Борис");
        assert_eq!(boris.rating, 3);
        assert_eq!(boris.date, ReviewDate::Known(today));
        assert_eq!(boris.color.as_deref(), Some("черный"));
        assert_eq!(boris.size, None);
        assert_eq!(boris.source, SourceTag::Secondary);

        let anna = &batch.reviews[1];
        assert_eq!(anna.date, ReviewDate::Known(day(2024, 1, 10)));
        assert_eq!(anna.size.as_deref(), Some("500 мл"));

        let vera = &batch.reviews[2];
        assert_eq!(vera.date, ReviewDate::Unparsed("на прошлой неделе".into()));
        assert_eq!(vera.rating, 4);
    }

    #[test]
    fn already_seen_items_are_not_parsed_again() {
        let batch = parse_rendered_reviews(&fixture(), day(2024, 3, 1), 2).unwrap();
        assert_eq!(batch.total_items, 4);
        assert_eq!(batch.reviews.len(), 1);
        assert_eq!(batch.reviews[0].author_name, "Вера");
    }

    fn page_with(count: usize) -> String {
        let items: String = (0..count)
            .map(|i| {
                format!(
                    r#"<li class="comments__item"><p class="feedback__header">u{i}</p>
                    <span class="feedback__date">07.11.2021</span>
                    <span class="star"></span><span class="star"></span>
                    <p class="feedback__text">review {i}</p></li>"#
                )
            })
            .collect();
        format!(r#"<html><body><button class="sorting__mobile--arrow">По дате ↑</button><ul>{items}</ul></body></html>"#)
    }

    #[derive(Default)]
    struct SessionLog {
        visited: Vec<String>,
        clicks: usize,
        scrolls: usize,
        closed: bool,
    }

    /// Each scroll reveals the next snapshot; the last one repeats. Without
    /// snapshots the page never answers.
    struct ScriptedSession {
        snapshots: Vec<String>,
        log: Arc<Mutex<SessionLog>>,
    }

    #[async_trait]
    impl RenderSession for ScriptedSession {
        async fn goto(&mut self, url: &str) -> Result<(), SourceError> {
            self.log.lock().unwrap().visited.push(url.to_string());
            Ok(())
        }

        async fn wait_until_ready(&mut self, _timeout: Duration) -> Result<(), SourceError> {
            Ok(())
        }

        async fn element_text(&mut self, _selector: &str) -> Result<Option<String>, SourceError> {
            Ok(Some("По дате ↑".into()))
        }

        async fn click(&mut self, _selector: &str) -> Result<bool, SourceError> {
            self.log.lock().unwrap().clicks += 1;
            Ok(true)
        }

        async fn scroll_to_bottom(&mut self) -> Result<(), SourceError> {
            self.log.lock().unwrap().scrolls += 1;
            Ok(())
        }

        async fn page_source(&mut self) -> Result<String, SourceError> {
            if self.snapshots.is_empty() {
                std::future::pending::<()>().await;
            }
            let scrolls = self.log.lock().unwrap().scrolls;
            let index = scrolls.min(self.snapshots.len() - 1);
            Ok(self.snapshots[index].clone())
        }

        async fn close(&mut self) -> Result<(), SourceError> {
            self.log.lock().unwrap().closed = true;
            Ok(())
        }
    }

    struct ScriptedBackend {
        snapshots: Vec<String>,
        log: Arc<Mutex<SessionLog>>,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl RenderBackend for ScriptedBackend {
        async fn open(&self) -> Result<Box<dyn RenderSession>, SourceError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSession {
                snapshots: self.snapshots.clone(),
                log: self.log.clone(),
            }))
        }
    }

    struct NoThrottle;

    #[async_trait]
    impl Throttle for NoThrottle {
        async fn wait(&self) {}
    }

    fn source(snapshots: Vec<String>, max_items: usize) -> (RenderedReviewSource, Arc<Mutex<SessionLog>>) {
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let backend = Arc::new(ScriptedBackend {
            snapshots,
            log: log.clone(),
            opened: AtomicUsize::new(0),
        });
        let config = RenderConfig {
            main_domain: "https://shop.test/".into(),
            max_items,
            ..RenderConfig::default()
        };
        (RenderedReviewSource::new(backend, Arc::new(NoThrottle), config), log)
    }

    #[tokio::test(start_paused = true)]
    async fn scrolls_until_the_page_stops_growing() {
        let (source, log) = source(vec![page_with(2), page_with(5), page_with(5)], 1000);

        let reviews = source.fetch_reviews(&product()).await.unwrap();
        assert_eq!(reviews.len(), 5);
        assert_eq!(reviews[4].text, "review 4");

        let log = log.lock().unwrap();
        assert_eq!(log.visited, vec!["https://shop.test/catalog/146972802/feedbacks".to_string()]);
        assert_eq!(log.clicks, 1);
        assert_eq!(log.scrolls, 2);
        assert!(log.closed);
    }

    #[tokio::test(start_paused = true)]
    async fn item_ceiling_truncates_collection() {
        let (source, log) = source(vec![page_with(3), page_with(6), page_with(9)], 4);

        let reviews = source.fetch_reviews(&product()).await.unwrap();
        assert_eq!(reviews.len(), 4);
        assert_eq!(log.lock().unwrap().scrolls, 1);
        assert!(log.lock().unwrap().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_page_still_closes_its_session() {
        let (source, log) = source(Vec::new(), 1000);

        let outcome = tokio::time::timeout(Duration::from_secs(300), source.fetch_reviews(&product()))
            .await
            .expect("collection bounded below the caller's timeout");

        assert!(matches!(
            outcome,
            Err(SourceError::Unavailable { tag: SourceTag::Secondary, .. })
        ));
        assert!(log.lock().unwrap().closed);
        assert_eq!(source.sessions.available_permits(), 2);
    }
}
