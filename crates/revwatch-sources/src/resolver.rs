//! Product metadata lookup across numbered catalog shards, with a TTL cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use revwatch_core::{ArticleId, ProductRef};
use revwatch_storage::{FetchError, Transport};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Placeholders: `{shard}` (two digits), `{vol}`, `{part}`, `{article}`.
    pub card_url_template: String,
    pub first_shard: u32,
    pub last_shard: u32,
    pub cache_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            card_url_template:
                "https://basket-{shard}.wbbasket.ru/vol{vol}/part{part}/{article}/info/ru/card.json"
                    .to_string(),
            first_shard: 1,
            last_shard: 18,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no catalog shard knows article {article} ({probed} candidates probed)")]
    NotFound { article: ArticleId, probed: usize },
    #[error("every catalog shard was unreachable for article {article}: {last_error}")]
    Unreachable {
        article: ArticleId,
        last_error: FetchError,
    },
    #[error("catalog card for article {article} is malformed: {source}")]
    MalformedCard {
        article: ArticleId,
        #[source]
        source: FetchError,
    },
}

/// Anything that can turn an article id into product metadata.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn resolve(&self, article: &ArticleId) -> Result<ProductRef, ResolveError>;
}

/// Ordered candidate card URLs for an article, one per shard.
pub fn shard_candidates(config: &ResolverConfig, article: &ArticleId) -> Vec<String> {
    let numeric = article.as_u64();
    let vol = (numeric / 100_000).to_string();
    let part = (numeric / 1_000).to_string();
    (config.first_shard..=config.last_shard)
        .map(|shard| {
            config
                .card_url_template
                .replace("{shard}", &format!("{shard:02}"))
                .replace("{vol}", &vol)
                .replace("{part}", &part)
                .replace("{article}", article.as_str())
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ProductCard {
    imt_id: u64,
    #[serde(default)]
    imt_name: Option<String>,
    #[serde(default)]
    selling: Option<CardSelling>,
    #[serde(default)]
    colors: Vec<JsonValue>,
    #[serde(default)]
    sizes_table: Option<CardSizesTable>,
}

#[derive(Debug, Deserialize)]
struct CardSelling {
    #[serde(default)]
    brand_name: Option<String>,
    #[serde(default)]
    supplier_id: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct CardSizesTable {
    #[serde(default)]
    values: Vec<CardSize>,
}

#[derive(Debug, Deserialize)]
struct CardSize {
    #[serde(default)]
    tech_size: Option<String>,
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Object(map) => map.get("name").and_then(scalar_text),
        _ => None,
    }
}

pub fn parse_product_card(article: &ArticleId, body: &[u8]) -> Result<ProductRef, serde_json::Error> {
    let card: ProductCard = serde_json::from_slice(body)?;
    let selling = card.selling.as_ref();
    Ok(ProductRef {
        article_id: article.clone(),
        internal_group_id: card.imt_id.to_string(),
        name: card.imt_name.unwrap_or_default(),
        brand: selling
            .and_then(|s| s.brand_name.clone())
            .unwrap_or_default(),
        seller_id: selling
            .and_then(|s| s.supplier_id.as_ref())
            .and_then(scalar_text)
            .unwrap_or_default(),
        colors: card.colors.iter().filter_map(scalar_text).collect(),
        sizes: card
            .sizes_table
            .map(|t| t.values.into_iter().filter_map(|v| v.tech_size).collect())
            .unwrap_or_default(),
    })
}

#[derive(Debug, Clone)]
struct CachedProduct {
    product: ProductRef,
    resolved_at: Instant,
}

pub struct ProductResolver {
    transport: Arc<dyn Transport>,
    config: ResolverConfig,
    cache: RwLock<HashMap<ArticleId, CachedProduct>>,
}

impl ProductResolver {
    pub fn new(transport: Arc<dyn Transport>, config: ResolverConfig) -> Self {
        Self {
            transport,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn cached(&self, article: &ArticleId) -> Option<ProductRef> {
        let cache = self.cache.read().await;
        cache
            .get(article)
            .filter(|entry| entry.resolved_at.elapsed() < self.config.cache_ttl)
            .map(|entry| entry.product.clone())
    }

    async fn probe_shards(&self, article: &ArticleId) -> Result<ProductRef, ResolveError> {
        let candidates = shard_candidates(&self.config, article);
        let probed = candidates.len();
        let mut saw_response = false;
        let mut last_error = None;

        for url in candidates {
            match self.transport.get(&url).await {
                Ok(response) => {
                    let card = parse_product_card(article, &response.body).map_err(|source| {
                        ResolveError::MalformedCard {
                            article: article.clone(),
                            source: FetchError::Decode {
                                url: response.final_url.clone(),
                                source,
                            },
                        }
                    })?;
                    info!(%article, %url, group = %card.internal_group_id, "resolved product");
                    return Ok(card);
                }
                Err(FetchError::HttpStatus { status, .. }) => {
                    saw_response = true;
                    debug!(%article, %url, status, "shard candidate missed");
                }
                Err(err) => {
                    warn!(%article, %url, error = %err, "shard candidate unreachable");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(last_error) if !saw_response => Err(ResolveError::Unreachable {
                article: article.clone(),
                last_error,
            }),
            _ => Err(ResolveError::NotFound {
                article: article.clone(),
                probed,
            }),
        }
    }
}

#[async_trait]
impl ProductCatalog for ProductResolver {
    async fn resolve(&self, article: &ArticleId) -> Result<ProductRef, ResolveError> {
        if let Some(product) = self.cached(article).await {
            return Ok(product);
        }

        // Concurrent misses for one article may both probe; either result is fine.
        let product = self.probe_shards(article).await?;
        self.cache.write().await.insert(
            article.clone(),
            CachedProduct {
                product: product.clone(),
                resolved_at: Instant::now(),
            },
        );
        Ok(product)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revwatch_storage::FetchedResponse;
    use std::path::Path;
    use std::sync::Mutex;

    fn card_fixture() -> Vec<u8> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/catalog/card.json");
        std::fs::read(path).expect("card fixture")
    }

    /// Answers 200 with the card fixture for URLs containing `hit`, 404 otherwise.
    struct ShardResponder {
        hit: Option<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ShardResponder {
        fn new(hit: Option<&str>) -> Self {
            Self {
                hit: hit.map(ToString::to_string),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ShardResponder {
        async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            match &self.hit {
                Some(hit) if url.contains(hit.as_str()) => Ok(FetchedResponse {
                    status: reqwest::StatusCode::OK,
                    final_url: url.to_string(),
                    body: card_fixture(),
                }),
                _ => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn article() -> ArticleId {
        ArticleId::parse("146972802").unwrap()
    }

    #[test]
    fn candidates_cover_the_shard_range_in_order() {
        let urls = shard_candidates(&ResolverConfig::default(), &article());
        assert_eq!(urls.len(), 18);
        assert_eq!(
            urls[0],
            "https://basket-01.wbbasket.ru/vol1469/part146972/146972802/info/ru/card.json"
        );
        assert!(urls[17].starts_with("https://basket-18."));
    }

    #[test]
    fn card_fixture_parses_into_product_ref() {
        let product = parse_product_card(&article(), &card_fixture()).unwrap();
        assert_eq!(product.internal_group_id, "128776532");
        assert_eq!(product.name, "Термокружка с крышкой");
        assert_eq!(product.brand, "HomeTrail");
        assert_eq!(product.seller_id, "1043321");
        assert_eq!(product.colors, vec!["черный".to_string()]);
        assert_eq!(product.sizes, vec!["350 мл".to_string(), "500 мл".to_string()]);
    }

    #[tokio::test]
    async fn stops_probing_at_first_successful_shard() {
        let responder = Arc::new(ShardResponder::new(Some("basket-04.")));
        let resolver = ProductResolver::new(responder.clone(), ResolverConfig::default());

        let product = resolver.resolve(&article()).await.unwrap();
        assert_eq!(product.article_id, article());
        let calls = responder.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[3].contains("basket-04."));
    }

    #[tokio::test]
    async fn exhausted_candidates_raise_not_found() {
        let responder = Arc::new(ShardResponder::new(None));
        let resolver = ProductResolver::new(responder.clone(), ResolverConfig::default());

        let err = resolver.resolve(&article()).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { probed: 18, .. }));
        assert_eq!(responder.calls().len(), 18);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_serves_hits_until_ttl_expires() {
        let responder = Arc::new(ShardResponder::new(Some("basket-01.")));
        let config = ResolverConfig {
            cache_ttl: Duration::from_secs(60),
            ..ResolverConfig::default()
        };
        let resolver = ProductResolver::new(responder.clone(), config);

        resolver.resolve(&article()).await.unwrap();
        resolver.resolve(&article()).await.unwrap();
        assert_eq!(responder.calls().len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        resolver.resolve(&article()).await.unwrap();
        assert_eq!(responder.calls().len(), 2);
    }
}
