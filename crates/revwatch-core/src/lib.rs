//! Core domain model for review tracking: products, reviews, subscriptions.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "revwatch-core";

/// Display format used for review dates in notifications and exports.
pub const DISPLAY_DATE_FORMAT: &str = "%d.%m.%Y";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArticleIdError {
    #[error("article id is empty")]
    Empty,
    #[error("article id must be a positive integer, got {0:?}")]
    NotNumeric(String),
    #[error("no article id found in {0:?}")]
    Unrecognized(String),
}

/// Opaque numeric catalog identifier. Always holds a non-empty run of ASCII
/// digits that fits in a `u64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArticleId(String);

impl ArticleId {
    pub fn parse(raw: &str) -> Result<Self, ArticleIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ArticleIdError::Empty);
        }
        if !trimmed.chars().all(|c| c.is_ascii_digit()) || trimmed.parse::<u64>().is_err() {
            return Err(ArticleIdError::NotNumeric(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Accepts a bare id or a product page URL
    /// (`/catalog/<id>/detail.aspx`, `/product/<slug>/<id>`).
    pub fn from_input(input: &str) -> Result<Self, ArticleIdError> {
        let input = input.trim();
        if !(input.starts_with("http://") || input.starts_with("https://")) {
            return Self::parse(input);
        }

        let without_scheme = input.split_once("://").map(|(_, rest)| rest).unwrap_or(input);
        let path = without_scheme
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let segments: Vec<&str> = path.split('/').skip(1).collect();

        for (idx, segment) in segments.iter().enumerate() {
            let candidate = match *segment {
                "catalog" => segments.get(idx + 1),
                "product" => segments.get(idx + 2),
                _ => None,
            };
            if let Some(candidate) = candidate {
                if let Ok(id) = Self::parse(candidate) {
                    return Ok(id);
                }
            }
        }
        Err(ArticleIdError::Unrecognized(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_u64(&self) -> u64 {
        // Validated on construction.
        self.0.parse().unwrap_or_default()
    }
}

impl fmt::Display for ArticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ArticleId {
    type Err = ArticleIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ArticleId {
    type Error = ArticleIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ArticleId> for String {
    fn from(value: ArticleId) -> Self {
        value.0
    }
}

/// Splits a manual request into individual product inputs. A bracketed,
/// comma-separated list (`[123, 456]`) yields several; anything else yields one.
pub fn split_product_inputs(input: &str) -> Vec<String> {
    let trimmed = input.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'));
    match inner {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        None if trimmed.is_empty() => Vec::new(),
        None => vec![trimmed.to_string()],
    }
}

/// Product metadata resolved from the catalog shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub article_id: ArticleId,
    pub internal_group_id: String,
    pub name: String,
    pub brand: String,
    pub seller_id: String,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub sizes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Primary,
    Secondary,
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTag::Primary => f.write_str("primary"),
            SourceTag::Secondary => f.write_str("secondary"),
        }
    }
}

/// Calendar date of a review. Dates a source could not normalize are kept as
/// their original text rather than dropped.
///
/// Ordering puts every `Unparsed` value before every `Known` one, so a
/// newest-first sort leaves unparsed dates at the tail.
///
/// Serialized as `"2024-01-10"` when known and `{"unparsed": "..."}` otherwise,
/// so raw text that happens to look like a date keeps its meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "StoredDate", into = "StoredDate")]
pub enum ReviewDate {
    Known(NaiveDate),
    Unparsed(String),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StoredDate {
    Known(NaiveDate),
    Unparsed { unparsed: String },
}

impl From<StoredDate> for ReviewDate {
    fn from(stored: StoredDate) -> Self {
        match stored {
            StoredDate::Known(date) => ReviewDate::Known(date),
            StoredDate::Unparsed { unparsed } => ReviewDate::Unparsed(unparsed),
        }
    }
}

impl From<ReviewDate> for StoredDate {
    fn from(date: ReviewDate) -> Self {
        match date {
            ReviewDate::Known(date) => StoredDate::Known(date),
            ReviewDate::Unparsed(unparsed) => StoredDate::Unparsed { unparsed },
        }
    }
}

impl ReviewDate {
    pub fn known(&self) -> Option<NaiveDate> {
        match self {
            ReviewDate::Known(date) => Some(*date),
            ReviewDate::Unparsed(_) => None,
        }
    }

    /// Strictly later than `checkpoint`. Unparsed dates never count as newer.
    pub fn is_after(&self, checkpoint: NaiveDate) -> bool {
        self.known().is_some_and(|date| date > checkpoint)
    }
}

impl Ord for ReviewDate {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ReviewDate::Known(a), ReviewDate::Known(b)) => a.cmp(b),
            (ReviewDate::Unparsed(a), ReviewDate::Unparsed(b)) => a.cmp(b),
            (ReviewDate::Unparsed(_), ReviewDate::Known(_)) => Ordering::Less,
            (ReviewDate::Known(_), ReviewDate::Unparsed(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for ReviewDate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ReviewDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewDate::Known(date) => write!(f, "{}", date.format(DISPLAY_DATE_FORMAT)),
            ReviewDate::Unparsed(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub date: ReviewDate,
    pub rating: u8,
    pub text: String,
    pub author_name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    pub source: SourceTag,
}

impl Review {
    /// Accepts only star ratings in `1..=5`.
    pub fn rating_from(value: i64) -> Option<u8> {
        u8::try_from(value).ok().filter(|v| (1..=5).contains(v))
    }

    pub fn identity_key(&self) -> ReviewKey {
        ReviewKey {
            date: match &self.date {
                ReviewDate::Known(date) => DateKey::Day(*date),
                ReviewDate::Unparsed(text) => DateKey::Text(normalize_text(text).to_lowercase()),
            },
            rating: self.rating,
            author_name: normalize_text(&self.author_name),
            text: normalize_text(&self.text),
        }
    }

    pub fn is_newer_than(&self, checkpoint: NaiveDate) -> bool {
        self.date.is_after(checkpoint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DateKey {
    Day(NaiveDate),
    Text(String),
}

/// Deduplication identity: `(date, rating, author, text)`, whitespace-normalized.
/// The source tag is not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReviewKey {
    date: DateKey,
    rating: u8,
    author_name: String,
    text: String,
}

impl ReviewKey {
    /// Stable single-line rendering, suitable as hash input.
    pub fn canonical(&self) -> String {
        let date = match &self.date {
            DateKey::Day(date) => date.format("%Y-%m-%d").to_string(),
            DateKey::Text(text) => format!("~{text}"),
        };
        format!("{}\u{1f}{}\u{1f}{}\u{1f}{}", date, self.rating, self.author_name, self.text)
    }
}

fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Newest review by known date; reviews with unparsed dates are ignored.
pub fn newest_review<'a, I>(reviews: I) -> Option<&'a Review>
where
    I: IntoIterator<Item = &'a Review>,
{
    reviews
        .into_iter()
        .filter(|r| r.date.known().is_some())
        .max_by(|a, b| a.date.cmp(&b.date))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub subscriber_id: String,
    pub article_id: ArticleId,
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subscriber_id, self.article_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber_id: String,
    pub article_id: ArticleId,
    pub checkpoint: NaiveDate,
}

impl Subscription {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            subscriber_id: self.subscriber_id.clone(),
            article_id: self.article_id.clone(),
        }
    }

    /// Checkpoint after delivering `delivered`: the newest delivered date, but
    /// never earlier than the current checkpoint.
    pub fn advanced_checkpoint(&self, delivered: &[Review]) -> NaiveDate {
        delivered
            .iter()
            .filter_map(|r| r.date.known())
            .fold(self.checkpoint, NaiveDate::max)
    }
}
