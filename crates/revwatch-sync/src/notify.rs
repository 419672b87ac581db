//! Delivery of "new review" messages to subscribers.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use revwatch_core::{ProductRef, Review};
use serde::Serialize;
use tracing::info;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subscriber_id: &str, message: &str) -> Result<()>;
}

/// Plain-text message announcing one review.
pub fn format_review_message(product: &ProductRef, review: &Review) -> String {
    let title = if product.brand.is_empty() {
        product.name.clone()
    } else {
        format!("{} / {}", product.brand, product.name)
    };
    let mut message = format!(
        "New review for {title} (article {})\nRating: {}/5\nDate: {}\nAuthor: {}\n",
        product.article_id, review.rating, review.date, review.author_name
    );
    if let Some(color) = &review.color {
        message.push_str(&format!("Color: {color}\n"));
    }
    if let Some(size) = &review.size {
        message.push_str(&format!("Size: {size}\n"));
    }
    message.push('\n');
    message.push_str(&review.text);
    message
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, subscriber_id: &str, message: &str) -> Result<()> {
        info!(subscriber_id, %message, "notification");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Delivers through the Telegram Bot API; subscriber ids are chat ids.
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("building telegram client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/bot{token}/sendMessage", api_base.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, subscriber_id: &str, message: &str) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(&SendMessage {
                chat_id: subscriber_id,
                text: message,
            })
            .send()
            .await
            .context("sending telegram message")?
            .error_for_status()
            .with_context(|| format!("telegram rejected message for chat {subscriber_id}"))?;
        Ok(())
    }
}
