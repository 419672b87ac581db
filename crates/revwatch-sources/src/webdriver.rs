//! Headless page rendering over the W3C WebDriver wire protocol.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value as JsonValue};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::SourceError;

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const READY_POLL: Duration = Duration::from_millis(250);

/// Opens isolated browser sessions.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn open(&self) -> Result<Box<dyn RenderSession>, SourceError>;
}

/// A single live browser session. Callers should `close` it when done;
/// dropping it unclosed releases the browser on a best-effort basis.
#[async_trait]
pub trait RenderSession: Send {
    async fn goto(&mut self, url: &str) -> Result<(), SourceError>;

    /// Waits for `document.readyState == "complete"`; a timeout is not an error.
    async fn wait_until_ready(&mut self, timeout: Duration) -> Result<(), SourceError>;

    /// Text of the first element matching `selector`, `None` when absent.
    async fn element_text(&mut self, selector: &str) -> Result<Option<String>, SourceError>;

    /// Clicks the first element matching `selector`; `false` when absent.
    async fn click(&mut self, selector: &str) -> Result<bool, SourceError>;

    async fn scroll_to_bottom(&mut self) -> Result<(), SourceError>;

    async fn page_source(&mut self) -> Result<String, SourceError>;

    async fn close(&mut self) -> Result<(), SourceError>;
}

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    /// Base URL of a running chromedriver/geckodriver, e.g. `http://127.0.0.1:9515`.
    pub endpoint: String,
    pub user_agent: Option<String>,
    pub request_timeout: Duration,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9515".to_string(),
            user_agent: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

pub struct WebDriverBackend {
    client: Client,
    config: WebDriverConfig,
}

impl WebDriverBackend {
    pub fn new(config: WebDriverConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client, config })
    }

    fn capabilities(&self) -> JsonValue {
        let mut args = vec![
            "--headless=new".to_string(),
            "--no-sandbox".to_string(),
            "--disable-gpu".to_string(),
            "--disable-dev-shm-usage".to_string(),
        ];
        if let Some(agent) = &self.config.user_agent {
            args.push(format!("--user-agent={agent}"));
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args }
                }
            }
        })
    }
}

#[async_trait]
impl RenderBackend for WebDriverBackend {
    async fn open(&self) -> Result<Box<dyn RenderSession>, SourceError> {
        let base = self.config.endpoint.trim_end_matches('/').to_string();
        let value = command(
            &self.client,
            Method::POST,
            &format!("{base}/session"),
            Some(self.capabilities()),
        )
        .await?;
        let session_id = value
            .get("sessionId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SourceError::Session("new session response lacks sessionId".into()))?
            .to_string();
        debug!(%session_id, "webdriver session opened");
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            session_url: format!("{base}/session/{session_id}"),
            closed: false,
        }))
    }
}

struct WebDriverSession {
    client: Client,
    session_url: String,
    closed: bool,
}

/// Result of a WebDriver command whose failure may just mean "no such element".
enum Lookup {
    Found(JsonValue),
    Missing,
}

async fn raw_command(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<JsonValue>,
) -> Result<Lookup, SourceError> {
    let mut request = client.request(method.clone(), url);
    if method != Method::GET && method != Method::DELETE {
        request = request.json(&body.unwrap_or_else(|| json!({})));
    }
    let response = request
        .send()
        .await
        .map_err(|err| SourceError::Session(format!("{url}: {err}")))?;
    let status = response.status();
    let payload: JsonValue = response
        .json()
        .await
        .map_err(|err| SourceError::Session(format!("{url}: undecodable reply: {err}")))?;
    let value = payload.get("value").cloned().unwrap_or(JsonValue::Null);

    if status.is_success() {
        return Ok(Lookup::Found(value));
    }
    let error = value.get("error").and_then(JsonValue::as_str).unwrap_or("unknown error");
    if error == "no such element" {
        return Ok(Lookup::Missing);
    }
    let message = value.get("message").and_then(JsonValue::as_str).unwrap_or_default();
    Err(SourceError::Session(format!("{url}: {status} {error}: {message}")))
}

async fn command(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<JsonValue>,
) -> Result<JsonValue, SourceError> {
    match raw_command(client, method, url, body).await? {
        Lookup::Found(value) => Ok(value),
        Lookup::Missing => Err(SourceError::Session(format!("{url}: no such element"))),
    }
}

impl WebDriverSession {
    async fn post(&self, path: &str, body: JsonValue) -> Result<JsonValue, SourceError> {
        command(&self.client, Method::POST, &format!("{}{path}", self.session_url), Some(body)).await
    }

    async fn get(&self, path: &str) -> Result<JsonValue, SourceError> {
        command(&self.client, Method::GET, &format!("{}{path}", self.session_url), None).await
    }

    async fn execute(&self, script: &str) -> Result<JsonValue, SourceError> {
        self.post("/execute/sync", json!({ "script": script, "args": [] }))
            .await
    }

    async fn find(&self, selector: &str) -> Result<Option<String>, SourceError> {
        let url = format!("{}/element", self.session_url);
        let body = json!({ "using": "css selector", "value": selector });
        match raw_command(&self.client, Method::POST, &url, Some(body)).await? {
            Lookup::Found(value) => Ok(value
                .get(ELEMENT_KEY)
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)),
            Lookup::Missing => Ok(None),
        }
    }
}

#[async_trait]
impl RenderSession for WebDriverSession {
    async fn goto(&mut self, url: &str) -> Result<(), SourceError> {
        self.post("/url", json!({ "url": url })).await.map(|_| ())
    }

    async fn wait_until_ready(&mut self, timeout: Duration) -> Result<(), SourceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.execute("return document.readyState;").await?;
            if state.as_str() == Some("complete") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(session = %self.session_url, "page did not finish loading before timeout");
                return Ok(());
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn element_text(&mut self, selector: &str) -> Result<Option<String>, SourceError> {
        let Some(element) = self.find(selector).await? else {
            return Ok(None);
        };
        let text = self.get(&format!("/element/{element}/text")).await?;
        Ok(text.as_str().map(ToString::to_string))
    }

    async fn click(&mut self, selector: &str) -> Result<bool, SourceError> {
        let Some(element) = self.find(selector).await? else {
            return Ok(false);
        };
        self.post(&format!("/element/{element}/click"), json!({})).await?;
        Ok(true)
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), SourceError> {
        self.execute("window.scrollTo(0, document.body.scrollHeight);")
            .await
            .map(|_| ())
    }

    async fn page_source(&mut self) -> Result<String, SourceError> {
        let source = self.get("/source").await?;
        source
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| SourceError::Session("page source is not a string".into()))
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        command(&self.client, Method::DELETE, &self.session_url, None)
            .await
            .map(|_| ())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session = %self.session_url, "webdriver session dropped outside a runtime; browser left running");
            return;
        };
        warn!(session = %self.session_url, "webdriver session dropped without close; deleting in background");
        let client = self.client.clone();
        let session_url = std::mem::take(&mut self.session_url);
        runtime.spawn(async move {
            if let Err(err) = command(&client, Method::DELETE, &session_url, None).await {
                warn!(error = %err, "background session delete failed");
            }
        });
    }
}
