//! Minimal W3C WebDriver client and the screenshot renderer built on it

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::WebDriverConfig;
use crate::error::{PlatformError, Result};
use crate::quote::{PreviewTarget, QuoteRenderer};
use crate::resilience::{poll_until, with_timeout, PollStatus};

/// Extra pixels kept around the embed when sizing the window
const SCREENSHOT_MARGIN: f64 = 20.0;

/// Returns the embed's page rect once the preview page marks it ready, else null
const EMBED_BOUNDS_SCRIPT: &str = r#"
const el = document.querySelector(arguments[0]);
if (!el || el.getAttribute('data-embed-ready') !== 'true') { return null; }
const r = el.getBoundingClientRect();
return { x: r.left + window.scrollX, y: r.top + window.scrollY, width: r.width, height: r.height };
"#;

const EMBED_SELECTOR: &str = "#quote-embed";

/// W3C key under which element references are returned
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Deserialize)]
struct WebDriverReply<T> {
    value: T,
}

#[derive(Deserialize)]
struct WebDriverFailure {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct ElementRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Clone)]
pub struct WebDriverClient {
    http: reqwest::Client,
    node_url: String,
}

impl WebDriverClient {
    pub fn new(http: reqwest::Client, node_url: &str) -> Self {
        Self {
            http,
            node_url: node_url.trim_end_matches('/').to_string(),
        }
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| PlatformError::Network(format!("webdriver {}: {}", what, e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PlatformError::Network(format!("webdriver {}: {}", what, e)))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<WebDriverReply<WebDriverFailure>>(&body)
                .map(|r| format!("{}: {}", r.value.error, r.value.message))
                .unwrap_or(body);
            let message = format!("webdriver {} returned {}: {}", what, status, detail);
            return Err(if status.is_server_error() {
                PlatformError::Network(message)
            } else {
                PlatformError::Posting(message)
            }
            .into());
        }

        let reply: WebDriverReply<T> = serde_json::from_str(&body)
            .map_err(|e| PlatformError::Posting(format!("webdriver {}: {}", what, e)))?;
        Ok(reply.value)
    }

    /// Start a headless Chrome session
    pub async fn new_session(&self) -> Result<WebDriverSession> {
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": ["--headless=new", "--hide-scrollbars"] }
                }
            }
        });
        let session: NewSession = self
            .send(
                self.http
                    .post(format!("{}/session", self.node_url))
                    .json(&capabilities),
                "new session",
            )
            .await?;
        debug!("Started WebDriver session {}", session.session_id);
        Ok(WebDriverSession {
            client: self.clone(),
            id: session.session_id,
        })
    }
}

pub struct WebDriverSession {
    client: WebDriverClient,
    id: String,
}

impl WebDriverSession {
    fn url(&self, path: &str) -> String {
        format!("{}/session/{}{}", self.client.node_url, self.id, path)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        let _: Value = self
            .client
            .send(
                self.client.http.post(self.url("/url")).json(&json!({ "url": url })),
                "navigate",
            )
            .await?;
        Ok(())
    }

    pub async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.client
            .send(
                self.client
                    .http
                    .post(self.url("/execute/sync"))
                    .json(&json!({ "script": script, "args": args })),
                "execute",
            )
            .await
    }

    pub async fn set_window_size(&self, width: u32, height: u32) -> Result<()> {
        let _: Value = self
            .client
            .send(
                self.client
                    .http
                    .post(self.url("/window/rect"))
                    .json(&json!({ "width": width, "height": height })),
                "window rect",
            )
            .await?;
        Ok(())
    }

    /// Reference to the first element matching `selector`
    pub async fn find_element(&self, selector: &str) -> Result<String> {
        let reference: Value = self
            .client
            .send(
                self.client
                    .http
                    .post(self.url("/element"))
                    .json(&json!({ "using": "css selector", "value": selector })),
                "find element",
            )
            .await?;
        reference
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                PlatformError::Posting(format!("webdriver returned no element for {}", selector))
                    .into()
            })
    }

    /// PNG screenshot of one element's bounding box, independent of the viewport
    pub async fn element_screenshot(&self, element: &str) -> Result<Vec<u8>> {
        let encoded: String = self
            .client
            .send(
                self.client
                    .http
                    .get(self.url(&format!("/element/{}/screenshot", element))),
                "element screenshot",
            )
            .await?;
        Ok(STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| PlatformError::Posting(format!("screenshot is not base64: {}", e)))?)
    }

    pub async fn close(self) -> Result<()> {
        let _: Value = self
            .client
            .send(self.client.http.delete(self.url("")), "delete session")
            .await?;
        Ok(())
    }
}

/// Renders quoted posts by loading the internal preview page in a remote browser
pub struct WebDriverQuoteRenderer {
    client: WebDriverClient,
    preview_base_url: String,
    load_timeout: Duration,
    poll_interval: Duration,
}

impl WebDriverQuoteRenderer {
    pub fn new(http: reqwest::Client, config: &WebDriverConfig) -> Self {
        Self {
            client: WebDriverClient::new(http, &config.node_url),
            preview_base_url: config.preview_base_url.clone(),
            load_timeout: Duration::from_secs(config.load_timeout_secs),
            poll_interval: Duration::from_millis(250),
        }
    }

    async fn capture(&self, session: &WebDriverSession, target: &PreviewTarget) -> Result<Vec<u8>> {
        let url = target.url(&self.preview_base_url)?;
        with_timeout("quote preview navigation", self.load_timeout, session.navigate(&url)).await?;

        let rect = poll_until(
            "quote embed load",
            self.poll_interval,
            self.load_timeout,
            move || async move {
                let value = session
                    .execute(EMBED_BOUNDS_SCRIPT, vec![json!(EMBED_SELECTOR)])
                    .await?;
                Ok(match serde_json::from_value::<Option<ElementRect>>(value) {
                    Ok(Some(rect)) if rect.height > 0.0 => PollStatus::Ready(rect),
                    _ => PollStatus::Pending(None),
                })
            },
        )
        .await?;

        // Drivers that clip element screenshots to the viewport still see the whole embed
        let (width, height) = window_size_for(rect);
        session.set_window_size(width, height).await?;
        let element = session.find_element(EMBED_SELECTOR).await?;
        session.element_screenshot(&element).await
    }
}

/// Window size that shows `rect` plus the margin on every side
pub fn window_size_for(rect: ElementRect) -> (u32, u32) {
    let width = (rect.x + rect.width + SCREENSHOT_MARGIN).ceil().max(1.0);
    let height = (rect.y + rect.height + SCREENSHOT_MARGIN).ceil().max(1.0);
    (width as u32, height as u32)
}

#[async_trait]
impl QuoteRenderer for WebDriverQuoteRenderer {
    async fn render(&self, target: &PreviewTarget) -> Result<Vec<u8>> {
        let session = self.client.new_session().await?;
        let result = self.capture(&session, target).await;
        let session_id = session.id().to_string();
        if let Err(e) = session.close().await {
            warn!("Failed to close WebDriver session {}: {}", session_id, e);
        }
        result
    }
}
