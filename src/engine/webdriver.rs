//! W3C WebDriver backend.
//!
//! Each engine instance is one WebDriver endpoint: either a driver binary
//! spawned on a free local port, or a remote endpoint (Selenium, a driver in
//! another container). Each page is a fresh WebDriver session, which gives
//! every run its own browser context.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Browser, BrowserLauncher, EngineError, Page};
use crate::config::EngineConfig;

/// W3C web element reference key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const STATUS_TIMEOUT: Duration = Duration::from_secs(2);
const STARTUP_POLL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

pub struct WebDriverLauncher {
    config: EngineConfig,
    client: Client,
}

impl WebDriverLauncher {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(config.navigation_timeout() + Duration::from_secs(30))
            .build()?;
        Ok(Self { config, client })
    }

    /// First port in the configured range that can be bound.
    async fn find_free_port(&self) -> Result<u16, EngineError> {
        for port in self.config.port_range_start..=self.config.port_range_end {
            if tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
                debug!(port, "found free driver port");
                return Ok(port);
            }
        }
        Err(EngineError::Launch(format!(
            "no free port in range {}-{}",
            self.config.port_range_start, self.config.port_range_end
        )))
    }

    async fn spawn_driver(&self) -> Result<(String, Child), EngineError> {
        let port = self.find_free_port().await?;
        let child = Command::new(&self.config.driver_path)
            .arg(format!("--port={port}"))
            .kill_on_drop(true)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| {
                EngineError::Launch(format!(
                    "failed to spawn '{}' on port {port}: {e}",
                    self.config.driver_path
                ))
            })?;
        Ok((format!("http://127.0.0.1:{port}"), child))
    }

    async fn wait_until_ready(&self, endpoint: &str) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout();
        while tokio::time::Instant::now() < deadline {
            if status_ready(&self.client, endpoint).await {
                return Ok(());
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
        Err(EngineError::Launch(format!(
            "driver at {endpoint} not ready within {:?}",
            self.config.startup_timeout()
        )))
    }
}

#[async_trait::async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Arc<dyn Browser>, EngineError> {
        let (endpoint, mut child) = match &self.config.remote_url {
            Some(url) => (url.trim_end_matches('/').to_string(), None),
            None => {
                let (endpoint, child) = self.spawn_driver().await?;
                (endpoint, Some(child))
            }
        };

        if let Err(e) = self.wait_until_ready(&endpoint).await {
            if let Some(child) = child.as_mut() {
                let _ = child.kill().await;
            }
            return Err(e);
        }

        let browser = WebDriverBrowser {
            id: Uuid::new_v4().to_string(),
            endpoint,
            client: self.client.clone(),
            child: Mutex::new(child),
            capabilities: capabilities(&self.config),
            page_load_timeout_ms: self.config.navigation_timeout_ms,
        };
        info!(instance = %browser.id, endpoint = %browser.endpoint, "engine instance launched");
        Ok(Arc::new(browser))
    }
}

fn capabilities(config: &EngineConfig) -> Value {
    let mut caps = json!({
        "browserName": config.browser_name,
        "pageLoadStrategy": "normal",
    });

    let mut args = config.extra_args.clone();
    match config.browser_name.as_str() {
        "firefox" => {
            if config.headless {
                args.push("-headless".to_string());
            }
            caps["moz:firefoxOptions"] = json!({ "args": args });
        }
        _ => {
            if config.headless {
                args.push("--headless=new".to_string());
            }
            caps["goog:chromeOptions"] = json!({ "args": args });
        }
    }
    caps
}

async fn status_ready(client: &Client, endpoint: &str) -> bool {
    let resp = client
        .get(format!("{endpoint}/status"))
        .timeout(STATUS_TIMEOUT)
        .send()
        .await;
    match resp {
        Ok(r) if r.status().is_success() => r
            .json::<Value>()
            .await
            .map(|v| v["value"]["ready"].as_bool().unwrap_or(false))
            .unwrap_or(false),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Browser
// ---------------------------------------------------------------------------

pub struct WebDriverBrowser {
    id: String,
    endpoint: String,
    client: Client,
    /// Present when this process spawned the driver.
    child: Mutex<Option<Child>>,
    capabilities: Value,
    page_load_timeout_ms: u64,
}

#[async_trait::async_trait]
impl Browser for WebDriverBrowser {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_connected(&self) -> bool {
        {
            let mut child = self.child.lock().await;
            if let Some(child) = child.as_mut() {
                if !matches!(child.try_wait(), Ok(None)) {
                    return false;
                }
            }
        }
        status_ready(&self.client, &self.endpoint).await
    }

    async fn new_page(&self) -> Result<Box<dyn Page>, EngineError> {
        let body = json!({ "capabilities": { "alwaysMatch": self.capabilities } });
        let value = send(
            &self.client,
            Method::POST,
            format!("{}/session", self.endpoint),
            Some(body),
        )
        .await?;
        let session_id = value["sessionId"]
            .as_str()
            .ok_or_else(|| EngineError::Malformed("new session without sessionId".into()))?;

        let page = WebDriverPage {
            client: self.client.clone(),
            base: format!("{}/session/{}", self.endpoint, session_id),
        };
        page.command(
            Method::POST,
            "timeouts",
            Some(json!({ "pageLoad": self.page_load_timeout_ms, "script": self.page_load_timeout_ms })),
        )
        .await?;

        debug!(instance = %self.id, session = %session_id, "page opened");
        Ok(Box::new(page))
    }

    async fn close(&self) {
        let mut child = self.child.lock().await;
        if let Some(mut c) = child.take() {
            if let Err(e) = c.kill().await {
                warn!(instance = %self.id, error = %e, "failed to stop driver process");
            }
        }
        info!(instance = %self.id, "engine instance closed");
    }
}

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

pub struct WebDriverPage {
    client: Client,
    /// `{endpoint}/session/{id}`
    base: String,
}

impl WebDriverPage {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, EngineError> {
        let url = if path.is_empty() {
            self.base.clone()
        } else {
            format!("{}/{}", self.base, path)
        };
        send(&self.client, method, url, body).await
    }

    async fn find_element(&self, selector: &str) -> Result<String, EngineError> {
        let value = self
            .command(
                Method::POST,
                "element",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await
            .map_err(|e| match e {
                EngineError::ElementNotFound(_) => EngineError::ElementNotFound(selector.into()),
                other => other,
            })?;
        value[ELEMENT_KEY]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::Malformed("element reference missing".into()))
    }

    async fn evaluate_string(&self, script: &str) -> Result<String, EngineError> {
        match self.evaluate(script).await? {
            Value::String(s) => Ok(s),
            Value::Null => Ok(String::new()),
            other => Ok(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl Page for WebDriverPage {
    async fn goto(&self, url: &str) -> Result<(), EngineError> {
        self.command(Method::POST, "url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn current_url(&self) -> Result<String, EngineError> {
        let value = self.command(Method::GET, "url", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn ready_state(&self) -> Result<String, EngineError> {
        self.evaluate_string("return document.readyState;").await
    }

    async fn resource_count(&self) -> Result<u64, EngineError> {
        let value = self
            .evaluate("return performance.getEntriesByType('resource').length;")
            .await?;
        Ok(value.as_u64().unwrap_or(0))
    }

    async fn exists(&self, selector: &str) -> Result<bool, EngineError> {
        let value = self
            .command(
                Method::POST,
                "elements",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;
        Ok(value.as_array().is_some_and(|a| !a.is_empty()))
    }

    async fn click(&self, selector: &str) -> Result<(), EngineError> {
        let id = self.find_element(selector).await?;
        self.command(Method::POST, &format!("element/{id}/click"), Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), EngineError> {
        let id = self.find_element(selector).await?;
        self.command(Method::POST, &format!("element/{id}/clear"), Some(json!({})))
            .await?;
        self.command(
            Method::POST,
            &format!("element/{id}/value"),
            Some(json!({ "text": value })),
        )
        .await
        .map(|_| ())
    }

    async fn text(&self, selector: &str) -> Result<String, EngineError> {
        let id = self.find_element(selector).await?;
        let value = self
            .command(Method::GET, &format!("element/{id}/text"), None)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn inner_html(&self, selector: &str) -> Result<String, EngineError> {
        let id = self.find_element(selector).await?;
        let value = self
            .command(Method::GET, &format!("element/{id}/property/innerHTML"), None)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, EngineError> {
        let id = self.find_element(selector).await?;
        let value = self
            .command(Method::GET, &format!("element/{id}/attribute/{name}"), None)
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn evaluate(&self, script: &str) -> Result<Value, EngineError> {
        self.command(
            Method::POST,
            "execute/sync",
            Some(json!({ "script": script, "args": [] })),
        )
        .await
    }

    async fn body_text(&self) -> Result<String, EngineError> {
        self.evaluate_string("return document.body ? document.body.innerText : '';")
            .await
    }

    async fn screenshot(
        &self,
        selector: Option<&str>,
        full_page: bool,
    ) -> Result<Vec<u8>, EngineError> {
        let encoded = match selector {
            Some(sel) => {
                let id = self.find_element(sel).await?;
                self.command(Method::GET, &format!("element/{id}/screenshot"), None)
                    .await?
            }
            None if full_page => {
                // Chromium exposes full-page capture over its CDP bridge;
                // other drivers fall back to the viewport.
                let cdp = self
                    .command(
                        Method::POST,
                        "goog/cdp/execute",
                        Some(json!({
                            "cmd": "Page.captureScreenshot",
                            "params": { "format": "png", "captureBeyondViewport": true }
                        })),
                    )
                    .await;
                match cdp {
                    Ok(v) => v["data"].clone(),
                    Err(e) => {
                        debug!(error = %e, "full-page capture unavailable, using viewport");
                        self.command(Method::GET, "screenshot", None).await?
                    }
                }
            }
            None => self.command(Method::GET, "screenshot", None).await?,
        };

        let data = encoded
            .as_str()
            .ok_or_else(|| EngineError::Malformed("screenshot is not base64 text".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| EngineError::Malformed(format!("screenshot base64: {e}")))
    }

    async fn close(&self) {
        if let Err(e) = self.command(Method::DELETE, "", None).await {
            debug!(session = %self.base, error = %e, "session delete failed");
        }
    }
}

async fn send(
    client: &Client,
    method: Method,
    url: String,
    body: Option<Value>,
) -> Result<Value, EngineError> {
    let mut req = client.request(method, url);
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req.send().await?;
    let status = resp.status();
    let text = resp.text().await?;
    let json: Value = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text)
            .map_err(|e| EngineError::Malformed(format!("invalid JSON ({e})")))?
    };
    let value = json.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }

    let error = value["error"].as_str().unwrap_or("unknown error").to_string();
    let message = value["message"].as_str().unwrap_or_default().to_string();
    Err(classify(error, message))
}

fn classify(error: String, message: String) -> EngineError {
    match error.as_str() {
        "no such element" | "stale element reference" => EngineError::ElementNotFound(message),
        "timeout" | "script timeout" => EngineError::Timeout(message),
        "javascript error" => EngineError::Script(message),
        "invalid session id" | "no such window" | "session not created" => {
            EngineError::Disconnected
        }
        _ => EngineError::Protocol { error, message },
    }
}
