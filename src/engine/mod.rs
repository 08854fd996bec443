//! Browser automation engine abstraction.
//!
//! A [`Browser`] is one expensive engine instance shared by concurrent
//! workers; a [`Page`] is the per-run isolation unit opened on it.

pub mod pool;
pub mod webdriver;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use pool::{BrowserPool, EngineHandle, PoolError, PoolStats};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no element matches selector '{0}'")]
    ElementNotFound(String),

    #[error("engine operation timed out: {0}")]
    Timeout(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("webdriver error '{error}': {message}")]
    Protocol { error: String, message: String },

    #[error("engine instance disconnected")]
    Disconnected,

    #[error("failed to launch engine: {0}")]
    Launch(String),

    #[error("http transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed engine response: {0}")]
    Malformed(String),
}

/// Page readiness a `navigate` task waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    /// `document.readyState == "complete"`
    Load,
    /// `document.readyState` is `interactive` or `complete`
    DomContentLoaded,
    /// Loaded and no new resource entries for a quiet period
    NetworkIdle,
}

/// One engine instance.
#[async_trait::async_trait]
pub trait Browser: Send + Sync {
    fn id(&self) -> &str;

    /// Health probe used on acquire and by the periodic sweep.
    async fn is_connected(&self) -> bool;

    /// Open an isolated page/context on this instance.
    async fn new_page(&self) -> Result<Box<dyn Page>, EngineError>;

    async fn close(&self);
}

/// Creates engine instances for the pool.
#[async_trait::async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Browser>, EngineError>;
}

/// DOM-level operations the task executor needs.
#[async_trait::async_trait]
pub trait Page: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), EngineError>;
    async fn current_url(&self) -> Result<String, EngineError>;
    async fn ready_state(&self) -> Result<String, EngineError>;
    /// Number of resource-timing entries, used for network-idle detection.
    async fn resource_count(&self) -> Result<u64, EngineError>;
    async fn exists(&self, selector: &str) -> Result<bool, EngineError>;
    async fn click(&self, selector: &str) -> Result<(), EngineError>;
    async fn fill(&self, selector: &str, value: &str) -> Result<(), EngineError>;
    async fn text(&self, selector: &str) -> Result<String, EngineError>;
    async fn inner_html(&self, selector: &str) -> Result<String, EngineError>;
    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, EngineError>;
    /// Run a script body in the page context and return its JSON result.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, EngineError>;
    async fn body_text(&self) -> Result<String, EngineError>;
    /// PNG bytes of an element, the full page, or the viewport.
    async fn screenshot(&self, selector: Option<&str>, full_page: bool)
        -> Result<Vec<u8>, EngineError>;
    async fn close(&self);
}

/// Scripted in-memory engine for tests.
#[doc(hidden)]
pub mod testing;
