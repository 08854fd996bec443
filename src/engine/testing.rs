use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::{Browser, BrowserLauncher, EngineError, Page};

/// Minimal PNG signature returned by every fake screenshot.
pub const FAKE_PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// Shared page model behind every fake page.
#[derive(Default)]
pub struct FakeSite {
    /// selector -> text content
    elements: Mutex<HashMap<String, String>>,
    /// `op:selector` -> remaining forced failures
    failures: Mutex<HashMap<String, u32>>,
    scripts: Mutex<HashMap<String, Value>>,
    /// scripts whose evaluation panics
    panics: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    url: Mutex<String>,
}

impl FakeSite {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_element(self: &Arc<Self>, selector: &str, text: &str) -> Arc<Self> {
        lock(&self.elements).insert(selector.to_string(), text.to_string());
        Arc::clone(self)
    }

    /// Make the next `times` calls of `op` on `selector` fail.
    /// `op` is one of `goto`, `click`, `fill`, `text`, `evaluate`, `screenshot`.
    pub fn fail(self: &Arc<Self>, op: &str, selector: &str, times: u32) -> Arc<Self> {
        lock(&self.failures).insert(format!("{op}:{selector}"), times);
        Arc::clone(self)
    }

    pub fn with_script_result(self: &Arc<Self>, script: &str, value: Value) -> Arc<Self> {
        lock(&self.scripts).insert(script.to_string(), value);
        Arc::clone(self)
    }

    pub fn panic_on_script(self: &Arc<Self>, script: &str) -> Arc<Self> {
        lock(&self.panics).insert(script.to_string());
        Arc::clone(self)
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    fn forced_failure(&self, op: &str, selector: &str) -> bool {
        let mut failures = lock(&self.failures);
        match failures.get_mut(&format!("{op}:{selector}")) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn element(&self, op: &str, selector: &str) -> Result<String, EngineError> {
        self.record(format!("{op}:{selector}"));
        if self.forced_failure(op, selector) {
            return Err(EngineError::ElementNotFound(selector.to_string()));
        }
        lock(&self.elements)
            .get(selector)
            .cloned()
            .ok_or_else(|| EngineError::ElementNotFound(selector.to_string()))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Launcher / browser / page
// ---------------------------------------------------------------------------

pub struct FakeLauncher {
    site: Arc<FakeSite>,
    launched: Mutex<Vec<Arc<FakeBrowser>>>,
    fail_launch: AtomicBool,
}

impl FakeLauncher {
    pub fn new(site: Arc<FakeSite>) -> Arc<Self> {
        Arc::new(Self {
            site,
            launched: Mutex::new(Vec::new()),
            fail_launch: AtomicBool::new(false),
        })
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        lock(&self.launched).len()
    }

    pub fn browsers(&self) -> Vec<Arc<FakeBrowser>> {
        lock(&self.launched).clone()
    }
}

#[async_trait::async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Browser>, EngineError> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(EngineError::Launch("fake launch failure".into()));
        }
        let mut launched = lock(&self.launched);
        let browser = Arc::new(FakeBrowser {
            id: format!("fake-{}", launched.len()),
            site: Arc::clone(&self.site),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            pages_opened: AtomicUsize::new(0),
        });
        launched.push(Arc::clone(&browser));
        Ok(browser)
    }
}

pub struct FakeBrowser {
    id: String,
    site: Arc<FakeSite>,
    connected: AtomicBool,
    closed: AtomicBool,
    pages_opened: AtomicUsize,
}

impl FakeBrowser {
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.pages_opened.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Browser for FakeBrowser {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn new_page(&self) -> Result<Box<dyn Page>, EngineError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::Disconnected);
        }
        self.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            site: Arc::clone(&self.site),
        }))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakePage {
    site: Arc<FakeSite>,
}

#[async_trait::async_trait]
impl Page for FakePage {
    async fn goto(&self, url: &str) -> Result<(), EngineError> {
        self.site.record(format!("goto:{url}"));
        if self.site.forced_failure("goto", url) {
            return Err(EngineError::Timeout(format!("navigation to {url}")));
        }
        *lock(&self.site.url) = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, EngineError> {
        Ok(lock(&self.site.url).clone())
    }

    async fn ready_state(&self) -> Result<String, EngineError> {
        Ok("complete".to_string())
    }

    async fn resource_count(&self) -> Result<u64, EngineError> {
        Ok(3)
    }

    async fn exists(&self, selector: &str) -> Result<bool, EngineError> {
        Ok(lock(&self.site.elements).contains_key(selector))
    }

    async fn click(&self, selector: &str) -> Result<(), EngineError> {
        self.site.element("click", selector).map(|_| ())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), EngineError> {
        self.site.element("fill", selector)?;
        lock(&self.site.elements).insert(selector.to_string(), value.to_string());
        Ok(())
    }

    async fn text(&self, selector: &str) -> Result<String, EngineError> {
        self.site.element("text", selector)
    }

    async fn inner_html(&self, selector: &str) -> Result<String, EngineError> {
        self.site
            .element("html", selector)
            .map(|t| format!("<span>{t}</span>"))
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, EngineError> {
        self.site.element("attribute", selector)?;
        Ok(Some(format!("{name}-of-{selector}")))
    }

    async fn evaluate(&self, script: &str) -> Result<Value, EngineError> {
        self.site.record(format!("evaluate:{script}"));
        let panics = lock(&self.site.panics).contains(script);
        if panics {
            panic!("script '{script}' crashed the driver");
        }
        if self.site.forced_failure("evaluate", script) {
            return Err(EngineError::Script(format!("error in {script}")));
        }
        Ok(lock(&self.site.scripts)
            .get(script)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn body_text(&self) -> Result<String, EngineError> {
        Ok("fake body".to_string())
    }

    async fn screenshot(
        &self,
        selector: Option<&str>,
        full_page: bool,
    ) -> Result<Vec<u8>, EngineError> {
        let target = selector.unwrap_or(if full_page { "page" } else { "viewport" });
        self.site.record(format!("screenshot:{target}"));
        if self.site.forced_failure("screenshot", target) {
            return Err(EngineError::Disconnected);
        }
        Ok(FAKE_PNG.to_vec())
    }

    async fn close(&self) {
        self.site.record("close".to_string());
    }
}
