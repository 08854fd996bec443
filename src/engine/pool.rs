//! Bounded pool of shared engine instances.
//!
//! Instances are expensive to start, so they are created lazily up to
//! `max_instances` and kept alive between runs. A lease does not lock an
//! instance: once the cap is reached, concurrent workers share the
//! least-loaded instance and isolate themselves by opening their own page.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Browser, BrowserLauncher, EngineError, Page};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to launch engine instance: {0}")]
    Launch(#[from] EngineError),

    #[error("engine pool is shut down")]
    ShutDown,
}

/// A leased reference to a pooled instance. Give it back with
/// [`BrowserPool::release`].
pub struct EngineHandle {
    browser: Arc<dyn Browser>,
}

impl EngineHandle {
    pub fn id(&self) -> &str {
        self.browser.id()
    }

    pub async fn new_page(&self) -> Result<Box<dyn Page>, EngineError> {
        self.browser.new_page().await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub instances: usize,
    pub idle: usize,
    pub leases: usize,
    pub max_instances: usize,
}

struct Slot {
    browser: Arc<dyn Browser>,
    leases: usize,
}

pub struct BrowserPool {
    launcher: Arc<dyn BrowserLauncher>,
    max_instances: usize,
    slots: Mutex<Vec<Slot>>,
    closed: AtomicBool,
}

impl BrowserPool {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, max_instances: usize) -> Self {
        Self {
            launcher,
            max_instances: max_instances.max(1),
            slots: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Lease an instance: a healthy idle one, else a new one while under the
    /// cap, else the least-leased busy one.
    pub async fn acquire(&self) -> Result<EngineHandle, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }

        let mut slots = self.slots.lock().await;

        let mut i = 0;
        while i < slots.len() {
            if slots[i].leases > 0 {
                i += 1;
                continue;
            }
            if slots[i].browser.is_connected().await {
                slots[i].leases += 1;
                debug!(instance = %slots[i].browser.id(), "reusing idle engine instance");
                return Ok(EngineHandle {
                    browser: Arc::clone(&slots[i].browser),
                });
            }
            let dead = slots.remove(i);
            warn!(instance = %dead.browser.id(), "evicting disconnected engine instance");
            dead.browser.close().await;
        }

        if slots.len() < self.max_instances {
            let browser = self.launcher.launch().await?;
            info!(
                instance = %browser.id(),
                instances = slots.len() + 1,
                max = self.max_instances,
                "engine instance added to pool"
            );
            slots.push(Slot {
                browser: Arc::clone(&browser),
                leases: 1,
            });
            return Ok(EngineHandle { browser });
        }

        // At the cap: share. `slots` is non-empty here since max_instances >= 1.
        let slot = slots
            .iter_mut()
            .min_by_key(|s| s.leases)
            .ok_or(PoolError::ShutDown)?;
        slot.leases += 1;
        debug!(instance = %slot.browser.id(), leases = slot.leases, "sharing busy engine instance");
        Ok(EngineHandle {
            browser: Arc::clone(&slot.browser),
        })
    }

    /// Return a lease. The instance stays alive for the next run.
    pub async fn release(&self, handle: EngineHandle) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots
            .iter_mut()
            .find(|s| Arc::ptr_eq(&s.browser, &handle.browser))
        {
            slot.leases = slot.leases.saturating_sub(1);
        }
    }

    /// Destroy every instance that no longer answers its health probe.
    /// Returns the number evicted.
    pub async fn sweep(&self) -> usize {
        let mut slots = self.slots.lock().await;
        let mut evicted = 0;
        let mut i = 0;
        while i < slots.len() {
            if slots[i].browser.is_connected().await {
                i += 1;
                continue;
            }
            let dead = slots.remove(i);
            warn!(
                instance = %dead.browser.id(),
                leases = dead.leases,
                "sweep evicted disconnected engine instance"
            );
            dead.browser.close().await;
            evicted += 1;
        }
        evicted
    }

    /// Close every instance and refuse further leases.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut slots = self.slots.lock().await;
        for slot in slots.drain(..) {
            slot.browser.close().await;
        }
        info!("engine pool shut down");
    }

    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.lock().await;
        PoolStats {
            instances: slots.len(),
            idle: slots.iter().filter(|s| s.leases == 0).count(),
            leases: slots.iter().map(|s| s.leases).sum(),
            max_instances: self.max_instances,
        }
    }
}
