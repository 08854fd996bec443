//! Sliding-window limiter on run starts, shared by every worker loop.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct RateLimiter {
    max_starts: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_starts: u32, window: Duration) -> Self {
        Self {
            max_starts: max_starts.max(1) as usize,
            window,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait for a start slot in the current window. Returns false if `stop`
    /// fired first.
    pub async fn acquire(&self, stop: &CancellationToken) -> bool {
        loop {
            let wait = {
                let mut starts = self.starts.lock().await;
                let now = Instant::now();
                while starts
                    .front()
                    .is_some_and(|&t| now.duration_since(t) >= self.window)
                {
                    starts.pop_front();
                }
                if starts.len() < self.max_starts {
                    starts.push_back(now);
                    return true;
                }
                // Oldest start leaves the window first.
                starts
                    .front()
                    .map(|&t| self.window.saturating_sub(now.duration_since(t)))
                    .unwrap_or(self.window)
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
