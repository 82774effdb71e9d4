//! Fixed-window call budget shared by concurrent document tasks.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct Window {
    started: Instant,
    used: u32,
}

/// Allows at most `budget` acquisitions per `window`. A budget of 0
/// disables the limit.
pub struct RateLimiter {
    budget: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(budget: u32, window: Duration) -> Self {
        Self {
            budget,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Wait until a slot in the current window is available, then take it.
    pub async fn acquire(&self) {
        if self.budget == 0 {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if now.duration_since(state.started) >= self.window {
                    state.started = now;
                    state.used = 0;
                }
                if state.used < self.budget {
                    state.used += 1;
                    return;
                }
                self.window - now.duration_since(state.started)
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}
