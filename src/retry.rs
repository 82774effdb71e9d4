//! Exponential backoff around capability calls.
//!
//! Only [`CapabilityError::Transient`] failures are retried. When the
//! attempt budget runs out the last transient error is escalated to
//! permanent so callers can record a terminal failure.

use std::future::Future;
use std::time::Duration;

use docsync_core::error::CapabilityError;

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// A policy that never sleeps; used by tests and one-shot CLI calls.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Map a non-success HTTP status to the retry taxonomy: 429 and 5xx are
/// transient, every other status is permanent.
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> CapabilityError {
    let msg = format!("HTTP {}: {}", status, body.chars().take(300).collect::<String>());
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        CapabilityError::Transient(msg)
    } else {
        CapabilityError::Permanent(msg)
    }
}

/// Connection, timeout and body-read failures are always worth another attempt.
pub fn classify_transport(err: reqwest::Error) -> CapabilityError {
    CapabilityError::transient(err.to_string())
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, CapabilityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    %label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => return Err(err.escalate(attempt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "").is_transient());
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = &AtomicU32::new(0);
        let result = with_backoff(&RetryPolicy::immediate(3), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CapabilityError::transient("busy"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_transient_becomes_permanent() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&RetryPolicy::immediate(2), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::transient("still busy"))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(CapabilityError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&RetryPolicy::immediate(5), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::permanent("bad request"))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }
}
