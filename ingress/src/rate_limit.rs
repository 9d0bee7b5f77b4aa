//! Per-client request limiting, consulted before admission.
//!
//! Requests are counted per `(project, client)` in fixed windows aligned on
//! the epoch, on a store separate from the ingress data.

use crate::store::{Store, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u64 },
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, project_id: &str, client: &str, now: i64)
    -> Result<Decision, StoreError>;
}

pub fn rate_limit_key(project_id: &str, client: &str) -> String {
    format!("push:{project_id}:{client}")
}

pub struct FixedWindowLimiter {
    store: Arc<dyn Store>,
    max_requests: u64,
    window_ms: i64,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn Store>, max_requests: u64, window: Duration) -> Self {
        FixedWindowLimiter {
            store,
            max_requests,
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1),
        }
    }

    fn window_end(&self, now: i64) -> i64 {
        now.div_euclid(self.window_ms) * self.window_ms + self.window_ms
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn check(
        &self,
        project_id: &str,
        client: &str,
        now: i64,
    ) -> Result<Decision, StoreError> {
        let window_end = self.window_end(now);
        let count = self
            .store
            .incr_with_expiry(&rate_limit_key(project_id, client), window_end)
            .await?;

        if count > self.max_requests {
            let retry_after = Duration::from_millis(u64::try_from(window_end - now).unwrap_or(0));
            return Ok(Decision::Denied { retry_after });
        }
        Ok(Decision::Allowed {
            remaining: self.max_requests - count,
        })
    }
}
