use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::StoreError;
use crate::metrics::{ADMISSIONS_ACCEPTED, ADMISSIONS_REJECTED};
use crate::models::{Admission, EntityId};
use crate::store::KvStore;

// Token bucket limits, per key
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            window: Duration::from_secs(60),
        }
    }
}

// Bucket key for likes on one content. Shared by every user liking it.
pub fn bucket_key(content: EntityId) -> String {
    format!("like:rate-limiter:content_id:{content}")
}

/// Token bucket kept in the shared store.
///
/// A bucket is created full, with a TTL of one window, the first time a key is
/// checked. Tokens are never refilled while the bucket lives: once the key
/// expires the next check starts a fresh, full bucket. This is a fixed-window
/// counter, kept that way on purpose.
///
/// Creating the bucket and taking a token are one atomic store command each.
/// A token is only taken from a live bucket that still holds one, so concurrent
/// callers never overdraw it and an expired bucket is never brought back
/// without its TTL.
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub async fn admit_entity(&self, content: EntityId) -> Result<Admission, StoreError> {
        self.admit(&bucket_key(content)).await
    }

    // Consume one token from `key`. Rejection leaves the bucket untouched.
    pub async fn admit(&self, key: &str) -> Result<Admission, StoreError> {
        let capacity = self.config.capacity.to_string();
        if self.store.set_nx_ex(key, &capacity, self.config.window).await? {
            debug!(key, capacity = self.config.capacity, "rate limit bucket created");
        }

        // A bucket that expired since the call above reads as empty and stays gone
        match self.store.take_token(key).await? {
            Some(left) => {
                ADMISSIONS_ACCEPTED.inc();
                debug!(key, left, "admitted");
                Ok(Admission::Accepted)
            }
            None => {
                ADMISSIONS_REJECTED.inc();
                debug!(key, "rate limited");
                Ok(Admission::Rejected)
            }
        }
    }
}
