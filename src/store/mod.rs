use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::StoreError;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

// Field/value pairs of one hash
pub type Fields = Vec<(String, String)>;

// The handful of key-value commands the cache and the rate limiter need.
// Every call is a single request/response; implementations never retry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    // Create `key` with an expiry only if it does not exist yet, in one atomic command.
    // Returns true if this call created it.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    // Decrement `key` if it is live and holds a positive integer, in one atomic command.
    // None when the key is missing or already at zero. Never creates the key.
    async fn take_token(&self, key: &str) -> Result<Option<i64>, StoreError>;

    // Raise `key` to `value` unless it already holds something larger, atomically.
    // Returns what the key holds afterwards.
    async fn set_max(&self, key: &str, value: i64) -> Result<i64, StoreError>;

    // Empty map when the key is absent
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    // Several HINCRBYs on one hash, applied all or nothing.
    // Returns each field's value after its increment, in order.
    async fn hincr_many(&self, key: &str, increments: &[(&str, i64)]) -> Result<Vec<i64>, StoreError>;

    // Pipelined HGETALL, one map per key in key order
    async fn hgetall_batch(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>, StoreError>;

    // Pipelined HSET executed as one transaction
    async fn hset_batch(&self, rows: &[(String, Fields)]) -> Result<(), StoreError>;
}
