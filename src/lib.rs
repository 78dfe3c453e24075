//! Like statistics for contents, kept in Redis next to a per-content rate limiter.
//!
//! - [`cache::AggregationCache`] keeps `likes_count` / `likes_avg` per content,
//!   updated incrementally and rebuildable from the system-of-record.
//! - [`rate_limit::RateLimiter`] decides whether a new like is accepted.
//! - [`shards::CacheService`] orders incremental updates per content.
//! - [`orchestrator::LikeOrchestrator`] ties likes, limiter and cache together.

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod range;
pub mod rate_limit;
pub mod shards;
pub mod source;
pub mod state;
pub mod store;
pub mod worker;

pub use cache::{AggregationCache, CacheRecord};
pub use error::{CacheError, OrchestratorError, SourceError, StoreError};
pub use models::{ActorId, Admission, AdmissionState, Content, EntityId, Observation, ObservationRange};
pub use orchestrator::{LikeOrchestrator, LikeOutcome};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use shards::{CacheConfig, CacheService};
pub use source::{MemoryRecords, ObservationLedger, PgSource, SourceOfRecord};
pub use state::AppState;
pub use store::{KvStore, MemoryStore, RedisStore};
