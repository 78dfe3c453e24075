use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::CacheRecord;
use crate::error::OrchestratorError;
use crate::models::{ActorId, AdmissionState, Content, EntityId, Observation, ObservationRange};
use crate::rate_limit::RateLimiter;
use crate::shards::CacheService;
use crate::source::ObservationLedger;

// What a like request turned into
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LikeOutcome {
    // First accepted like of this user on this content
    Created {
        observation: Observation,
        record: CacheRecord,
    },
    // The user's accepted like got a new value. No cache update if the value did not change.
    Updated {
        observation: Observation,
        previous: i16,
        record: Option<CacheRecord>,
    },
    // Stored for audit, kept out of the statistics
    RateLimited { observation: Observation },
}

// Persists likes and keeps the cache and the rate limiter in step with them
pub struct LikeOrchestrator {
    ledger: Arc<dyn ObservationLedger>,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<CacheService>,
    range: ObservationRange,
}

impl LikeOrchestrator {
    pub fn new(
        ledger: Arc<dyn ObservationLedger>,
        rate_limiter: Arc<RateLimiter>,
        cache: Arc<CacheService>,
        range: ObservationRange,
    ) -> Self {
        Self {
            ledger,
            rate_limiter,
            cache,
            range,
        }
    }

    pub async fn create_content(&self, title: &str, text: &str) -> Result<Content, OrchestratorError> {
        let content = self.ledger.insert_content(title, text).await?;
        self.cache.cache().note_created(content.id).await?;
        info!(content = %content.id, "content created");
        Ok(content)
    }

    pub async fn like(
        &self,
        actor: ActorId,
        content: EntityId,
        value: i16,
    ) -> Result<LikeOutcome, OrchestratorError> {
        if !self.range.contains(value) {
            return Err(OrchestratorError::InvalidValue {
                value,
                min: self.range.min,
                max: self.range.max,
            });
        }

        // An accepted like already exists: this is an edit, not a new like
        if let Some(existing) = self.ledger.find_accepted(content, actor).await? {
            let previous = existing.value;
            let observation = self.ledger.update_value(existing.id, value).await?;
            let record = if previous != value {
                Some(self.cache.record_value_change(content, previous, value).await?)
            } else {
                None
            };
            debug!(%content, user = actor.0, previous, value, "like updated");
            return Ok(LikeOutcome::Updated {
                observation,
                previous,
                record,
            });
        }

        if !self.rate_limiter.admit_entity(content).await?.is_accepted() {
            let observation = self
                .ledger
                .insert_observation(content, actor, value, AdmissionState::RateLimited)
                .await?;
            info!(%content, user = actor.0, "like rate limited");
            return Ok(LikeOutcome::RateLimited { observation });
        }

        let observation = self
            .ledger
            .insert_observation(content, actor, value, AdmissionState::Accepted)
            .await?;
        let record = self.cache.record_new_observation(content, value).await?;
        debug!(%content, user = actor.0, value, "like created");
        Ok(LikeOutcome::Created { observation, record })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AggregationCache;
    use crate::error::CacheError;
    use crate::rate_limit::RateLimitConfig;
    use crate::shards::CacheConfig;
    use crate::source::MemoryRecords;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn orchestrator(capacity: u32) -> (Arc<MemoryRecords>, Arc<CacheService>, LikeOrchestrator) {
        let store = Arc::new(MemoryStore::new());
        let range = ObservationRange::default();
        let rate_limiter = Arc::new(RateLimiter::new(
            store.clone(),
            RateLimitConfig {
                capacity,
                window: Duration::from_secs(60),
            },
        ));
        let cache = Arc::new(CacheService::spawn(
            Arc::new(AggregationCache::new(store, range)),
            CacheConfig::default(),
        ));
        let records = Arc::new(MemoryRecords::new());
        let orchestrator = LikeOrchestrator::new(records.clone(), rate_limiter, cache.clone(), range);
        (records, cache, orchestrator)
    }

    #[tokio::test]
    async fn second_like_by_same_user_is_an_edit() {
        let (records, _, orchestrator) = orchestrator(100);
        let content = orchestrator.create_content("t", "x").await.unwrap();

        let first = orchestrator.like(ActorId(1), content.id, 5).await.unwrap();
        assert!(matches!(first, LikeOutcome::Created { .. }));

        let second = orchestrator.like(ActorId(1), content.id, 3).await.unwrap();
        let LikeOutcome::Updated { previous, record, .. } = second else {
            panic!("expected an update");
        };
        assert_eq!(previous, 5);
        let record = record.unwrap();
        assert_eq!(record.likes_count, 1);
        assert_eq!(record.likes_avg, 3.0);
        assert_eq!(records.likes_of(content.id).len(), 1);
    }

    #[tokio::test]
    async fn unchanged_value_skips_the_cache() {
        let (_, _, orchestrator) = orchestrator(100);
        let content = orchestrator.create_content("t", "x").await.unwrap();
        orchestrator.like(ActorId(1), content.id, 4).await.unwrap();

        let outcome = orchestrator.like(ActorId(1), content.id, 4).await.unwrap();
        assert!(matches!(outcome, LikeOutcome::Updated { record: None, .. }));
    }

    #[tokio::test]
    async fn invalid_values_never_reach_the_ledger() {
        let (records, _, orchestrator) = orchestrator(100);
        let content = orchestrator.create_content("t", "x").await.unwrap();
        let err = orchestrator.like(ActorId(1), content.id, 9).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidValue { value: 9, .. }));
        assert!(records.likes_of(content.id).is_empty());
    }

    #[tokio::test]
    async fn rate_limited_likes_leave_the_cache_alone() {
        let (records, cache, orchestrator) = orchestrator(1);
        let content = orchestrator.create_content("t", "x").await.unwrap();

        orchestrator.like(ActorId(1), content.id, 2).await.unwrap();
        let before = cache.get(content.id).await.unwrap();

        let outcome = orchestrator.like(ActorId(2), content.id, 5).await.unwrap();
        assert!(matches!(outcome, LikeOutcome::RateLimited { .. }));
        assert_eq!(cache.get(content.id).await.unwrap(), before);
        assert_eq!(records.likes_of(content.id).len(), 2);
    }

    #[tokio::test]
    async fn like_after_rate_limit_is_a_new_attempt() {
        let (_, _, orchestrator) = orchestrator(0);
        let content = orchestrator.create_content("t", "x").await.unwrap();
        for _ in 0..2 {
            let outcome = orchestrator.like(ActorId(1), content.id, 2).await.unwrap();
            assert!(matches!(outcome, LikeOutcome::RateLimited { .. }));
        }
    }

    #[tokio::test]
    async fn content_creation_advances_max_id() {
        let (_, cache, orchestrator) = orchestrator(100);
        orchestrator.create_content("a", "x").await.unwrap();
        let second = orchestrator.create_content("b", "y").await.unwrap();
        assert_eq!(cache.cache().max_id().await.unwrap(), second.id.0);
        // not cached until a rebuild or the first like
        assert!(cache.get(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cache_precondition_failures_surface() {
        let (_, cache, _) = orchestrator(100);
        let err = cache.record_value_change(EntityId(1), 1, 2).await.unwrap_err();
        assert!(matches!(err, CacheError::Precondition(_)));
    }
}
