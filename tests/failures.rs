//! Failure paths: a store or system-of-record that errors must surface as an
//! error, never as an admission, an empty listing or a half-written record.

use async_trait::async_trait;
use like_cache::config::Settings;
use like_cache::models::EntityAggregate;
use like_cache::store::Fields;
use like_cache::{
    ActorId, AppState, CacheError, EntityId, KvStore, LikeOrchestrator, MemoryRecords, MemoryStore,
    OrchestratorError, SourceError, SourceOfRecord, StoreError,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// TEST DOUBLES
// ============================================================================

// Memory store that refuses the named commands until healed
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    refused: Mutex<HashSet<&'static str>>,
}

impl FaultyStore {
    fn refuse(&self, command: &'static str) {
        self.refused.lock().unwrap().insert(command);
    }

    fn heal(&self) {
        self.refused.lock().unwrap().clear();
    }

    fn check(&self, command: &str) -> Result<(), StoreError> {
        if self.refused.lock().unwrap().contains(command) {
            return Err(StoreError::Unavailable(format!("{command}: connection reset")));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check("get")?;
        self.inner.get(key).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check("set_nx_ex")?;
        self.inner.set_nx_ex(key, value, ttl).await
    }

    async fn take_token(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.check("take_token")?;
        self.inner.take_token(key).await
    }

    async fn set_max(&self, key: &str, value: i64) -> Result<i64, StoreError> {
        self.check("set_max")?;
        self.inner.set_max(key, value).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check("hgetall")?;
        self.inner.hgetall(key).await
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.check("hset")?;
        self.inner.hset(key, fields).await
    }

    async fn hincr_many(&self, key: &str, increments: &[(&str, i64)]) -> Result<Vec<i64>, StoreError> {
        self.check("hincr_many")?;
        self.inner.hincr_many(key, increments).await
    }

    async fn hgetall_batch(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>, StoreError> {
        self.check("hgetall_batch")?;
        self.inner.hgetall_batch(keys).await
    }

    async fn hset_batch(&self, rows: &[(String, Fields)]) -> Result<(), StoreError> {
        self.check("hset_batch")?;
        self.inner.hset_batch(rows).await
    }
}

struct UnreachableSource;

#[async_trait]
impl SourceOfRecord for UnreachableSource {
    async fn entity_aggregates(&self) -> Result<Vec<EntityAggregate>, SourceError> {
        Err(SourceError("connection refused".to_string()))
    }
}

struct Harness {
    store: Arc<FaultyStore>,
    records: Arc<MemoryRecords>,
    state: Arc<AppState>,
    orchestrator: LikeOrchestrator,
}

fn harness() -> Harness {
    let store = Arc::new(FaultyStore::default());
    let records = Arc::new(MemoryRecords::new());
    let state = AppState::new(Settings::default(), store.clone());
    let orchestrator = state.orchestrator(records.clone());
    Harness {
        store,
        records,
        state,
        orchestrator,
    }
}

async fn stored(store: &FaultyStore, content: EntityId) -> HashMap<String, String> {
    store.inner.hgetall(&format!("content:{content}")).await.unwrap()
}

// ============================================================================
// RATE LIMITER
// ============================================================================

#[tokio::test]
async fn admission_fails_when_the_bucket_cannot_be_created() {
    let h = harness();
    h.store.refuse("set_nx_ex");
    let err = h.state.rate_limiter.admit_entity(EntityId(1)).await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
}

#[tokio::test]
async fn admission_fails_when_no_token_can_be_taken() {
    let h = harness();
    h.store.refuse("take_token");
    let err = h.state.rate_limiter.admit_entity(EntityId(1)).await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
}

#[tokio::test]
async fn like_is_not_persisted_when_admission_fails() {
    let h = harness();
    let content = h.orchestrator.create_content("title", "text").await.unwrap();
    h.store.refuse("take_token");

    let err = h.orchestrator.like(ActorId(1), content.id, 4).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Store(_)));
    assert!(h.records.likes_of(content.id).is_empty());
}

// ============================================================================
// CACHE OPERATIONS
// ============================================================================

#[tokio::test]
async fn reads_surface_store_failures() {
    let h = harness();
    h.state.cache.record_new_observation(EntityId(1), 3).await.unwrap();

    h.store.refuse("hgetall_batch");
    let err = h.state.cache.list(&[EntityId(1)]).await.unwrap_err();
    assert!(matches!(err, CacheError::Store(StoreError::Unavailable(_))));

    h.store.refuse("hgetall");
    let err = h.state.cache.get(EntityId(1)).await.unwrap_err();
    assert!(matches!(err, CacheError::Store(StoreError::Unavailable(_))));
}

#[tokio::test]
async fn failed_increments_leave_no_partial_record() {
    let h = harness();
    h.store.refuse("hincr_many");

    let err = h.state.cache.record_new_observation(EntityId(1), 5).await.unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
    assert!(stored(&h.store, EntityId(1)).await.is_empty());

    h.store.heal();
    let record = h.state.cache.record_new_observation(EntityId(1), 5).await.unwrap();
    assert_eq!((record.likes_count, record.likes_sum, record.likes_avg), (1, 5, 5.0));
}

#[tokio::test]
async fn failed_increments_leave_counted_records_as_they_were() {
    let h = harness();
    h.state.cache.record_new_observation(EntityId(1), 4).await.unwrap();
    let before = stored(&h.store, EntityId(1)).await;

    h.store.refuse("hincr_many");
    h.state.cache.record_new_observation(EntityId(1), 2).await.unwrap_err();
    h.state.cache.record_value_change(EntityId(1), 4, 1).await.unwrap_err();
    assert_eq!(stored(&h.store, EntityId(1)).await, before);
}

#[tokio::test]
async fn failed_mean_write_still_reads_consistent_statistics() {
    let h = harness();
    h.store.refuse("hset");
    let err = h.state.cache.record_new_observation(EntityId(2), 5).await.unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));

    h.store.heal();
    let record = h.state.cache.get(EntityId(2)).await.unwrap().unwrap();
    assert_eq!((record.likes_count, record.likes_sum, record.likes_avg), (1, 5, 5.0));

    let record = h.state.cache.record_new_observation(EntityId(2), 3).await.unwrap();
    assert_eq!((record.likes_count, record.likes_avg), (2, 4.0));
    let fields = stored(&h.store, EntityId(2)).await;
    assert_eq!(fields["likes_avg"], "4.0");
    assert_eq!(fields["id"], "2");
}

// ============================================================================
// REBUILD
// ============================================================================

#[tokio::test]
async fn failing_source_leaves_the_cache_untouched() {
    let h = harness();
    let content = h.orchestrator.create_content("title", "text").await.unwrap();
    h.orchestrator.like(ActorId(1), content.id, 2).await.unwrap();
    h.state.cache.rebuild(h.records.as_ref()).await.unwrap();
    let before = stored(&h.store, content.id).await;
    let max_id = h.state.cache.cache().max_id().await.unwrap();

    let err = h.state.cache.rebuild(&UnreachableSource).await.unwrap_err();
    assert!(matches!(err, CacheError::Source(_)));
    assert_eq!(stored(&h.store, content.id).await, before);
    assert_eq!(h.state.cache.cache().max_id().await.unwrap(), max_id);
}

#[tokio::test]
async fn failing_batch_write_surfaces_from_rebuild() {
    let h = harness();
    let content = h.orchestrator.create_content("title", "text").await.unwrap();
    h.orchestrator.like(ActorId(1), content.id, 2).await.unwrap();
    let before = stored(&h.store, content.id).await;

    h.store.refuse("hset_batch");
    let err = h.state.cache.rebuild(h.records.as_ref()).await.unwrap_err();
    assert!(matches!(err, CacheError::Store(StoreError::Unavailable(_))));
    assert_eq!(stored(&h.store, content.id).await, before);
}
