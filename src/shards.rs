use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::info;

use crate::cache::{AggregationCache, CacheRecord};
use crate::error::CacheError;
use crate::metrics::UPDATE_LATENCY;
use crate::models::EntityId;
use crate::source::SourceOfRecord;
use crate::worker::{CacheCommand, shard_worker};

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub shards: usize,
    pub queue_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            queue_depth: 100,
        }
    }
}

// Maps a content id onto the queue of the worker that owns it
pub struct ShardRouter {
    shards: Vec<mpsc::Sender<CacheCommand>>,
}

impl ShardRouter {
    pub fn new(shards: Vec<mpsc::Sender<CacheCommand>>) -> Self {
        assert!(!shards.is_empty(), "At least one shard required");
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    // Stable for a given id, so one content always lands on the same worker
    pub fn shard_for(&self, content: EntityId) -> usize {
        (content.0 % self.shards.len() as u64) as usize
    }

    fn sender(&self, content: EntityId) -> &mpsc::Sender<CacheCommand> {
        &self.shards[self.shard_for(content)]
    }
}

/// Front door of the aggregation cache.
///
/// Incremental updates are queued to per-shard workers: updates for one
/// content are applied in arrival order while different contents proceed in
/// parallel. A rebuild waits for in-flight updates and holds the workers off
/// until it is written. Reads go straight to the store.
///
/// This only orders writers inside this process. Another process updating the
/// same store can still race a worker; the count and sum survive that (they
/// are atomic increments), the stored average may lag until the next update.
pub struct CacheService {
    cache: Arc<AggregationCache>,
    router: ShardRouter,
    gate: Arc<RwLock<()>>,
}

impl CacheService {
    // Spawns the workers; needs a running tokio runtime
    pub fn spawn(cache: Arc<AggregationCache>, config: CacheConfig) -> Self {
        let gate = Arc::new(RwLock::new(()));
        let shard_count = config.shards.max(1);
        let mut senders = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel::<CacheCommand>(config.queue_depth.max(1));
            let worker_cache = cache.clone();
            let worker_gate = gate.clone();
            tokio::spawn(async move {
                shard_worker(shard, rx, worker_cache, worker_gate).await;
            });
            senders.push(tx);
        }

        info!(shards = shard_count, queue_depth = config.queue_depth, "cache workers spawned");
        Self {
            cache,
            router: ShardRouter::new(senders),
            gate,
        }
    }

    pub fn cache(&self) -> &AggregationCache {
        &self.cache
    }

    pub fn shards(&self) -> usize {
        self.router.shard_count()
    }

    pub async fn rebuild(&self, source: &dyn SourceOfRecord) -> Result<usize, CacheError> {
        let _guard = self.gate.write().await;
        self.cache.rebuild(source).await
    }

    pub async fn list(&self, ids: &[EntityId]) -> Result<Vec<CacheRecord>, CacheError> {
        self.cache.list(ids).await
    }

    pub async fn get(&self, content: EntityId) -> Result<Option<CacheRecord>, CacheError> {
        self.cache.get(content).await
    }

    pub async fn record_new_observation(&self, content: EntityId, value: i16) -> Result<CacheRecord, CacheError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(content, CacheCommand::NewObservation { content, value, reply }, rx)
            .await
    }

    pub async fn record_value_change(
        &self,
        content: EntityId,
        old_value: i16,
        new_value: i16,
    ) -> Result<CacheRecord, CacheError> {
        let (reply, rx) = oneshot::channel();
        let command = CacheCommand::ValueChange {
            content,
            old_value,
            new_value,
            reply,
        };
        self.dispatch(content, command, rx).await
    }

    async fn dispatch(
        &self,
        content: EntityId,
        command: CacheCommand,
        rx: oneshot::Receiver<Result<CacheRecord, CacheError>>,
    ) -> Result<CacheRecord, CacheError> {
        let start_time = Instant::now();

        self.router
            .sender(content)
            .send(command)
            .await
            .map_err(|_| CacheError::WorkerStopped)?;

        // wait for the worker's answer
        let result = rx.await.map_err(|_| CacheError::WorkerStopped)?;

        UPDATE_LATENCY.observe(start_time.elapsed().as_secs_f64());
        result
    }
}
