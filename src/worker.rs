use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, info};

use crate::cache::{AggregationCache, CacheRecord};
use crate::error::CacheError;
use crate::models::EntityId;

pub type Reply = oneshot::Sender<Result<CacheRecord, CacheError>>;

// An incremental update plus the channel its result goes back on
pub enum CacheCommand {
    NewObservation {
        content: EntityId,
        value: i16,
        reply: Reply,
    },
    ValueChange {
        content: EntityId,
        old_value: i16,
        new_value: i16,
        reply: Reply,
    },
}

// Applies the updates of one shard strictly one after another, so two updates
// for the same content never interleave their reads and writes.
// Each command runs under a read guard of `gate`; rebuilds take it exclusively.
pub async fn shard_worker(
    shard: usize,
    mut rx: mpsc::Receiver<CacheCommand>,
    cache: Arc<AggregationCache>,
    gate: Arc<RwLock<()>>,
) {
    info!(shard, "cache shard worker started");

    while let Some(command) = rx.recv().await {
        let _guard = gate.read().await;
        match command {
            CacheCommand::NewObservation { content, value, reply } => {
                let result = cache.record_new_observation(content, value).await;
                if reply.send(result).is_err() {
                    debug!(shard, %content, "caller went away before the like was recorded");
                }
            }
            CacheCommand::ValueChange {
                content,
                old_value,
                new_value,
                reply,
            } => {
                let result = cache.record_value_change(content, old_value, new_value).await;
                if reply.send(result).is_err() {
                    debug!(shard, %content, "caller went away before the value change was recorded");
                }
            }
        }
    }

    info!(shard, "cache shard worker stopped");
}
