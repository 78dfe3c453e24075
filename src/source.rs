//! The system-of-record, seen from the cache.
//!
//! [`SourceOfRecord`] is the read side used by rebuilds; [`ObservationLedger`]
//! is the write side the orchestrator persists likes through. The relational
//! schema behind them is not ours; [`PgSource`] only reads it.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::error::SourceError;
use crate::models::{
    ActorId, AdmissionState, Content, EntityAggregate, EntityId, Observation, ObservationId,
};

#[async_trait]
pub trait SourceOfRecord: Send + Sync {
    /// One row per content, ordered by id, with the count and sum of its
    /// accepted likes. Contents without likes are included with zeros.
    async fn entity_aggregates(&self) -> Result<Vec<EntityAggregate>, SourceError>;
}

#[async_trait]
pub trait ObservationLedger: Send + Sync {
    async fn insert_content(&self, title: &str, text: &str) -> Result<Content, SourceError>;

    // The accepted like of `actor` on `content`, if any. Rate-limited likes are never returned.
    async fn find_accepted(&self, content: EntityId, actor: ActorId) -> Result<Option<Observation>, SourceError>;

    async fn insert_observation(
        &self,
        content: EntityId,
        actor: ActorId,
        value: i16,
        state: AdmissionState,
    ) -> Result<Observation, SourceError>;

    async fn update_value(&self, id: ObservationId, value: i16) -> Result<Observation, SourceError>;
}

// ============================================================================
// In-process records
// ============================================================================

// Dump of contents and likes, e.g. exported from the database
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub contents: Vec<Content>,
    #[serde(default)]
    pub likes: Vec<Observation>,
}

/// System-of-record kept in memory. Ids are issued from 1 upwards, and at most
/// one accepted like per (content, user) is enforced on insert.
#[derive(Default)]
pub struct MemoryRecords {
    contents: DashMap<EntityId, Content>,
    likes: DashMap<ObservationId, Observation>,
    accepted: DashMap<(EntityId, ActorId), ObservationId>,
    next_content: AtomicU64,
    next_like: AtomicU64,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, SourceError> {
        let records = Self::new();
        for content in snapshot.contents {
            records.next_content.fetch_max(content.id.0, Ordering::SeqCst);
            records.contents.insert(content.id, content);
        }
        for like in snapshot.likes {
            if !records.contents.contains_key(&like.content_id) {
                return Err(SourceError(format!(
                    "like {} refers to unknown content {}",
                    like.id.0, like.content_id
                )));
            }
            if like.state == AdmissionState::Accepted
                && records.accepted.insert((like.content_id, like.actor_id), like.id).is_some()
            {
                return Err(SourceError(format!(
                    "user {} has more than one accepted like on content {}",
                    like.actor_id.0, like.content_id
                )));
            }
            records.next_like.fetch_max(like.id.0, Ordering::SeqCst);
            records.likes.insert(like.id, like);
        }
        Ok(records)
    }

    pub async fn load_snapshot(path: &Path) -> Result<Self, SourceError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SourceError(format!("reading {}: {e}", path.display())))?;
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .map_err(|e| SourceError(format!("parsing {}: {e}", path.display())))?;
        let records = Self::from_snapshot(snapshot)?;
        info!(
            path = %path.display(),
            contents = records.contents.len(),
            likes = records.likes.len(),
            "snapshot loaded"
        );
        Ok(records)
    }

    pub fn add_content(&self, title: &str, text: &str) -> Content {
        let id = EntityId(self.next_content.fetch_add(1, Ordering::SeqCst) + 1);
        let content = Content {
            id,
            title: title.to_string(),
            text: text.to_string(),
        };
        self.contents.insert(id, content.clone());
        content
    }

    pub fn likes_of(&self, content: EntityId) -> Vec<Observation> {
        let mut likes: Vec<Observation> = self
            .likes
            .iter()
            .filter(|like| like.content_id == content)
            .map(|like| like.clone())
            .collect();
        likes.sort_by_key(|like| like.id.0);
        likes
    }
}

#[async_trait]
impl SourceOfRecord for MemoryRecords {
    async fn entity_aggregates(&self) -> Result<Vec<EntityAggregate>, SourceError> {
        let mut folded: HashMap<EntityId, (u64, i64)> = HashMap::new();
        for like in self.likes.iter() {
            if like.state != AdmissionState::Accepted {
                continue;
            }
            let (count, sum) = folded.entry(like.content_id).or_default();
            *count += 1;
            *sum += i64::from(like.value);
        }

        let mut rows: Vec<EntityAggregate> = self
            .contents
            .iter()
            .map(|content| {
                let (count, sum) = folded.get(content.key()).copied().unwrap_or_default();
                EntityAggregate {
                    content: content.clone(),
                    count,
                    sum,
                }
            })
            .collect();
        rows.sort_by_key(|row| row.content.id);
        Ok(rows)
    }
}

#[async_trait]
impl ObservationLedger for MemoryRecords {
    async fn insert_content(&self, title: &str, text: &str) -> Result<Content, SourceError> {
        Ok(self.add_content(title, text))
    }

    async fn find_accepted(&self, content: EntityId, actor: ActorId) -> Result<Option<Observation>, SourceError> {
        let Some(id) = self.accepted.get(&(content, actor)).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.likes.get(&id).map(|like| like.clone()))
    }

    async fn insert_observation(
        &self,
        content: EntityId,
        actor: ActorId,
        value: i16,
        state: AdmissionState,
    ) -> Result<Observation, SourceError> {
        if !self.contents.contains_key(&content) {
            return Err(SourceError(format!("unknown content {content}")));
        }
        let id = ObservationId(self.next_like.fetch_add(1, Ordering::SeqCst) + 1);
        if state == AdmissionState::Accepted {
            match self.accepted.entry((content, actor)) {
                Entry::Occupied(_) => {
                    return Err(SourceError(format!(
                        "user {} already has an accepted like on content {content}",
                        actor.0
                    )));
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(id);
                }
            }
        }
        let like = Observation {
            id,
            content_id: content,
            actor_id: actor,
            value,
            state,
            created_at: Utc::now(),
        };
        self.likes.insert(id, like.clone());
        debug!(like = id.0, %content, user = actor.0, ?state, "like stored");
        Ok(like)
    }

    async fn update_value(&self, id: ObservationId, value: i16) -> Result<Observation, SourceError> {
        let mut like = self
            .likes
            .get_mut(&id)
            .ok_or_else(|| SourceError(format!("unknown like {}", id.0)))?;
        like.value = value;
        Ok(like.clone())
    }
}

// ============================================================================
// Postgres
// ============================================================================

// Left join so contents without accepted likes still get a zero row
const AGGREGATE_QUERY: &str = "
SELECT c.id::bigint AS id,
       c.title,
       c.text,
       COUNT(l.id)::bigint AS likes_count,
       COALESCE(SUM(l.value), 0)::bigint AS likes_sum
  FROM content_management_content c
  LEFT JOIN content_management_like l
         ON l.content_id = c.id
        AND l.state = $1
 GROUP BY c.id, c.title, c.text
 ORDER BY c.id";

// Rebuild source over the content/like tables
#[derive(Clone)]
pub struct PgSource {
    pool: Pool,
}

impl PgSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn connect(database_url: &str) -> Result<Self, SourceError> {
        let mut cfg = Config::new();
        cfg.url = Some(database_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| SourceError(format!("Failed to create pool: {e}")))?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl SourceOfRecord for PgSource {
    async fn entity_aggregates(&self) -> Result<Vec<EntityAggregate>, SourceError> {
        let conn = self.pool.get().await?;
        let accepted = AdmissionState::Accepted.code();
        let rows = conn.query(AGGREGATE_QUERY, &[&accepted]).await?;

        let aggregates = rows
            .iter()
            .map(|row| -> Result<EntityAggregate, tokio_postgres::Error> {
                let id: i64 = row.try_get("id")?;
                let count: i64 = row.try_get("likes_count")?;
                Ok(EntityAggregate {
                    content: Content {
                        id: EntityId(id as u64),
                        title: row.try_get("title")?,
                        text: row.try_get("text")?,
                    },
                    count: count.max(0) as u64,
                    sum: row.try_get("likes_sum")?,
                })
            })
            .collect::<Result<Vec<_>, tokio_postgres::Error>>()?;
        debug!(rows = aggregates.len(), "aggregates fetched from postgres");
        Ok(aggregates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn like(id: u64, content: u64, actor: u64, value: i16, state: AdmissionState) -> Observation {
        Observation {
            id: ObservationId(id),
            content_id: EntityId(content),
            actor_id: ActorId(actor),
            value,
            state,
            created_at: Utc::now(),
        }
    }

    fn content(id: u64) -> Content {
        Content {
            id: EntityId(id),
            title: format!("title {id}"),
            text: format!("text {id}"),
        }
    }

    #[tokio::test]
    async fn aggregates_cover_contents_without_likes() {
        let records = MemoryRecords::from_snapshot(Snapshot {
            contents: vec![content(1), content(2), content(3)],
            likes: vec![
                like(1, 1, 1, 5, AdmissionState::Accepted),
                like(2, 2, 1, 2, AdmissionState::Accepted),
                like(3, 2, 2, 0, AdmissionState::Accepted),
                like(4, 2, 3, 4, AdmissionState::Accepted),
            ],
        })
        .unwrap();

        let rows = records.entity_aggregates().await.unwrap();
        let summary: Vec<(u64, u64, f64)> = rows
            .iter()
            .map(|row| (row.content.id.0, row.count, row.mean()))
            .collect();
        assert_eq!(summary, vec![(1, 1, 5.0), (2, 3, 2.0), (3, 0, 0.0)]);
    }

    #[tokio::test]
    async fn rate_limited_likes_are_not_aggregated() {
        let records = MemoryRecords::from_snapshot(Snapshot {
            contents: vec![content(1)],
            likes: vec![
                like(1, 1, 1, 4, AdmissionState::Accepted),
                like(2, 1, 2, 0, AdmissionState::RateLimited),
            ],
        })
        .unwrap();

        let rows = records.entity_aggregates().await.unwrap();
        assert_eq!((rows[0].count, rows[0].sum), (1, 4));
    }

    #[tokio::test]
    async fn one_accepted_like_per_user_and_content() {
        let records = MemoryRecords::new();
        let c = records.add_content("t", "x");
        records
            .insert_observation(c.id, ActorId(1), 3, AdmissionState::Accepted)
            .await
            .unwrap();
        assert!(
            records
                .insert_observation(c.id, ActorId(1), 4, AdmissionState::Accepted)
                .await
                .is_err()
        );
        // rate-limited attempts are kept for audit
        records
            .insert_observation(c.id, ActorId(1), 4, AdmissionState::RateLimited)
            .await
            .unwrap();
        assert_eq!(records.likes_of(c.id).len(), 2);
    }

    #[tokio::test]
    async fn find_accepted_ignores_rate_limited_likes() {
        let records = MemoryRecords::new();
        let c = records.add_content("t", "x");
        records
            .insert_observation(c.id, ActorId(1), 3, AdmissionState::RateLimited)
            .await
            .unwrap();
        assert!(records.find_accepted(c.id, ActorId(1)).await.unwrap().is_none());
    }

    #[test]
    fn snapshot_rejects_dangling_likes() {
        let result = MemoryRecords::from_snapshot(Snapshot {
            contents: vec![content(1)],
            likes: vec![like(1, 2, 1, 3, AdmissionState::Accepted)],
        });
        assert!(result.is_err());
    }

    #[test]
    fn snapshot_ids_continue_after_the_largest() {
        let records = MemoryRecords::from_snapshot(Snapshot {
            contents: vec![content(7)],
            likes: Vec::new(),
        })
        .unwrap();
        assert_eq!(records.add_content("t", "x").id, EntityId(8));
    }
}
