//! Per-content like statistics, denormalized into store hashes.
//!
//! Each content gets one hash at `content:<id>`:
//!
//! | field         | meaning                                   |
//! |---------------|-------------------------------------------|
//! | `id`          | content id                                |
//! | `title`       | mirrored, only after a rebuild            |
//! | `text`        | mirrored, only after a rebuild            |
//! | `likes_count` | number of accepted likes                  |
//! | `likes_sum`   | exact integer sum of their values         |
//! | `likes_avg`   | `likes_sum / likes_count`, `0.0` if empty |
//!
//! Every value is stored as text. `likes_count` and `likes_sum` only move through
//! atomic integer increments; `likes_avg` is always derived from them, so the
//! incremental path writes exactly what a rebuild over the same likes would.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{CacheError, StoreError};
use crate::metrics::{
    LIST_HITS, LIST_MISSES, OBSERVATIONS_RECORDED, REBUILDS, REBUILT_RECORDS, VALUE_CHANGES,
};
use crate::models::{EntityAggregate, EntityId, ObservationRange, mean_of};
use crate::source::SourceOfRecord;
use crate::store::{Fields, KvStore};

pub const MAX_ID_KEY: &str = "content:max_id";

const ID: &str = "id";
const TITLE: &str = "title";
const TEXT: &str = "text";
const COUNT: &str = "likes_count";
const SUM: &str = "likes_sum";
const AVG: &str = "likes_avg";

pub fn record_key(content: EntityId) -> String {
    format!("content:{content}")
}

// Integral means keep a trailing ".0" so "0.0" and "5.0" match what the
// system-of-record side has always written.
pub fn format_mean(mean: f64) -> String {
    if mean.is_finite() && mean.fract() == 0.0 {
        format!("{mean:.1}")
    } else {
        mean.to_string()
    }
}

// One cached content
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheRecord {
    pub id: EntityId,
    pub title: Option<String>,
    pub text: Option<String>,
    pub likes_count: u64,
    pub likes_avg: f64,
    pub likes_sum: i64,
}

impl CacheRecord {
    pub fn from_aggregate(row: &EntityAggregate) -> Self {
        Self {
            id: row.content.id,
            title: Some(row.content.title.clone()),
            text: Some(row.content.text.clone()),
            likes_count: row.count,
            likes_avg: row.mean(),
            likes_sum: row.sum,
        }
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = vec![(ID.to_string(), self.id.to_string())];
        if let Some(title) = &self.title {
            fields.push((TITLE.to_string(), title.clone()));
        }
        if let Some(text) = &self.text {
            fields.push((TEXT.to_string(), text.clone()));
        }
        fields.push((COUNT.to_string(), self.likes_count.to_string()));
        fields.push((AVG.to_string(), format_mean(self.likes_avg)));
        fields.push((SUM.to_string(), self.likes_sum.to_string()));
        fields
    }
}

// A decoded hash, plus whether `likes_sum` was actually stored.
// Hashes written before `likes_sum` existed carry only count and average.
struct Decoded {
    record: CacheRecord,
    sum_stored: bool,
}

fn parse_field<T: std::str::FromStr>(
    key: &str,
    fields: &HashMap<String, String>,
    field: &str,
) -> Result<Option<T>, StoreError> {
    match fields.get(field) {
        Some(raw) => raw.parse().map(Some).map_err(|_| StoreError::Malformed {
            key: key.to_string(),
            field: field.to_string(),
            value: raw.clone(),
        }),
        None => Ok(None),
    }
}

fn decode(key: &str, content: EntityId, fields: &HashMap<String, String>) -> Result<Decoded, StoreError> {
    let likes_count: u64 = parse_field(key, fields, COUNT)?.unwrap_or(0);
    let stored_avg: Option<f64> = parse_field(key, fields, AVG)?;
    let stored_sum: Option<i64> = parse_field(key, fields, SUM)?;
    // Like values are integers, so the sum is recoverable from the average
    let likes_sum = match (stored_sum, stored_avg) {
        (Some(sum), _) => sum,
        (None, Some(avg)) => (avg * likes_count as f64).round() as i64,
        (None, None) if likes_count == 0 => 0,
        (None, None) => {
            return Err(StoreError::Malformed {
                key: key.to_string(),
                field: SUM.to_string(),
                value: String::new(),
            });
        }
    };
    Ok(Decoded {
        record: CacheRecord {
            id: parse_field(key, fields, ID)?.map(EntityId).unwrap_or(content),
            title: fields.get(TITLE).cloned(),
            text: fields.get(TEXT).cloned(),
            likes_count,
            // a stale likes_avg never outlives the counters it came from
            likes_avg: mean_of(likes_sum, likes_count),
            likes_sum,
        },
        sum_stored: stored_sum.is_some(),
    })
}

/// The aggregation cache proper. Methods here do no coordination of their own:
/// concurrent incremental updates for one content must be funneled through
/// [`crate::shards::CacheService`].
pub struct AggregationCache {
    store: Arc<dyn KvStore>,
    range: ObservationRange,
}

impl AggregationCache {
    pub fn new(store: Arc<dyn KvStore>, range: ObservationRange) -> Self {
        Self { store, range }
    }

    pub fn range(&self) -> ObservationRange {
        self.range
    }

    /// Recompute every record from the system-of-record.
    ///
    /// The source is read completely before anything is written, so a failing
    /// source leaves the cache as it was. All records then go out in a single
    /// transaction, overwriting whatever was cached.
    pub async fn rebuild(&self, source: &dyn SourceOfRecord) -> Result<usize, CacheError> {
        let rows = source.entity_aggregates().await?;

        let batch: Vec<(String, Fields)> = rows
            .iter()
            .map(|row| (record_key(row.content.id), CacheRecord::from_aggregate(row).to_fields()))
            .collect();
        self.store.hset_batch(&batch).await?;

        if let Some(max_id) = rows.iter().map(|row| row.content.id).max() {
            self.note_created(max_id).await?;
        }

        REBUILDS.inc();
        REBUILT_RECORDS.inc_by(rows.len() as f64);
        info!(records = rows.len(), "cache rebuilt");
        Ok(rows.len())
    }

    // Cached records for `ids`, in order. Uncached ids are left out, not zero-filled.
    pub async fn list(&self, ids: &[EntityId]) -> Result<Vec<CacheRecord>, CacheError> {
        let keys: Vec<String> = ids.iter().map(|id| record_key(*id)).collect();
        let rows = self.store.hgetall_batch(&keys).await?;

        let mut records = Vec::with_capacity(rows.len());
        for ((id, key), fields) in ids.iter().zip(&keys).zip(&rows) {
            if fields.is_empty() {
                LIST_MISSES.inc();
                continue;
            }
            LIST_HITS.inc();
            records.push(decode(key, *id, fields)?.record);
        }
        Ok(records)
    }

    pub async fn get(&self, content: EntityId) -> Result<Option<CacheRecord>, CacheError> {
        let key = record_key(content);
        let fields = self.store.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode(&key, content, &fields)?.record))
    }

    /// Fold one newly accepted like into the content's record, creating the
    /// record if it is not cached yet. Never call this for rate-limited likes.
    ///
    /// `(mean * count + value) / (count + 1)`, computed as `(sum + value) / (count + 1)`.
    pub async fn record_new_observation(&self, content: EntityId, value: i16) -> Result<CacheRecord, CacheError> {
        self.check_value(content, value)?;

        let key = record_key(content);
        let before = self.load(&key, content).await?;

        let [count, sum] = self.increment(&key, [(COUNT, 1), (SUM, i64::from(value))]).await?;
        if count != before.likes_count as i64 + 1 {
            warn!(%content, expected = before.likes_count + 1, count, "likes_count moved under us, another writer is active");
        }

        let count = count.max(0) as u64;
        let mean = mean_of(sum, count);
        self.store
            .hset(&key, &[(ID.to_string(), content.to_string()), (AVG.to_string(), format_mean(mean))])
            .await?;

        OBSERVATIONS_RECORDED.inc();
        debug!(%content, value, count, mean, "like recorded");
        Ok(CacheRecord {
            likes_count: count,
            likes_avg: mean,
            likes_sum: sum,
            ..before
        })
    }

    /// Apply an in-place edit of an already counted like.
    ///
    /// `mean + (new - old) / count`, computed as `(sum + new - old) / count`
    /// with the count read at call time. The count never changes here.
    pub async fn record_value_change(
        &self,
        content: EntityId,
        old_value: i16,
        new_value: i16,
    ) -> Result<CacheRecord, CacheError> {
        self.check_value(content, old_value)?;
        self.check_value(content, new_value)?;

        let key = record_key(content);
        let fields = self.store.hgetall(&key).await?;
        let Decoded { record, sum_stored } = decode(&key, content, &fields)?;
        if record.likes_count == 0 {
            warn!(%content, old_value, new_value, "value change on content without counted likes");
            return Err(CacheError::Precondition(format!(
                "like value changed on content {content}, which has no counted likes"
            )));
        }
        if old_value == new_value {
            return Ok(record);
        }
        if !sum_stored {
            self.seed_sum(&key, content, &record).await?;
        }

        let delta = i64::from(new_value) - i64::from(old_value);
        let [sum] = self.increment(&key, [(SUM, delta)]).await?;
        let mean = mean_of(sum, record.likes_count);
        self.store.hset(&key, &[(AVG.to_string(), format_mean(mean))]).await?;

        VALUE_CHANGES.inc();
        debug!(%content, old_value, new_value, count = record.likes_count, mean, "like value changed");
        Ok(CacheRecord {
            likes_avg: mean,
            likes_sum: sum,
            ..record
        })
    }

    // Largest content id ever created, 0 when unknown
    pub async fn max_id(&self) -> Result<u64, CacheError> {
        match self.store.get(MAX_ID_KEY).await? {
            Some(raw) => raw.parse().map_err(|_| {
                CacheError::Store(StoreError::Malformed {
                    key: MAX_ID_KEY.to_string(),
                    field: String::new(),
                    value: raw,
                })
            }),
            None => Ok(0),
        }
    }

    // Raise the max id in one atomic compare-and-set. Never lowers it.
    pub async fn note_created(&self, content: EntityId) -> Result<(), CacheError> {
        let wanted = i64::try_from(content.0).map_err(|_| {
            CacheError::Precondition(format!("content id {content} does not fit the max id counter"))
        })?;
        self.store.set_max(MAX_ID_KEY, wanted).await?;
        Ok(())
    }

    fn check_value(&self, content: EntityId, value: i16) -> Result<(), CacheError> {
        if self.range.contains(value) {
            return Ok(());
        }
        warn!(%content, value, "like value out of range reached the cache");
        Err(CacheError::Precondition(format!(
            "like value {value} on content {content} outside {}..={}",
            self.range.min, self.range.max
        )))
    }

    // Counter fields move together or not at all
    async fn increment<const N: usize>(
        &self,
        key: &str,
        increments: [(&str, i64); N],
    ) -> Result<[i64; N], CacheError> {
        let values = self.store.hincr_many(key, &increments).await?;
        <[i64; N]>::try_from(values).map_err(|values| {
            CacheError::Store(StoreError::Unavailable(format!(
                "{key}: {} increments answered with {} values",
                N,
                values.len()
            )))
        })
    }

    // Current record, with `likes_sum` guaranteed to be stored
    async fn load(&self, key: &str, content: EntityId) -> Result<CacheRecord, CacheError> {
        let fields = self.store.hgetall(key).await?;
        let Decoded { record, sum_stored } = decode(key, content, &fields)?;
        if !sum_stored && record.likes_count > 0 {
            self.seed_sum(key, content, &record).await?;
        }
        Ok(record)
    }

    async fn seed_sum(&self, key: &str, content: EntityId, record: &CacheRecord) -> Result<(), CacheError> {
        info!(%content, count = record.likes_count, sum = record.likes_sum, "seeding likes_sum on legacy record");
        self.store
            .hset(key, &[(SUM.to_string(), record.likes_sum.to_string())])
            .await?;
        Ok(())
    }
}
