use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{Fields, KvStore};
use crate::error::StoreError;

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// In-process store with the same single-key atomicity as redis (one shard lock per key).
// Expiry follows tokio time, so paused-clock tests can step over a window.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|slot| !slot.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Occupied-but-expired entries behave as vacant
    fn live_entry(&self, key: &str) -> Entry<'_, String, Slot> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_expired(now) => {
                let (key, _) = occupied.remove_entry();
                self.entries.entry(key)
            }
            entry => entry,
        }
    }

    fn read<T>(&self, key: &str, f: impl FnOnce(&Value) -> Result<T, StoreError>) -> Result<Option<T>, StoreError> {
        match self.entries.get(key) {
            Some(slot) if !slot.is_expired(Instant::now()) => f(&slot.value).map(Some),
            _ => Ok(None),
        }
    }

    fn with_hash<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, String>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut slot = self.live_entry(key).or_insert_with(|| Slot {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Hash(hash) => f(hash),
            Value::Str(_) => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType { key: key.to_string() }
}

fn parse_int(key: &str, field: &str, raw: &str) -> Result<i64, StoreError> {
    raw.parse().map_err(|_| StoreError::Malformed {
        key: key.to_string(),
        field: field.to_string(),
        value: raw.to_string(),
    })
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.read(key, |value| match value {
            Value::Str(s) => Ok(s.clone()),
            Value::Hash(_) => Err(wrong_type(key)),
        })
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        match self.live_entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn take_token(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let Entry::Occupied(mut occupied) = self.live_entry(key) else {
            return Ok(None);
        };
        match &mut occupied.get_mut().value {
            Value::Str(s) => {
                let tokens = parse_int(key, "", s)?;
                if tokens <= 0 {
                    return Ok(None);
                }
                *s = (tokens - 1).to_string();
                Ok(Some(tokens - 1))
            }
            Value::Hash(_) => Err(wrong_type(key)),
        }
    }

    async fn set_max(&self, key: &str, value: i64) -> Result<i64, StoreError> {
        match self.live_entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Str(value.to_string()),
                    expires_at: None,
                });
                Ok(value)
            }
            Entry::Occupied(mut occupied) => match &mut occupied.get_mut().value {
                Value::Str(s) => {
                    let current = parse_int(key, "", s)?;
                    if current >= value {
                        return Ok(current);
                    }
                    *s = value.to_string();
                    Ok(value)
                }
                Value::Hash(_) => Err(wrong_type(key)),
            },
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let found = self.read(key, |value| match value {
            Value::Hash(hash) => Ok(hash.clone()),
            Value::Str(_) => Err(wrong_type(key)),
        })?;
        Ok(found.unwrap_or_default())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        self.with_hash(key, |hash| {
            hash.extend(fields.iter().cloned());
            Ok(())
        })
    }

    async fn hincr_many(&self, key: &str, increments: &[(&str, i64)]) -> Result<Vec<i64>, StoreError> {
        if increments.is_empty() {
            return Ok(Vec::new());
        }
        self.with_hash(key, |hash| {
            // Validate every field before touching any of them
            for (field, _) in increments {
                if let Some(raw) = hash.get(*field) {
                    parse_int(key, field, raw)?;
                }
            }
            let mut values = Vec::with_capacity(increments.len());
            for (field, by) in increments {
                let current = match hash.get(*field) {
                    Some(raw) => parse_int(key, field, raw)?,
                    None => 0,
                };
                let next = current + by;
                hash.insert(field.to_string(), next.to_string());
                values.push(next);
            }
            Ok(values)
        })
    }

    async fn hgetall_batch(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>, StoreError> {
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            rows.push(self.hgetall(key).await?);
        }
        Ok(rows)
    }

    async fn hset_batch(&self, rows: &[(String, Fields)]) -> Result<(), StoreError> {
        for (key, fields) in rows {
            self.hset(key, fields).await?;
        }
        Ok(())
    }
}
