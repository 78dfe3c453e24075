use async_trait::async_trait;
use lazy_static::lazy_static;
use redis::{AsyncCommands, Client, RedisResult, Script, aio::ConnectionManager};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::info;

use super::{Fields, KvStore};
use crate::error::StoreError;

lazy_static! {
    // DECR only a live bucket that still has tokens, so an expired bucket is never
    // recreated without its TTL. -1 means no token was taken.
    static ref TAKE_TOKEN: Script = Script::new(
        r"
        local raw = redis.call('GET', KEYS[1])
        if not raw then
            return -1
        end
        local tokens = tonumber(raw)
        if tokens == nil then
            return redis.error_reply('ERR value is not an integer')
        end
        if tokens <= 0 then
            return -1
        end
        return redis.call('DECR', KEYS[1])
        "
    );

    static ref SET_MAX: Script = Script::new(
        r"
        local raw = redis.call('GET', KEYS[1])
        local wanted = tonumber(ARGV[1])
        if raw then
            local current = tonumber(raw)
            if current == nil then
                return redis.error_reply('ERR value is not an integer')
            end
            if current >= wanted then
                return current
            end
        end
        redis.call('SET', KEYS[1], ARGV[1])
        return wanted
        "
    );
}

// Redis behind a reconnecting connection manager.
// Cloning is cheap, all clones share the same multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let conn = match tokio::time::timeout(timeout, client.get_connection_manager()).await {
            Ok(conn) => conn?,
            Err(_) => return Err(StoreError::Timeout(timeout)),
        };
        info!(url = %redis_url, ?timeout, "connected to redis");
        Ok(Self { conn, timeout })
    }

    // Every command is bounded by the configured timeout. Elapsed is an error, never retried.
    async fn timed<T>(&self, fut: impl Future<Output = RedisResult<T>>) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.timed(conn.get(key)).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1));
        // OK when created, nil when the key already existed
        let created: Option<String> = self.timed(cmd.query_async(&mut conn)).await?;
        Ok(created.is_some())
    }

    async fn take_token(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = TAKE_TOKEN.prepare_invoke();
        invocation.key(key);
        let left: i64 = self.timed(invocation.invoke_async(&mut conn)).await?;
        Ok((left >= 0).then_some(left))
    }

    async fn set_max(&self, key: &str, value: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = SET_MAX.prepare_invoke();
        invocation.key(key).arg(value);
        self.timed(invocation.invoke_async(&mut conn)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        self.timed(conn.hgetall(key)).await
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        self.timed(conn.hset_multiple(key, fields)).await
    }

    async fn hincr_many(&self, key: &str, increments: &[(&str, i64)]) -> Result<Vec<i64>, StoreError> {
        if increments.is_empty() {
            return Ok(Vec::new());
        }
        // MULTI/EXEC: a dropped connection applies all of them or none
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, by) in increments {
            pipe.hincr(key, *field, *by);
        }
        let mut conn = self.conn.clone();
        self.timed(pipe.query_async(&mut conn)).await
    }

    async fn hgetall_batch(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hgetall(key);
        }
        let mut conn = self.conn.clone();
        self.timed(pipe.query_async(&mut conn)).await
    }

    async fn hset_batch(&self, rows: &[(String, Fields)]) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, fields) in rows.iter().filter(|(_, fields)| !fields.is_empty()) {
            pipe.hset_multiple(key, fields).ignore();
        }
        let mut conn = self.conn.clone();
        self.timed(pipe.query_async(&mut conn)).await
    }
}
