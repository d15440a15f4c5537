//! Qualified-segment caches.  Keyed by user id; `reset` empties the whole
//! cache (the redis backend tracks its keys in a set so reset does not
//! touch unrelated data).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;

use crate::config::PluginSpec;
use crate::error::CoreError;
use crate::plugins::redis_url;

#[async_trait]
pub trait OdpCache: Send + Sync {
    async fn lookup(&self, user_id: &str) -> Result<Option<Vec<String>>, CoreError>;
    async fn save(&self, user_id: &str, segments: Vec<String>) -> Result<(), CoreError>;
    async fn reset(&self) -> Result<(), CoreError>;
}

#[derive(Default)]
pub struct InMemoryOdpCache {
    entries: DashMap<String, Vec<String>>,
}

pub fn in_memory_creator(_spec: &PluginSpec) -> Result<Arc<dyn OdpCache>, CoreError> {
    Ok(Arc::new(InMemoryOdpCache::default()))
}

#[async_trait]
impl OdpCache for InMemoryOdpCache {
    async fn lookup(&self, user_id: &str) -> Result<Option<Vec<String>>, CoreError> {
        Ok(self.entries.get(user_id).map(|v| v.clone()))
    }

    async fn save(&self, user_id: &str, segments: Vec<String>) -> Result<(), CoreError> {
        self.entries.insert(user_id.to_string(), segments);
        Ok(())
    }

    async fn reset(&self) -> Result<(), CoreError> {
        self.entries.clear();
        Ok(())
    }
}

pub struct RedisOdpCache {
    client: redis::Client,
}

pub fn redis_creator(spec: &PluginSpec) -> Result<Arc<dyn OdpCache>, CoreError> {
    let client = redis::Client::open(redis_url(spec))
        .map_err(|e| CoreError::internal(format!("redis client: {e}")))?;
    Ok(Arc::new(RedisOdpCache { client }))
}

const KEY_SET: &str = "flagrelay-segments:keys";

impl RedisOdpCache {
    fn key(user_id: &str) -> String {
        format!("flagrelay-segments:{user_id}")
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, CoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CoreError::internal(format!("redis connect: {e}")))
    }
}

#[async_trait]
impl OdpCache for RedisOdpCache {
    async fn lookup(&self, user_id: &str) -> Result<Option<Vec<String>>, CoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(Self::key(user_id))
            .await
            .map_err(|e| CoreError::internal(format!("redis get: {e}")))?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CoreError::internal(format!("cached segments corrupt: {e}"))),
            None => Ok(None),
        }
    }

    async fn save(&self, user_id: &str, segments: Vec<String>) -> Result<(), CoreError> {
        let raw = serde_json::to_string(&segments)
            .map_err(|e| CoreError::internal(format!("segments encode: {e}")))?;
        let key = Self::key(user_id);
        let mut conn = self.conn().await?;
        redis::pipe()
            .set(&key, raw)
            .sadd(KEY_SET, &key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CoreError::internal(format!("redis set: {e}")))?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn
            .smembers(KEY_SET)
            .await
            .map_err(|e| CoreError::internal(format!("redis smembers: {e}")))?;
        if !keys.is_empty() {
            conn.del::<_, ()>(keys)
                .await
                .map_err(|e| CoreError::internal(format!("redis del: {e}")))?;
        }
        conn.del::<_, ()>(KEY_SET)
            .await
            .map_err(|e| CoreError::internal(format!("redis del: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_cache_round_trip_and_reset() {
        let cache = InMemoryOdpCache::default();
        assert!(cache.lookup("u1").await.unwrap().is_none());
        cache
            .save("u1", vec!["seg-a".into(), "seg-b".into()])
            .await
            .unwrap();
        assert_eq!(
            cache.lookup("u1").await.unwrap(),
            Some(vec!["seg-a".to_string(), "seg-b".to_string()])
        );
        cache.reset().await.unwrap();
        assert!(cache.lookup("u1").await.unwrap().is_none());
    }
}
