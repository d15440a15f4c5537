//! User-profile stores.  A profile is an opaque JSON object keyed by user
//! id; saving an empty object clears the stored profile.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde_json::Value;

use crate::config::PluginSpec;
use crate::error::CoreError;
use crate::plugins::redis_url;

#[async_trait]
pub trait UserProfileService: Send + Sync {
    async fn lookup(&self, user_id: &str) -> Result<Option<Value>, CoreError>;
    async fn save(&self, user_id: &str, profile: Value) -> Result<(), CoreError>;
}

fn is_empty_profile(profile: &Value) -> bool {
    match profile {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[derive(Default)]
pub struct InMemoryProfileService {
    profiles: DashMap<String, Value>,
}

pub fn in_memory_creator(
    _spec: &PluginSpec,
) -> Result<Arc<dyn UserProfileService>, CoreError> {
    Ok(Arc::new(InMemoryProfileService::default()))
}

#[async_trait]
impl UserProfileService for InMemoryProfileService {
    async fn lookup(&self, user_id: &str) -> Result<Option<Value>, CoreError> {
        Ok(self.profiles.get(user_id).map(|p| p.clone()))
    }

    async fn save(&self, user_id: &str, profile: Value) -> Result<(), CoreError> {
        if is_empty_profile(&profile) {
            self.profiles.remove(user_id);
        } else {
            self.profiles.insert(user_id.to_string(), profile);
        }
        Ok(())
    }
}

pub struct RedisProfileService {
    client: redis::Client,
}

pub fn redis_creator(spec: &PluginSpec) -> Result<Arc<dyn UserProfileService>, CoreError> {
    let client = redis::Client::open(redis_url(spec))
        .map_err(|e| CoreError::internal(format!("redis client: {e}")))?;
    Ok(Arc::new(RedisProfileService { client }))
}

impl RedisProfileService {
    fn key(user_id: &str) -> String {
        format!("flagrelay-profile:{user_id}")
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, CoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CoreError::internal(format!("redis connect: {e}")))
    }
}

#[async_trait]
impl UserProfileService for RedisProfileService {
    async fn lookup(&self, user_id: &str) -> Result<Option<Value>, CoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(Self::key(user_id))
            .await
            .map_err(|e| CoreError::internal(format!("redis get: {e}")))?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CoreError::internal(format!("stored profile corrupt: {e}"))),
            None => Ok(None),
        }
    }

    async fn save(&self, user_id: &str, profile: Value) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        if is_empty_profile(&profile) {
            conn.del::<_, ()>(Self::key(user_id))
                .await
                .map_err(|e| CoreError::internal(format!("redis del: {e}")))?;
            return Ok(());
        }
        let raw = serde_json::to_string(&profile)
            .map_err(|e| CoreError::internal(format!("profile encode: {e}")))?;
        conn.set::<_, _, ()>(Self::key(user_id), raw)
            .await
            .map_err(|e| CoreError::internal(format!("redis set: {e}")))?;
        Ok(())
    }
}
