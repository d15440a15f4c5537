//! Cross-node bridge over redis pub/sub.  Notifications fan out on a
//! per-key channel so every node's stream subscribers see the same
//! sequence; datafile webhooks fan out on a shared channel so one node's
//! webhook refreshes every node.

use std::sync::Arc;

use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::engine::{Notification, NotificationType};
use crate::error::CoreError;
use crate::registry::ClientRegistry;

const DATAFILE_CHANNEL: &str = "flagrelay-datafile-sync";
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

pub struct SyncBridge {
    client: redis::Client,
    channel_prefix: String,
    notification_enabled: bool,
    datafile_enabled: bool,
}

impl SyncBridge {
    /// `None` disables the bridge; a syntactically invalid config also
    /// returns `None` with a warning rather than failing startup.
    pub fn from_config(cfg: &SyncConfig) -> Option<Arc<Self>> {
        let notification_enabled = cfg.notification.enable;
        let datafile_enabled = cfg.datafile.enable;
        if !notification_enabled && !datafile_enabled {
            return None;
        }
        for feature in [&cfg.notification, &cfg.datafile] {
            if feature.enable && feature.default != "redis" {
                tracing::warn!(backend = %feature.default, "unknown sync backend, sync disabled");
                return None;
            }
        }
        let redis_cfg = &cfg.pubsub.redis;
        if redis_cfg.host.is_empty() {
            tracing::warn!("sync enabled without a redis host, sync disabled");
            return None;
        }
        let url = if redis_cfg.password.is_empty() {
            format!("redis://{}/{}", redis_cfg.host, redis_cfg.database)
        } else {
            format!(
                "redis://:{}@{}/{}",
                redis_cfg.password, redis_cfg.host, redis_cfg.database
            )
        };
        match redis::Client::open(url) {
            Ok(client) => Some(Arc::new(Self {
                client,
                channel_prefix: redis_cfg.channel.clone(),
                notification_enabled,
                datafile_enabled,
            })),
            Err(e) => {
                tracing::warn!(error = %e, "invalid redis config, sync disabled");
                None
            }
        }
    }

    pub fn notification_enabled(&self) -> bool {
        self.notification_enabled
    }

    fn notification_channel(&self, sdk_key: &str) -> String {
        format!("{}-{}", self.channel_prefix, sdk_key)
    }

    /// Bus errors are logged, never surfaced to the caller.
    pub async fn publish_notification(&self, sdk_key: &str, notification: &Notification) {
        if !self.notification_enabled {
            return;
        }
        let payload = notification.envelope().to_string();
        let channel = self.notification_channel(sdk_key);
        match self.client.get_multiplexed_async_connection().await {
            Ok(mut conn) => {
                if let Err(e) = conn.publish::<_, _, ()>(&channel, payload).await {
                    tracing::warn!(error = %e, channel = %channel, "notification publish failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "redis connect failed"),
        }
    }

    pub async fn publish_datafile_update(&self, sdk_key: &str) {
        if !self.datafile_enabled {
            return;
        }
        match self.client.get_multiplexed_async_connection().await {
            Ok(mut conn) => {
                if let Err(e) = conn
                    .publish::<_, _, ()>(DATAFILE_CHANNEL, sdk_key)
                    .await
                {
                    tracing::warn!(error = %e, "datafile publish failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "redis connect failed"),
        }
    }

    /// Bus-fed notification stream for one key.  The receiver observes the
    /// globally linearized per-key order; a slow reader loses events the
    /// same way local hub subscribers do.
    pub fn subscribe_notifications(
        self: &Arc<Self>,
        sdk_key: &str,
    ) -> Result<mpsc::Receiver<Notification>, CoreError> {
        if !self.notification_enabled {
            return Err(CoreError::internal("notification sync is disabled"));
        }
        let (tx, rx) = mpsc::channel(16);
        let bridge = Arc::clone(self);
        let channel = self.notification_channel(sdk_key);
        tokio::spawn(async move {
            while !tx.is_closed() {
                match bridge.receive_into(&channel, &tx).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, channel = %channel, "bus receive failed, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn receive_into(
        &self,
        channel: &str,
        tx: &mpsc::Sender<Notification>,
    ) -> Result<(), redis::RedisError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            if tx.is_closed() {
                return Ok(());
            }
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable bus message");
                    continue;
                }
            };
            if let Some(notification) = decode_envelope(&payload) {
                if tx.try_send(notification).is_err() {
                    tracing::warn!(channel = %channel, "bus subscriber full, event dropped");
                }
            }
        }
        Err(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "subscription stream ended",
        )))
    }

    /// Datafile receive loop: every node applies reloads published by any
    /// node.  Runs until the process exits.
    pub fn start_datafile_receiver(self: &Arc<Self>, registry: Arc<ClientRegistry>) {
        if !self.datafile_enabled {
            return;
        }
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = bridge.datafile_receive_once(&registry).await {
                    tracing::warn!(error = %e, "datafile sync receive failed, retrying");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
    }

    async fn datafile_receive_once(
        &self,
        registry: &ClientRegistry,
    ) -> Result<(), redis::RedisError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(DATAFILE_CHANNEL).await?;
        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let sdk_key: String = match msg.get_payload() {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable datafile sync message");
                    continue;
                }
            };
            if let Err(e) = registry.update_configs(&sdk_key).await {
                tracing::warn!(sdk_key = %sdk_key, error = %e, "synced config update failed");
            }
        }
        Err(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "subscription stream ended",
        )))
    }
}

fn decode_envelope(payload: &str) -> Option<Notification> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .and_then(NotificationType::parse)?;
    let message = value.get("message").cloned().unwrap_or(serde_json::Value::Null);
    Some(Notification::new(kind, message))
}
