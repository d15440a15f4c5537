//! Agent configuration.  Loaded from a YAML file (path in
//! `FLAGRELAY_CONFIG`, default `config.yaml`; a missing file yields the
//! defaults) with a handful of environment overrides for ports and log
//! level.  Durations accept a numeric string with a unit suffix (`5s`,
//! `5m`) or a raw integer interpreted as nanoseconds.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Duration newtype with the flexible YAML representation described above.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub fn from_secs(secs: u64) -> Self {
        ConfigDuration(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for ConfigDuration {
    fn default() -> Self {
        ConfigDuration(Duration::ZERO)
    }
}

fn parse_duration_str(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(n) = raw.parse::<u64>() {
        // Bare integers are nanoseconds.
        return Some(Duration::from_nanos(n));
    }
    let split = raw.find(|c: char| c.is_ascii_alphabetic())?;
    let (num, unit) = raw.split_at(split);
    let value: f64 = num.trim().parse().ok()?;
    let secs = match unit.trim() {
        "ns" => value / 1e9,
        "us" => value / 1e6,
        "ms" => value / 1e3,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    if secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = ConfigDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"30s\" or an integer nanosecond count")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ConfigDuration(Duration::from_nanos(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(ConfigDuration(Duration::from_nanos(v as u64)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                parse_duration_str(v)
                    .map(ConfigDuration)
                    .ok_or_else(|| E::custom(format!("invalid duration: {v:?}")))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let d = self.0;
        let repr = if d.subsec_nanos() == 0 {
            format!("{}s", d.as_secs())
        } else {
            format!("{}ms", d.as_millis())
        };
        serializer.serialize_str(&repr)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub admin: AdminConfig,
    pub api: ApiConfig,
    pub webhook: WebhookConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub log: LogConfig,
    pub sync: SyncConfig,
    /// SDK keys warmed at startup.
    pub sdk_keys: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdminConfig {
    pub name: String,
    pub version: String,
    pub author: String,
    pub port: u16,
    pub auth: ServiceAuthConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiConfig {
    pub port: u16,
    /// Cap on concurrently open event-stream connections; 0 disables.
    pub max_conns: usize,
    /// Cap on sub-requests accepted by the batch dispatcher.
    pub operations_limit: usize,
    pub enable_notifications: bool,
    pub enable_overrides: bool,
    pub allowed_hosts: Vec<String>,
    pub auth: ServiceAuthConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebhookConfig {
    pub port: u16,
    pub projects: HashMap<i64, WebhookProject>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebhookProject {
    pub sdk_keys: Vec<String>,
    pub secret: String,
    pub skip_signature_check: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub polling_interval: ConfigDuration,
    pub batch_size: usize,
    pub queue_size: usize,
    pub flush_interval: ConfigDuration,
    pub datafile_url_template: String,
    pub event_url: String,
    pub sdk_key_regex: String,
    /// Named user-profile-service instances available to handles.
    pub user_profile_services: HashMap<String, PluginSpec>,
    /// Named ODP/decision cache instances available to handles.
    pub odp_caches: HashMap<String, PluginSpec>,
    /// Store used for new handles unless overridden per key.
    pub default_user_profile_service: Option<String>,
    pub default_odp_cache: Option<String>,
}

/// One pluggable store definition.  The secret accepts flexible field
/// naming; resolution order is `auth_token`, `redis_secret`, `password`,
/// then the environment variable named by `password_env`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub database: i64,
    pub auth_token: Option<String>,
    pub redis_secret: Option<String>,
    pub password: Option<String>,
    pub password_env: Option<String>,
}

impl PluginSpec {
    /// First non-empty secret wins; environment fallback last.
    pub fn resolve_secret(&self) -> String {
        for candidate in [&self.auth_token, &self.redis_secret, &self.password] {
            if let Some(value) = candidate {
                if !value.is_empty() {
                    return value.clone();
                }
            }
        }
        if let Some(var) = &self.password_env {
            if let Ok(value) = env::var(var) {
                if !value.is_empty() {
                    return value;
                }
            }
        }
        String::new()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub read_timeout: ConfigDuration,
    pub write_timeout: ConfigDuration,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    pub level: String,
    pub pretty: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub notification: SyncFeature,
    pub datafile: SyncFeature,
    pub pubsub: PubSubConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncFeature {
    pub enable: bool,
    /// Name of the pubsub backend; only `redis` is recognized.
    pub default: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PubSubConfig {
    pub redis: RedisPubSubConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedisPubSubConfig {
    pub host: String,
    pub password: String,
    pub database: i64,
    pub channel: String,
}

impl Default for RedisPubSubConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            password: String::new(),
            database: 0,
            channel: "flagrelay-sync".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceAuthConfig {
    pub clients: Vec<OAuthClientConfig>,
    pub hmac_secrets: Vec<String>,
    pub ttl: ConfigDuration,
    pub jwks_url: Option<String>,
    pub jwks_update_interval: Option<ConfigDuration>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OAuthClientConfig {
    pub id: String,
    /// base64 of the SHA-256 digest of the client secret.
    pub secret_hash: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            name: "flagrelay".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            author: "flagrelay authors".to_string(),
            port: 8088,
            auth: ServiceAuthConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_conns: 0,
            operations_limit: 10,
            enable_notifications: true,
            enable_overrides: true,
            allowed_hosts: vec![".".to_string()],
            auth: ServiceAuthConfig::default(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            projects: HashMap::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            polling_interval: ConfigDuration::from_secs(60),
            batch_size: 10,
            queue_size: 1000,
            flush_interval: ConfigDuration::from_secs(30),
            datafile_url_template: "https://cdn.optimizely.com/datafiles/{}.json".to_string(),
            event_url: "https://logx.optimizely.com/v1/events".to_string(),
            sdk_key_regex: "^\\w+(:\\w+)?$".to_string(),
            user_profile_services: HashMap::new(),
            odp_caches: HashMap::new(),
            default_user_profile_service: None,
            default_odp_cache: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            read_timeout: ConfigDuration::from_secs(5),
            write_timeout: ConfigDuration::from_secs(10),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            pretty: false,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            admin: AdminConfig::default(),
            api: ApiConfig::default(),
            webhook: WebhookConfig::default(),
            client: ClientConfig::default(),
            server: ServerConfig::default(),
            log: LogConfig::default(),
            sync: SyncConfig::default(),
            sdk_keys: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        let path = env::var("FLAGRELAY_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
        let mut config = if Path::new(&path).exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path:?}"))?;
            serde_yaml::from_str::<AgentConfig>(&raw)
                .with_context(|| format!("failed to parse config file {path:?}"))?
        } else {
            AgentConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: AgentConfig =
            serde_yaml::from_str(raw).context("failed to parse configuration YAML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(port) = env_port("FLAGRELAY_API_PORT") {
            self.api.port = port;
        }
        if let Some(port) = env_port("FLAGRELAY_ADMIN_PORT") {
            self.admin.port = port;
        }
        if let Some(port) = env_port("FLAGRELAY_WEBHOOK_PORT") {
            self.webhook.port = port;
        }
        if let Ok(level) = env::var("FLAGRELAY_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.log.level = level;
            }
        }
    }

    /// Copy with every secret zeroed, used by the admin `/config` echo.
    pub fn redacted(&self) -> AgentConfig {
        let mut copy = self.clone();
        for project in copy.webhook.projects.values_mut() {
            project.secret.clear();
        }
        for auth in [&mut copy.api.auth, &mut copy.admin.auth] {
            auth.hmac_secrets = auth.hmac_secrets.iter().map(|_| String::new()).collect();
            for client in &mut auth.clients {
                client.secret_hash.clear();
            }
        }
        copy.sync.pubsub.redis.password.clear();
        for spec in copy
            .client
            .user_profile_services
            .values_mut()
            .chain(copy.client.odp_caches.values_mut())
        {
            spec.auth_token = None;
            spec.redis_secret = None;
            spec.password = None;
        }
        copy
    }
}

fn env_port(var: &str) -> Option<u16> {
    env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_strings_and_integers() {
        assert_eq!(parse_duration_str("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration_str("5m"), Some(Duration::from_secs(300)));
        assert_eq!(
            parse_duration_str("250ms"),
            Some(Duration::from_millis(250))
        );
        // Bare integers are nanoseconds.
        assert_eq!(
            parse_duration_str("1000000000"),
            Some(Duration::from_secs(1))
        );
        assert_eq!(parse_duration_str("not-a-duration"), None);
    }

    #[test]
    fn yaml_round_trip_with_durations() {
        let yaml = r#"
api:
  port: 9090
  operationsLimit: 5
client:
  pollingInterval: 1m
  flushInterval: 30s
  batchSize: 3
webhook:
  projects:
    42:
      sdkKeys: ["myDatafile"]
      secret: "I am secret"
"#;
        let cfg = AgentConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.api.port, 9090);
        assert_eq!(cfg.api.operations_limit, 5);
        assert_eq!(
            cfg.client.polling_interval.as_duration(),
            Duration::from_secs(60)
        );
        assert_eq!(cfg.client.batch_size, 3);
        let project = cfg.webhook.projects.get(&42).unwrap();
        assert_eq!(project.sdk_keys, vec!["myDatafile"]);
        assert_eq!(project.secret, "I am secret");
        assert!(!project.skip_signature_check);
    }

    #[test]
    fn redaction_zeroes_secrets() {
        let yaml = r#"
api:
  auth:
    hmacSecrets: ["topsecret"]
    clients:
      - id: optly_user
        secretHash: "aGFzaA=="
webhook:
  projects:
    1:
      sdkKeys: ["k"]
      secret: "hunter2"
sync:
  pubsub:
    redis:
      host: "localhost:6379"
      password: "redispw"
"#;
        let cfg = AgentConfig::from_yaml(yaml).unwrap();
        let redacted = cfg.redacted();
        assert_eq!(redacted.webhook.projects.get(&1).unwrap().secret, "");
        assert_eq!(redacted.api.auth.hmac_secrets, vec![String::new()]);
        assert_eq!(redacted.api.auth.clients[0].secret_hash, "");
        assert_eq!(redacted.sync.pubsub.redis.password, "");
        // Non-secret fields survive.
        assert_eq!(redacted.sync.pubsub.redis.host, "localhost:6379");
    }

    #[test]
    fn plugin_secret_resolution_order() {
        let spec = PluginSpec {
            kind: "redis".into(),
            auth_token: Some(String::new()),
            redis_secret: Some("from-redis-secret".into()),
            password: Some("from-password".into()),
            ..PluginSpec::default()
        };
        assert_eq!(spec.resolve_secret(), "from-redis-secret");

        let spec = PluginSpec {
            kind: "redis".into(),
            password: Some("pw".into()),
            ..PluginSpec::default()
        };
        assert_eq!(spec.resolve_secret(), "pw");

        let spec = PluginSpec {
            kind: "redis".into(),
            password_env: Some("FLAGRELAY_TEST_PLUGIN_SECRET".into()),
            ..PluginSpec::default()
        };
        std::env::set_var("FLAGRELAY_TEST_PLUGIN_SECRET", "from-env");
        assert_eq!(spec.resolve_secret(), "from-env");
        std::env::remove_var("FLAGRELAY_TEST_PLUGIN_SECRET");
    }
}
