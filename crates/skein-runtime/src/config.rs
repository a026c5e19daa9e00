//! Engine configuration
//!
//! A structured configuration object handed to the runtime at startup,
//! loadable from a YAML file with `SKEIN_*` environment overrides for
//! the connection settings. Keys use kebab-case on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use skein_core::dsl::DslDuration;

/// Database backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseKind {
    Postgres,
    Mysql,
    InMemory,
}

/// Messaging backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessagingKind {
    Kafka,
    Rabbit,
    InMemory,
}

/// `database` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,

    /// Connection string for SQL backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::InMemory,
            url: None,
        }
    }
}

/// `messaging.consumer` / `messaging.producer` flags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelFlag {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ChannelFlag {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// Kafka connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KafkaConfig {
    pub brokers: String,

    #[serde(default = "default_group")]
    pub group_id: String,

    #[serde(default = "default_in_topic")]
    pub input_topic: String,

    #[serde(default = "default_out_topic")]
    pub output_topic: String,
}

fn default_group() -> String {
    "skein-engine".to_string()
}

fn default_in_topic() -> String {
    "skein-in".to_string()
}

fn default_out_topic() -> String {
    "skein-out".to_string()
}

/// `messaging` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MessagingConfig {
    #[serde(rename = "type")]
    pub kind: MessagingKind,

    #[serde(default)]
    pub consumer: ChannelFlag,

    #[serde(default)]
    pub producer: ChannelFlag,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kafka: Option<KafkaConfig>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            kind: MessagingKind::InMemory,
            consumer: ChannelFlag::default(),
            producer: ChannelFlag::default(),
            kafka: None,
        }
    }
}

/// `outbox` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutboxConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// How long sent rows are retained before the janitor removes them
    #[serde(default = "default_retention")]
    pub retention: DslDuration,

    /// Pause between processing passes
    #[serde(default = "default_poll")]
    pub poll_interval: DslDuration,
}

fn default_batch_size() -> u32 {
    100
}

fn default_retention() -> DslDuration {
    DslDuration::Iso("PT24H".to_string())
}

fn default_poll() -> DslDuration {
    DslDuration::Iso("PT0.5S".to_string())
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            retention: default_retention(),
            poll_interval: default_poll(),
        }
    }
}

/// `retry` section: outbox re-emit attempts, not workflow retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// The full engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub messaging: MessagingConfig,

    #[serde(default)]
    pub outbox: OutboxConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Secret values exposed to workflow expressions as `$secrets`;
    /// never serialized into messages or logs
    #[serde(default, skip_serializing)]
    pub secrets: Map<String, Value>,
}

/// Configuration failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File unreadable
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Not valid YAML or wrong shape
    #[error("malformed configuration: {0}")]
    Syntax(#[from] serde_yaml::Error),

    /// A recognized but unsupported backend was selected
    #[error("unsupported {section} backend {name:?}; supported: {supported}")]
    UnsupportedBackend {
        section: &'static str,
        name: &'static str,
        supported: &'static str,
    },

    /// A required setting is missing
    #[error("missing setting: {0}")]
    Missing(&'static str),
}

impl EngineConfig {
    /// Load from a YAML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&source)?;
        Ok(config)
    }

    /// Apply `SKEIN_DATABASE_URL` / `SKEIN_KAFKA_BROKERS` overrides
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("SKEIN_DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Ok(brokers) = std::env::var("SKEIN_KAFKA_BROKERS") {
            let kafka = self.messaging.kafka.get_or_insert(KafkaConfig {
                brokers: String::new(),
                group_id: default_group(),
                input_topic: default_in_topic(),
                output_topic: default_out_topic(),
            });
            kafka.brokers = brokers;
        }
        self
    }

    /// Reject configurations the engine cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.database.kind {
            DatabaseKind::Mysql => {
                return Err(ConfigError::UnsupportedBackend {
                    section: "database",
                    name: "mysql",
                    supported: "postgres, in-memory",
                })
            }
            DatabaseKind::Postgres => {
                if self.database.url.is_none() {
                    return Err(ConfigError::Missing("database.url"));
                }
            }
            DatabaseKind::InMemory => {}
        }
        match self.messaging.kind {
            MessagingKind::Rabbit => {
                return Err(ConfigError::UnsupportedBackend {
                    section: "messaging",
                    name: "rabbit",
                    supported: "kafka, in-memory",
                })
            }
            MessagingKind::Kafka => {
                if self.messaging.kafka.is_none() {
                    return Err(ConfigError::Missing("messaging.kafka.brokers"));
                }
            }
            MessagingKind::InMemory => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.database.kind, DatabaseKind::InMemory);
        assert_eq!(config.messaging.kind, MessagingKind::InMemory);
        assert!(config.messaging.consumer.enabled);
        assert!(config.messaging.producer.enabled);
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_kebab_case() {
        let yaml = r#"
database:
  type: postgres
  url: postgres://localhost/skein
messaging:
  type: in-memory
  consumer:
    enabled: false
outbox:
  batch-size: 25
  retention: PT1H
retry:
  max-attempts: 7
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.database.kind, DatabaseKind::Postgres);
        assert!(!config.messaging.consumer.enabled);
        assert!(config.messaging.producer.enabled);
        assert_eq!(config.outbox.batch_size, 25);
        assert_eq!(config.outbox.retention.to_millis().unwrap(), 3_600_000);
        assert_eq!(config.retry.max_attempts, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mysql_rejected() {
        let yaml = "database:\n  type: mysql\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedBackend { name: "mysql", .. })
        ));
    }

    #[test]
    fn test_rabbit_rejected() {
        let yaml = "messaging:\n  type: rabbit\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedBackend { name: "rabbit", .. })
        ));
    }

    #[test]
    fn test_postgres_requires_url() {
        let yaml = "database:\n  type: postgres\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("database.url"))
        ));
    }

    #[test]
    fn test_secrets_never_serialized() {
        let mut config = EngineConfig::default();
        config
            .secrets
            .insert("apiKey".to_string(), serde_json::json!("hunter2"));
        let out = serde_yaml::to_string(&config).unwrap();
        assert!(!out.contains("hunter2"));
    }
}
