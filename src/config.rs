use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub source: DatabaseConfig,
    pub target: DatabaseConfig,
    pub kafka: KafkaConfig,
    pub pipeline: PipelineConfig,
}

/// Connection settings for one PostgreSQL database (the log store on the
/// producer side, the target schema on the consumer side).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// Mutual-TLS material for the broker link. All three files must exist at
/// startup; a missing file aborts the process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub ca_cert_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_ddl_batch_size")]
    pub ddl_batch_size: i64,
    #[serde(default = "default_dml_batch_size")]
    pub dml_batch_size: i64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,
    #[serde(default = "default_consumer_workers")]
    pub consumer_workers: usize,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_RELAY")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Rejects settings that would make a pipeline silently inert.
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.is_empty() {
            return Err(Error::Config("kafka.brokers must not be empty".into()));
        }
        if self.pipeline.consumer_workers == 0 {
            return Err(Error::Config("pipeline.consumer_workers must be at least 1".into()));
        }
        if self.pipeline.ddl_batch_size < 1 || self.pipeline.dml_batch_size < 1 {
            return Err(Error::Config("pipeline batch sizes must be at least 1".into()));
        }
        if self.pipeline.process_timeout_secs == 0 {
            return Err(Error::Config("pipeline.process_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }
}

impl KafkaConfig {
    /// Topic carrying the given routing key, e.g. `bi.ddl`.
    pub fn topic_name(&self, routing_key: &str) -> String {
        format!("{}.{}", self.topic_prefix, routing_key)
    }

    /// Topic receiving rejected messages.
    pub fn dead_letter_topic(&self) -> String {
        format!("{}.dead-letter", self.topic_prefix)
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_topic_prefix() -> String {
    "bi".to_string()
}

fn default_group_id() -> String {
    "pg-relay".to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_partitions() -> i32 {
    1
}

fn default_replication_factor() -> i32 {
    1
}

fn default_confirm_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_ddl_batch_size() -> i64 {
    10_000
}

fn default_dml_batch_size() -> i64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_process_timeout_secs() -> u64 {
    30
}

fn default_consumer_workers() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> &'static str {
        r#"
[source]
host = "src.db.local"
port = 5432
database = "factory"
username = "relay"
password = "secret"

[target]
host = "tgt.db.local"
port = 5432
database = "reporting"
username = "relay"
password = "secret"

[kafka]
brokers = ["broker-1:9093"]

[pipeline]
"#
    }

    #[test]
    fn test_defaults_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(minimal_toml().as_bytes()).unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.pipeline.ddl_batch_size, 10_000);
        assert_eq!(cfg.pipeline.dml_batch_size, 1_000);
        assert_eq!(cfg.pipeline.consumer_workers, 4);
        assert_eq!(cfg.kafka.acks, "all");
        assert_eq!(cfg.kafka.reconnect_delay_secs, 5);
        assert!(cfg.kafka.tls.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_topic_names() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.kafka.topic_name("ddl"), "bi.ddl");
        assert_eq!(cfg.kafka.topic_name("dml"), "bi.dml");
        assert_eq!(cfg.kafka.dead_letter_topic(), "bi.dead-letter");
    }

    #[test]
    fn test_validate_rejects_empty_brokers() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, minimal_toml().replace("[\"broker-1:9093\"]", "[]")).unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert!(cfg.validate().is_err());
    }
}
