//! The broker gateway: one producer link, publish-with-confirm, and
//! single-flight rebuild of the link and topology after a failure.

use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use rdkafka::util::Timeout;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::KafkaConfig;
use crate::kafka::{RoutingKey, TopologyManager};
use crate::{Error, Result};

enum Link {
    Connected(FutureProducer),
    Down,
}

/// Owns the producer side of the broker connection.
///
/// `publish` blocks until the broker confirms the message (delivery
/// report), rejects it, the confirm timeout elapses, or the caller is
/// cancelled. A failed link is rebuilt lazily on the next publish; the
/// mutex collapses concurrent rebuild attempts into one, and every rebuild
/// re-runs the idempotent topology declaration.
pub struct BrokerGateway {
    config: KafkaConfig,
    link: Mutex<Link>,
}

impl BrokerGateway {
    /// Validates TLS material, declares the topology, and opens the
    /// producer link. Any failure here aborts startup.
    pub async fn connect(config: &KafkaConfig) -> Result<Self> {
        validate_tls(config)?;
        TopologyManager::new(config)?.ensure_all().await?;
        let producer = build_producer(config)?;
        info!(brokers = ?config.brokers, "Connected to Kafka");

        Ok(Self {
            config: config.clone(),
            link: Mutex::new(Link::Connected(producer)),
        })
    }

    /// Publishes to the primary topic for `key` and waits for the confirm.
    pub async fn publish(
        &self,
        key: RoutingKey,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let topic = self.config.topic_name(key.as_str());
        self.send(&topic, key.as_str(), payload, cancel).await
    }

    /// Publishes a rejected message to the dead-letter topic, keyed by the
    /// routing key it originally carried.
    pub async fn publish_dead_letter(
        &self,
        key: &str,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let topic = self.config.dead_letter_topic();
        self.send(&topic, key, payload, cancel).await
    }

    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let producer = self.producer().await?;
        let confirm_timeout = Duration::from_millis(self.config.confirm_timeout_ms);
        let record = FutureRecord::to(topic).key(key).payload(payload);

        tokio::select! {
            delivery = producer.send(record, Timeout::After(confirm_timeout)) => {
                match delivery {
                    Ok(_) => Ok(()),
                    Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), _)) => {
                        Err(Error::Timeout {
                            message: format!(
                                "publish confirm timed out after {confirm_timeout:?} (topic {topic})"
                            ),
                        })
                    }
                    Err((e, _)) => {
                        warn!(topic, error = %e, "publish rejected, marking link down");
                        self.mark_down().await;
                        Err(Error::Kafka(e))
                    }
                }
            }
            _ = cancel.cancelled() => Err(Error::Shutdown),
        }
    }

    async fn producer(&self) -> Result<FutureProducer> {
        let mut link = self.link.lock().await;
        match &*link {
            Link::Connected(producer) => Ok(producer.clone()),
            Link::Down => {
                info!("Rebuilding Kafka producer link");
                TopologyManager::new(&self.config)?.ensure_all().await?;
                let producer = build_producer(&self.config)?;
                *link = Link::Connected(producer.clone());
                Ok(producer)
            }
        }
    }

    async fn mark_down(&self) {
        *self.link.lock().await = Link::Down;
    }
}

/// Base client settings shared by the producer, the consumers, and the
/// admin client, including the mutual-TLS material when configured.
pub(crate) fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", config.brokers.join(","));

    if let Some(tls) = &config.tls {
        client
            .set("security.protocol", "ssl")
            .set("ssl.ca.location", tls.ca_cert_file.display().to_string())
            .set("ssl.certificate.location", tls.cert_file.display().to_string())
            .set("ssl.key.location", tls.key_file.display().to_string());
    }

    client
}

fn build_producer(config: &KafkaConfig) -> Result<FutureProducer> {
    client_config(config)
        .set("acks", &config.acks)
        .set("compression.type", &config.compression)
        .set("message.timeout.ms", config.confirm_timeout_ms.to_string())
        .create()
        .map_err(Error::Kafka)
}

fn validate_tls(config: &KafkaConfig) -> Result<()> {
    let Some(tls) = &config.tls else {
        return Ok(());
    };
    for path in [&tls.ca_cert_file, &tls.cert_file, &tls.key_file] {
        if !path.exists() {
            return Err(Error::Authentication(format!(
                "TLS material missing: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use std::path::PathBuf;

    fn test_config() -> KafkaConfig {
        KafkaConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic_prefix: "test".to_string(),
            group_id: "g".to_string(),
            compression: "none".to_string(),
            acks: "1".to_string(),
            partitions: 1,
            replication_factor: 1,
            confirm_timeout_ms: 1000,
            reconnect_delay_secs: 1,
            tls: None,
        }
    }

    #[test]
    fn test_validate_tls_rejects_missing_files() {
        let mut config = test_config();
        config.tls = Some(TlsConfig {
            ca_cert_file: PathBuf::from("/nonexistent/ca.pem"),
            cert_file: PathBuf::from("/nonexistent/client.pem"),
            key_file: PathBuf::from("/nonexistent/client.key"),
        });
        assert!(matches!(
            validate_tls(&config),
            Err(Error::Authentication(_))
        ));
    }

    #[test]
    fn test_validate_tls_accepts_absent_section() {
        assert!(validate_tls(&test_config()).is_ok());
    }
}
