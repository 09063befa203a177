use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::KafkaConfig;
use crate::kafka::gateway::client_config;
use crate::kafka::RoutingKey;
use crate::{Error, Result};

/// Declares the fixed topic topology: one primary topic per routing key
/// plus the dead-letter topic. Declaration is create-if-not-exists and safe
/// to repeat on every reconnect.
pub struct TopologyManager {
    admin_client: AdminClient<DefaultClientContext>,
    config: KafkaConfig,
}

impl TopologyManager {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let admin_client: AdminClient<_> = client_config(config).create().map_err(Error::Kafka)?;

        Ok(Self {
            admin_client,
            config: config.clone(),
        })
    }

    pub async fn ensure_all(&self) -> Result<()> {
        for key in RoutingKey::ALL {
            self.ensure_topic(&self.config.topic_name(key.as_str())).await?;
        }
        self.ensure_topic(&self.config.dead_letter_topic()).await
    }

    #[instrument(skip(self), fields(topic = %topic_name))]
    async fn ensure_topic(&self, topic_name: &str) -> Result<()> {
        match self.topic_exists(topic_name) {
            Ok(true) => {
                debug!("Topic '{}' already exists", topic_name);
                Ok(())
            }
            Ok(false) => {
                info!("Creating topic '{}'", topic_name);
                self.create_topic(topic_name).await
            }
            Err(e) => {
                warn!("Failed to check if topic '{}' exists: {}", topic_name, e);
                Err(e)
            }
        }
    }

    fn topic_exists(&self, topic_name: &str) -> Result<bool> {
        let metadata = self
            .admin_client
            .inner()
            .fetch_metadata(Some(topic_name), Duration::from_secs(5))
            .map_err(Error::Kafka)?;

        Ok(metadata
            .topics()
            .iter()
            .any(|topic| topic.name() == topic_name && topic.error().is_none()))
    }

    async fn create_topic(&self, topic_name: &str) -> Result<()> {
        let new_topic = NewTopic::new(
            topic_name,
            self.config.partitions,
            TopicReplication::Fixed(self.config.replication_factor),
        )
        .set("cleanup.policy", "delete")
        .set("retention.ms", "604800000"); // 7 days

        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));

        let results = self
            .admin_client
            .create_topics(&[new_topic], &opts)
            .await
            .map_err(Error::Kafka)?;

        for result in results {
            match result {
                Ok(topic) => {
                    info!("Successfully created topic: {}", topic);
                }
                // A concurrent declare (other pipeline, other worker) may
                // have won the race; that still satisfies the declaration.
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("Topic '{}' created concurrently", topic);
                }
                Err((_topic, error)) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::AdminOp(error)));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires running Kafka
    async fn test_topology_declaration_is_idempotent() {
        let config = KafkaConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic_prefix: "topology-test".to_string(),
            group_id: "g".to_string(),
            compression: "none".to_string(),
            acks: "1".to_string(),
            partitions: 1,
            replication_factor: 1,
            confirm_timeout_ms: 1000,
            reconnect_delay_secs: 1,
            tls: None,
        };

        let manager = TopologyManager::new(&config).unwrap();
        manager.ensure_all().await.unwrap();
        // Redeclaring must be a no-op, not an error.
        manager.ensure_all().await.unwrap();
    }
}
