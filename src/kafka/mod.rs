pub mod gateway;
pub mod topology;

pub use gateway::BrokerGateway;
pub use topology::TopologyManager;

use crate::config::KafkaConfig;

/// Routing keys the primary topics are bound to. The key doubles as the
/// Kafka message key, so all messages of one kind stay ordered within a
/// partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingKey {
    Ddl,
    Dml,
}

impl RoutingKey {
    pub const ALL: [RoutingKey; 2] = [RoutingKey::Ddl, RoutingKey::Dml];

    pub fn as_str(self) -> &'static str {
        match self {
            RoutingKey::Ddl => "ddl",
            RoutingKey::Dml => "dml",
        }
    }

    /// Maps a consumed topic name back to its routing key.
    pub fn from_topic(topic: &str, config: &KafkaConfig) -> Option<RoutingKey> {
        RoutingKey::ALL
            .into_iter()
            .find(|key| config.topic_name(key.as_str()) == topic)
    }
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> KafkaConfig {
        KafkaConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic_prefix: "test".to_string(),
            group_id: "g".to_string(),
            compression: "none".to_string(),
            acks: "all".to_string(),
            partitions: 1,
            replication_factor: 1,
            confirm_timeout_ms: 1000,
            reconnect_delay_secs: 1,
            tls: None,
        }
    }

    #[test]
    fn test_routing_key_topic_round_trip() {
        let config = test_config();
        for key in RoutingKey::ALL {
            let topic = config.topic_name(key.as_str());
            assert_eq!(RoutingKey::from_topic(&topic, &config), Some(key));
        }
        assert_eq!(RoutingKey::from_topic("test.dead-letter", &config), None);
        assert_eq!(RoutingKey::from_topic("other.ddl", &config), None);
    }
}
