//! The consumer pipeline: a pool of workers draining the primary topics.
//!
//! Each worker owns its own `StreamConsumer` and target-database
//! connections, processes one message at a time with manual commits, and
//! dispatches by topic to the DDL or DML applier. A handler failure routes
//! the message to the dead-letter topic (confirmed) before the offset is
//! committed; a stream failure enters a fixed-backoff reconnect loop.
//!
//! Worker lifecycle: Starting -> Consuming <-> Reconnecting -> Stopped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::apply::{DdlApplier, DmlApplier};
use crate::config::{Config, KafkaConfig};
use crate::kafka::{gateway::client_config, BrokerGateway, RoutingKey};
use crate::postgres::{self, MetadataCache};
use crate::{Error, Result};

/// Builds the worker pool and runs it until cancellation. Dedup and
/// metadata caches are shared across workers; database connections are
/// per-worker so each can run its own transactions.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let gateway = Arc::new(BrokerGateway::connect(&config.kafka).await?);
    let metadata = Arc::new(MetadataCache::new());
    let executed_ddl = Arc::new(RwLock::new(HashSet::new()));

    let mut handles = Vec::with_capacity(config.pipeline.consumer_workers);
    for worker_id in 0..config.pipeline.consumer_workers {
        let ddl_client = postgres::connect(&config.target).await?;
        let dml_client = postgres::connect(&config.target).await?;

        let worker = Worker {
            id: worker_id,
            kafka: config.kafka.clone(),
            gateway: gateway.clone(),
            ddl: DdlApplier::new(ddl_client, executed_ddl.clone()).await?,
            dml: DmlApplier::new(dml_client, metadata.clone()),
            cancel: cancel.clone(),
        };
        handles.push(tokio::spawn(worker.run()));
        info!(worker = worker_id, "consumer worker started");
    }

    info!(
        workers = config.pipeline.consumer_workers,
        "all consumer workers started, waiting for messages"
    );

    // Graceful shutdown: every worker finishes its in-flight handler
    // before returning.
    let mut first_error = None;
    for (worker_id, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(Ok(())) => info!(worker = worker_id, "consumer worker finished"),
            Ok(Err(e)) => {
                error!(worker = worker_id, error = %e, "consumer worker failed");
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                error!(worker = worker_id, error = %join_err, "consumer worker aborted");
                first_error.get_or_insert(Error::Shutdown);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct Worker {
    id: usize,
    kafka: KafkaConfig,
    gateway: Arc<BrokerGateway>,
    ddl: DdlApplier,
    dml: DmlApplier,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) -> Result<()> {
        loop {
            let consumer = match self.connect_consumer() {
                Ok(consumer) => consumer,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "consumer connect failed");
                    if self.backoff().await {
                        return Ok(());
                    }
                    continue;
                }
            };

            info!(worker = self.id, "consuming");
            match self.consume(&consumer).await {
                // Cancellation is the only clean way out of the stream.
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(worker = self.id, error = %e, "delivery stream failed, reconnecting");
                    if self.backoff().await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sleeps the reconnect delay; returns true when shutdown was requested
    /// during the wait.
    async fn backoff(&self) -> bool {
        let delay = Duration::from_secs(self.kafka.reconnect_delay_secs);
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    fn connect_consumer(&self) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = client_config(&self.kafka)
            .set("group.id", &self.kafka.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(Error::Kafka)?;

        let topics: Vec<String> = RoutingKey::ALL
            .iter()
            .map(|key| self.kafka.topic_name(key.as_str()))
            .collect();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs).map_err(Error::Kafka)?;

        Ok(consumer)
    }

    async fn consume(&mut self, consumer: &StreamConsumer) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(worker = self.id, "consumer received shutdown signal");
                    return Ok(());
                }
                message = consumer.recv() => {
                    let message = message?;
                    self.handle(consumer, &message).await?;
                }
            }
        }
    }

    async fn handle(&mut self, consumer: &StreamConsumer, message: &BorrowedMessage<'_>) -> Result<()> {
        let topic = message.topic().to_string();
        let body = message.payload().unwrap_or_default().to_vec();

        let outcome = match RoutingKey::from_topic(&topic, &self.kafka) {
            Some(RoutingKey::Ddl) => self.ddl.apply(&body).await,
            Some(RoutingKey::Dml) => self.dml.apply(&body).await,
            None => Err(Error::InvalidMessage {
                message: format!("message from unexpected topic {topic}"),
            }),
        };

        match outcome {
            Ok(()) => {
                consumer.commit_message(message, CommitMode::Sync)?;
            }
            Err(e) => {
                warn!(
                    worker = self.id,
                    topic,
                    error = %e,
                    "handler failed, routing message to dead-letter topic"
                );
                // The dead-letter publish must be confirmed before the
                // offset commit; a failure here leaves the message
                // uncommitted so it redelivers instead of vanishing.
                let key = RoutingKey::from_topic(&topic, &self.kafka)
                    .map(RoutingKey::as_str)
                    .unwrap_or("unknown");
                self.gateway
                    .publish_dead_letter(key, &body, &self.cancel)
                    .await?;
                consumer.commit_message(message, CommitMode::Sync)?;
            }
        }

        Ok(())
    }
}
