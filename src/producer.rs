//! The producer pipeline: drains the DDL and DML log tables into Kafka.
//!
//! Two independent loops run concurrently, one per log kind. Each iteration
//! fetches a batch of unprocessed rows, records the batch's serial range,
//! publishes one confirmed envelope, and flips the rows' received flag.
//! A fetch or publish error stops the loop and the process: silent data
//! loss is worse than a crash-and-restart. A mark failure after a confirmed
//! publish is the one accepted duplication source, so the delivery
//! guarantee is at-least-once with duplication bounded to whole batches.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, PipelineConfig};
use crate::kafka::BrokerGateway;
use crate::message::{DdlMessage, DmlMessage};
use crate::postgres::{self, LogKind, LogRow, LogStore};
use crate::{Error, Result};

/// Outcome of one non-empty iteration, for logging.
struct BatchOutcome {
    batch_id: i64,
    rows: usize,
    serial_from: i64,
    serial_to: i64,
    marked: u64,
}

/// Runs both producer loops until cancellation or the first fatal error.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let gateway = Arc::new(BrokerGateway::connect(&config.kafka).await?);

    let ddl_store = LogStore::new(postgres::connect(&config.source).await?);
    let dml_store = LogStore::new(postgres::connect(&config.source).await?);

    let ddl_task = spawn_loop(
        LogKind::Ddl,
        ddl_store,
        gateway.clone(),
        config.pipeline.clone(),
        cancel.clone(),
    );
    let dml_task = spawn_loop(
        LogKind::Dml,
        dml_store,
        gateway.clone(),
        config.pipeline.clone(),
        cancel.clone(),
    );

    let (ddl_result, dml_result) = tokio::join!(ddl_task, dml_task);
    for result in [ddl_result, dml_result] {
        match result {
            Ok(inner) => inner?,
            Err(join_err) => {
                error!(error = %join_err, "producer loop aborted");
                return Err(Error::Shutdown);
            }
        }
    }
    Ok(())
}

/// Spawns one loop; a fatal loop error cancels the token so the sibling
/// loop stops too instead of masking the failure.
fn spawn_loop(
    kind: LogKind,
    store: LogStore,
    gateway: Arc<BrokerGateway>,
    pipeline: PipelineConfig,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let result = run_loop(kind, store, gateway, pipeline, cancel.clone()).await;
        if result.is_err() {
            cancel.cancel();
        }
        result
    })
}

async fn run_loop(
    kind: LogKind,
    store: LogStore,
    gateway: Arc<BrokerGateway>,
    pipeline: PipelineConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let batch_size = match kind {
        LogKind::Ddl => pipeline.ddl_batch_size,
        LogKind::Dml => pipeline.dml_batch_size,
    };
    let deadline = Duration::from_secs(pipeline.process_timeout_secs);
    let poll_interval = Duration::from_millis(pipeline.poll_interval_ms);

    info!(kind = %kind, batch_size, "producer loop started");

    loop {
        if cancel.is_cancelled() {
            info!(kind = %kind, "producer loop received shutdown signal");
            return Ok(());
        }

        let outcome = tokio::time::timeout(
            deadline,
            process_batch(kind, &store, &gateway, batch_size, &cancel),
        )
        .await
        .map_err(|_| Error::Timeout {
            message: format!("{kind} batch exceeded {deadline:?}"),
        })??;

        match outcome {
            Some(batch) => {
                info!(
                    kind = %kind,
                    batch_id = batch.batch_id,
                    rows = batch.rows,
                    serial_from = batch.serial_from,
                    serial_to = batch.serial_to,
                    marked = batch.marked,
                    "batch published"
                );
            }
            None => {
                // Nothing pending; idle until the next poll or shutdown.
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(kind = %kind, "producer loop received shutdown signal");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
}

/// One pipeline iteration. Returns `None` when no rows were pending.
async fn process_batch(
    kind: LogKind,
    store: &LogStore,
    gateway: &BrokerGateway,
    batch_size: i64,
    cancel: &CancellationToken,
) -> Result<Option<BatchOutcome>> {
    let rows = store.fetch_unprocessed(kind, batch_size).await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let (serial_from, serial_to) = serial_range(&rows);
    let batch_id = store.insert_batch_record(kind, serial_from, serial_to).await?;

    let payload = build_envelope(kind, batch_id, &rows)?;
    gateway.publish(kind.routing_key(), &payload, cancel).await?;

    // The publish is confirmed; if marking fails the rows stay flagged
    // unprocessed and the next iteration re-publishes the whole batch.
    let marked = match store.mark_processed(kind, batch_id).await {
        Ok(marked) => marked,
        Err(e) => {
            error!(
                kind = %kind,
                batch_id,
                serial_from,
                serial_to,
                error = %e,
                "mark-processed failed after confirmed publish; batch will be republished"
            );
            0
        }
    };

    Ok(Some(BatchOutcome {
        batch_id,
        rows: rows.len(),
        serial_from,
        serial_to,
        marked,
    }))
}

/// Min/max of the fetched serial numbers. The fetch orders ascending, but
/// the range is computed over the whole set so reordering cannot corrupt
/// the batch record.
fn serial_range(rows: &[LogRow]) -> (i64, i64) {
    rows.iter().fold((i64::MAX, i64::MIN), |(min, max), row| {
        (min.min(row.serial_no), max.max(row.serial_no))
    })
}

fn build_envelope(kind: LogKind, batch_id: i64, rows: &[LogRow]) -> Result<Vec<u8>> {
    let payloads: Vec<String> = rows.iter().map(|r| r.payload.clone()).collect();
    let bytes = match kind {
        LogKind::Ddl => serde_json::to_vec(&DdlMessage {
            batch_id,
            xml_list: payloads,
        })?,
        LogKind::Dml => serde_json::to_vec(&DmlMessage {
            batch_id,
            json_list: payloads,
        })?,
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn row(serial_no: i64, payload: &str) -> LogRow {
        LogRow {
            serial_no,
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_serial_range_tolerates_reordering() {
        let rows = vec![row(103, "b"), row(101, "a"), row(102, "c")];
        assert_eq!(serial_range(&rows), (101, 103));

        let rows = vec![row(7, "only")];
        assert_eq!(serial_range(&rows), (7, 7));
    }

    #[test]
    fn test_serial_range_tolerates_gaps() {
        // Gaps inside the fetched set widen the range; marking is
        // range-based by design.
        let rows = vec![row(10, "a"), row(40, "b")];
        assert_eq!(serial_range(&rows), (10, 40));
    }

    #[test]
    fn test_ddl_envelope_wire_format() {
        let rows = vec![row(1, "<DDLData/>"), row(2, "<DDLData/>")];
        let bytes = build_envelope(LogKind::Ddl, 5, &rows).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["BatchID"], 5);
        assert_eq!(value["XMLList"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_dml_envelope_wire_format() {
        let rows = vec![row(9, r#"{"Action":"Insert","Data":{}}"#)];
        let bytes = build_envelope(LogKind::Dml, 6, &rows).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["BatchID"], 6);
        assert_eq!(value["JSONList"][0], r#"{"Action":"Insert","Data":{}}"#);
    }
}
