//! Access to the source-side log tables and batch bookkeeping records.

use std::fmt;

use tokio_postgres::Client;
use tracing::debug;

use crate::kafka::RoutingKey;
use crate::Result;

/// Which append-only log a producer loop drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Ddl,
    Dml,
}

impl LogKind {
    pub fn log_table(self) -> &'static str {
        match self {
            LogKind::Ddl => "ddl_log",
            LogKind::Dml => "dml_log",
        }
    }

    pub fn batch_table(self) -> &'static str {
        match self {
            LogKind::Ddl => "log_batch_ddl_record",
            LogKind::Dml => "log_batch_dml_record",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::Ddl => "ddl",
            LogKind::Dml => "dml",
        }
    }

    pub fn routing_key(self) -> RoutingKey {
        match self {
            LogKind::Ddl => RoutingKey::Ddl,
            LogKind::Dml => RoutingKey::Dml,
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unprocessed log row. `payload` is XML for DDL, JSON for DML.
#[derive(Debug, Clone)]
pub struct LogRow {
    pub serial_no: i64,
    pub payload: String,
}

/// Source-database facade used by the producer pipeline. Log rows are only
/// ever flag-flipped, never deleted.
pub struct LogStore {
    client: Client,
}

impl LogStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetches up to `limit` unprocessed rows ordered by serial number.
    pub async fn fetch_unprocessed(&self, kind: LogKind, limit: i64) -> Result<Vec<LogRow>> {
        let sql = format!(
            "SELECT serial_no, payload FROM {} WHERE NOT received ORDER BY serial_no LIMIT $1",
            kind.log_table()
        );
        let rows = self.client.query(&sql, &[&limit]).await?;
        Ok(rows
            .iter()
            .map(|r| LogRow {
                serial_no: r.get(0),
                payload: r.get(1),
            })
            .collect())
    }

    /// Persists a batch record covering `[from, to]` and returns its
    /// generated id. `process_time` is server-assigned and never supplied.
    pub async fn insert_batch_record(&self, kind: LogKind, from: i64, to: i64) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (serial_no_from, serial_no_to) VALUES ($1, $2) RETURNING id",
            kind.batch_table()
        );
        let row = self.client.query_one(&sql, &[&from, &to]).await?;
        Ok(row.get(0))
    }

    /// Marks every still-unprocessed row inside the batch's serial range as
    /// received, in one update. Returns the number of rows flipped.
    ///
    /// Marking is range-based, not id-list-based: rows appended into a gap
    /// of an in-flight range would be flipped without ever being published.
    /// Serial numbers are assigned monotonically, so this only matters if
    /// the source backfills gaps.
    pub async fn mark_processed(&self, kind: LogKind, batch_id: i64) -> Result<u64> {
        let sql = format!(
            "SELECT serial_no_from, serial_no_to FROM {} WHERE id = $1",
            kind.batch_table()
        );
        let record = self.client.query_one(&sql, &[&batch_id]).await?;
        let from: i64 = record.get(0);
        let to: i64 = record.get(1);

        let sql = format!(
            "UPDATE {} SET received = TRUE WHERE serial_no BETWEEN $1 AND $2 AND NOT received",
            kind.log_table()
        );
        let marked = self.client.execute(&sql, &[&from, &to]).await?;
        debug!(kind = %kind, batch_id, from, to, marked, "marked batch processed");
        Ok(marked)
    }
}
