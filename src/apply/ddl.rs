//! Idempotent application of replicated DDL statements.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio_postgres::Client;
use tracing::{debug, error, info};

use crate::message::{DdlEvent, DdlMessage};
use crate::{Error, Result};

const ENSURE_LEDGER_SQL: &str = "\
CREATE TABLE IF NOT EXISTS executed_ddl (
    sql_hash   TEXT PRIMARY KEY,
    sql_text   TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

/// Applies DDL envelopes against the target schema exactly once per distinct
/// statement.
///
/// Dedup state lives in two places: the `executed_ddl` table survives
/// restarts, and an in-memory hash set (shared across workers) avoids a
/// round trip for statements already seen this run. A statement hash is only
/// recorded after the statement executed successfully, so a failed execution
/// stays retryable on a later delivery.
pub struct DdlApplier {
    client: Client,
    executed: Arc<RwLock<HashSet<String>>>,
}

impl DdlApplier {
    /// Creates the applier and makes sure the dedup ledger table exists.
    pub async fn new(client: Client, executed: Arc<RwLock<HashSet<String>>>) -> Result<Self> {
        client.batch_execute(ENSURE_LEDGER_SQL).await?;
        Ok(Self { client, executed })
    }

    pub async fn apply(&mut self, body: &[u8]) -> Result<()> {
        let message: DdlMessage = serde_json::from_slice(body)?;

        for xml in &message.xml_list {
            let event = DdlEvent::from_xml(xml)?;
            let sql_text = event.command_text().trim();
            if sql_text.is_empty() {
                return Err(Error::InvalidMessage {
                    message: format!("batch {}: DDL event carries no command text", message.batch_id),
                });
            }

            let normalized = normalize_statement(sql_text);
            let hash = statement_hash(&normalized);

            if self.already_executed(&hash).await? {
                debug!(batch_id = message.batch_id, hash = %hash, "DDL already executed, skipping");
                continue;
            }

            // Execute the original text; normalization is only for hashing.
            if let Err(e) = self.client.batch_execute(sql_text).await {
                error!(
                    batch_id = message.batch_id,
                    sql = sql_text,
                    error = %e,
                    "DDL execution failed"
                );
                return Err(Error::Postgres(e));
            }

            // ON CONFLICT keeps a concurrent worker that raced us from
            // failing the whole message over the ledger insert.
            self.client
                .execute(
                    "INSERT INTO executed_ddl (sql_hash, sql_text) VALUES ($1, $2) \
                     ON CONFLICT (sql_hash) DO NOTHING",
                    &[&hash, &normalized],
                )
                .await?;
            self.executed.write().await.insert(hash);

            info!(batch_id = message.batch_id, "DDL applied");
        }

        Ok(())
    }

    async fn already_executed(&self, hash: &str) -> Result<bool> {
        if self.executed.read().await.contains(hash) {
            return Ok(true);
        }

        let row = self
            .client
            .query_one(
                "SELECT COUNT(*) FROM executed_ddl WHERE sql_hash = $1",
                &[&hash],
            )
            .await?;
        let count: i64 = row.get(0);
        if count > 0 {
            self.executed.write().await.insert(hash.to_string());
            return Ok(true);
        }
        Ok(false)
    }
}

/// Collapses whitespace runs to single spaces and upper-cases, so textually
/// different renditions of the same statement hash identically.
pub fn normalize_statement(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// SHA-256 of the normalized statement, hex-encoded.
pub fn statement_hash(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        let a = normalize_statement("alter table t\n  alter column c varchar(50)   not null");
        let b = normalize_statement("ALTER TABLE T ALTER COLUMN C VARCHAR(50) NOT NULL");
        assert_eq!(a, b);
        assert_eq!(a, "ALTER TABLE T ALTER COLUMN C VARCHAR(50) NOT NULL");
    }

    #[test]
    fn test_statement_hash_distinguishes_statements() {
        let h1 = statement_hash(&normalize_statement("ALTER TABLE t ADD x int"));
        let h2 = statement_hash(&normalize_statement("ALTER TABLE t ADD y int"));
        let h3 = statement_hash(&normalize_statement("alter  table t add X INT"));
        assert_ne!(h1, h2);
        assert_eq!(h1, h3);
        assert_eq!(h1.len(), 64);
    }
}
