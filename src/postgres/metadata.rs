//! Target-table column metadata with a lazy, never-invalidated cache.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_postgres::GenericClient;
use tracing::debug;

use crate::Result;

/// Shape of one target-table column as the appliers need it.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    /// Declared type as rendered by `format_type`, e.g. `bigint` or
    /// `character varying(50)`. Usable verbatim in a cast expression.
    pub db_type: String,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
}

const COLUMNS_SQL: &str = "\
SELECT a.attname::text AS name,
       pg_catalog.format_type(a.atttypid, a.atttypmod) AS db_type,
       COALESCE(ix.indisprimary, FALSE) AS is_primary_key,
       (a.attidentity <> ''
        OR pg_catalog.pg_get_serial_sequence(a.attrelid::regclass::text, a.attname) IS NOT NULL)
           AS is_auto_increment
FROM pg_catalog.pg_attribute a
LEFT JOIN pg_catalog.pg_index ix
       ON ix.indrelid = a.attrelid
      AND ix.indisprimary
      AND a.attnum = ANY(ix.indkey)
WHERE a.attrelid = $1::text::regclass
  AND a.attnum > 0
  AND NOT a.attisdropped
ORDER BY a.attname";

/// Per-table column metadata, populated on first use and shared by every
/// consumer worker. Entries are never evicted: a schema change mid-run
/// requires a process restart to pick up new metadata.
#[derive(Default)]
pub struct MetadataCache {
    tables: RwLock<HashMap<String, Arc<Vec<ColumnMeta>>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the column metadata for `table`, loading it on first access.
    /// Columns are ordered by name, which fixes the column order used for
    /// staging and merge.
    pub async fn get<C>(&self, client: &C, table: &str) -> Result<Arc<Vec<ColumnMeta>>>
    where
        C: GenericClient + Sync,
    {
        if let Some(columns) = self.tables.read().await.get(table) {
            return Ok(columns.clone());
        }

        let rows = client.query(COLUMNS_SQL, &[&table]).await?;
        let columns: Arc<Vec<ColumnMeta>> = Arc::new(
            rows.iter()
                .map(|r| ColumnMeta {
                    name: r.get(0),
                    db_type: r.get(1),
                    is_primary_key: r.get(2),
                    is_auto_increment: r.get(3),
                })
                .collect(),
        );
        debug!(table, columns = columns.len(), "loaded column metadata");

        self.tables
            .write()
            .await
            .insert(table.to_string(), columns.clone());
        Ok(columns)
    }
}
