//! Application of replicated DML batches: deletes by primary key, then
//! staged-merge upserts.
//!
//! One transaction spans the delete phase and every staged merge of a
//! message, so a message is applied atomically or not at all. Staging
//! tables are created `ON COMMIT DROP`, which also cleans them up on
//! rollback.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::{pin_mut, SinkExt};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::apply::value::{convert_value, SqlValue};
use crate::message::{parse_entries, Action, DmlEntry, DmlMessage};
use crate::postgres::{ColumnMeta, MetadataCache};
use crate::{Error, Result};

pub struct DmlApplier {
    client: Client,
    metadata: Arc<MetadataCache>,
}

impl DmlApplier {
    pub fn new(client: Client, metadata: Arc<MetadataCache>) -> Self {
        Self { client, metadata }
    }

    pub async fn apply(&mut self, body: &[u8]) -> Result<()> {
        let message: DmlMessage = serde_json::from_slice(body)?;
        let entries = parse_entries(&message.json_list)?;

        let mut deletes = Vec::new();
        let mut inserts = Vec::new();
        for entry in entries {
            match entry.action {
                Action::Delete => deletes.push(entry),
                Action::Insert => inserts.push(entry),
                Action::Other => debug!(batch_id = message.batch_id, "ignoring entry with unknown action"),
            }
        }

        let tx = self.client.transaction().await?;

        // All deletes run before any insert; an Insert for a key deleted in
        // the same message must survive.
        for (idx, entry) in deletes.iter().enumerate() {
            apply_delete(&tx, &self.metadata, entry, idx).await?;
        }

        // BTreeMap keeps table application order deterministic.
        let mut groups: BTreeMap<String, Vec<&DmlEntry>> = BTreeMap::new();
        for entry in &inserts {
            let table = entry.table_name().ok_or_else(|| Error::InvalidMessage {
                message: format!("batch {}: insert entry missing TableName", message.batch_id),
            })?;
            groups.entry(table.to_string()).or_default().push(entry);
        }

        for (table, rows) in &groups {
            stage_and_merge(&tx, &self.metadata, table, rows).await?;
        }

        tx.commit().await?;

        info!(
            batch_id = message.batch_id,
            deletes = deletes.len(),
            upserts = inserts.len(),
            "DML batch applied"
        );
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Builds the WHERE clause for one delete entry: equality over the
/// primary-key columns whose values are present, each parameter bound as
/// text with an explicit cast to the declared column type.
fn delete_predicate(
    columns: &[ColumnMeta],
    entry: &DmlEntry,
    idx: usize,
) -> Result<(String, Vec<String>)> {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    for column in columns.iter().filter(|c| c.is_primary_key) {
        let Some(raw) = entry.data.get(&column.name) else {
            continue;
        };
        match convert_value(raw, column, idx)? {
            SqlValue::Null => clauses.push(format!("{} IS NULL", quote_ident(&column.name))),
            value => {
                // to_text is Some for every non-null variant.
                if let Some(text) = value.to_text() {
                    params.push(text);
                    clauses.push(format!(
                        "{} = ${}::{}",
                        quote_ident(&column.name),
                        params.len(),
                        column.db_type
                    ));
                }
            }
        }
    }

    if clauses.is_empty() {
        let table = entry.table_name().unwrap_or("?").to_string();
        return Err(Error::MissingPrimaryKey { index: idx, table });
    }

    Ok((clauses.join(" AND "), params))
}

async fn apply_delete(
    tx: &Transaction<'_>,
    metadata: &MetadataCache,
    entry: &DmlEntry,
    idx: usize,
) -> Result<()> {
    let table = entry.table_name().ok_or_else(|| Error::InvalidMessage {
        message: format!("delete entry {idx} missing TableName"),
    })?;

    let columns = metadata.get(tx, table).await?;
    let (predicate, params) = delete_predicate(&columns, entry, idx)?;

    let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table), predicate);
    let bind: Vec<&(dyn ToSql + Sync)> =
        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
    let deleted = tx.execute(&sql, &bind).await?;
    debug!(table, index = idx, deleted, "delete entry applied");
    Ok(())
}

/// Column list used for loading and merging: everything except
/// identity/auto-increment columns, in metadata (name) order.
fn loadable<'a>(columns: &'a [ColumnMeta]) -> Vec<&'a ColumnMeta> {
    columns.iter().filter(|c| !c.is_auto_increment).collect()
}

/// Builds the MERGE statement from the staging table into the target:
/// matched rows update every non-key column, unmatched rows insert the full
/// loadable column set.
fn build_merge_sql(table: &str, staging: &str, columns: &[ColumnMeta]) -> Result<String> {
    let cols = loadable(columns);
    let keys: Vec<&&ColumnMeta> = cols.iter().filter(|c| c.is_primary_key).collect();
    if keys.is_empty() {
        return Err(Error::MissingPrimaryKey {
            index: 0,
            table: table.to_string(),
        });
    }

    let on = keys
        .iter()
        .map(|c| format!("t.{0} = s.{0}", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(" AND ");

    let updates = cols
        .iter()
        .filter(|c| !c.is_primary_key)
        .map(|c| format!("{0} = s.{0}", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");

    let insert_cols = cols
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_vals = cols
        .iter()
        .map(|c| format!("s.{}", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = if updates.is_empty() {
        // Every loadable column is part of the key; nothing to update.
        format!(
            "MERGE INTO {target} AS t USING {staging} AS s ON {on} \
             WHEN NOT MATCHED THEN INSERT ({insert_cols}) VALUES ({insert_vals})",
            target = quote_ident(table),
            staging = quote_ident(staging),
        )
    } else {
        format!(
            "MERGE INTO {target} AS t USING {staging} AS s ON {on} \
             WHEN MATCHED THEN UPDATE SET {updates} \
             WHEN NOT MATCHED THEN INSERT ({insert_cols}) VALUES ({insert_vals})",
            target = quote_ident(table),
            staging = quote_ident(staging),
        )
    };
    Ok(sql)
}

/// Upserts one table's rows: stage into a uniquely-named temp copy of the
/// target, bulk-load via COPY, then MERGE on the primary-key columns.
async fn stage_and_merge(
    tx: &Transaction<'_>,
    metadata: &MetadataCache,
    table: &str,
    entries: &[&DmlEntry],
) -> Result<()> {
    let columns = metadata.get(tx, table).await?;
    let cols = loadable(&columns);

    let staging = format!("{}_staging_{}", table, Uuid::new_v4().simple());
    tx.execute(
        &format!(
            "CREATE TEMP TABLE {} (LIKE {}) ON COMMIT DROP",
            quote_ident(&staging),
            quote_ident(table)
        ),
        &[],
    )
    .await?;

    let copy_sql = format!(
        "COPY {} ({}) FROM STDIN",
        quote_ident(&staging),
        cols.iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let sink = tx.copy_in::<_, Bytes>(&copy_sql).await?;
    pin_mut!(sink);

    let mut loaded = 0u64;
    for (row_idx, entry) in entries.iter().enumerate() {
        let mut fields = Vec::with_capacity(cols.len());
        let mut any_value = false;
        for column in &cols {
            // "TableName" is the routing discriminator, not a row value;
            // a real column of that name would be shadowed by it upstream.
            let value = match entry.data.get(&column.name) {
                Some(raw) if column.name != "TableName" => convert_value(raw, column, row_idx)?,
                _ => SqlValue::Null,
            };
            any_value |= !value.is_null();
            fields.push(value.to_copy_field());
        }
        if !any_value {
            warn!(table, row = row_idx, "skipping entry with no loadable values");
            continue;
        }
        let mut line = fields.join("\t");
        line.push('\n');
        sink.send(Bytes::from(line)).await.map_err(Error::Postgres)?;
        loaded += 1;
    }

    sink.finish().await.map_err(Error::Postgres)?;

    if loaded == 0 {
        debug!(table, "no loadable rows, skipping merge");
        return Ok(());
    }

    let merge_sql = build_merge_sql(table, &staging, &columns)?;
    tx.batch_execute(&merge_sql).await?;

    debug!(table, rows = loaded, "staged merge applied");
    Ok(())
}
