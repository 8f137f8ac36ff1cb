//! Mempool staging operations.
//!
//! Processors never touch canonical state directly. They append
//! provenance-tagged writes here and the merge engine folds them in.

use super::{now_unix, MempoolEntry, StageOperation, Storage};
use anyhow::{anyhow, bail, Context, Result};
use spinsync_core::{validate_fields, EntityRecord, FieldSet, Provenance, Table};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

impl Storage {
    /// Stage a whole entity. Creates the entity's register when folded.
    pub async fn stage_insert(
        &self,
        table: Table,
        record: &EntityRecord,
        provenance: &Provenance,
    ) -> Result<()> {
        self.stage(
            table,
            &record.id,
            StageOperation::Insert,
            &record.fields,
            provenance,
        )
        .await
    }

    /// Stage new values for an existing entity.
    ///
    /// The write stays pending until an insert for the same entity has been
    /// folded.
    pub async fn stage_update(
        &self,
        table: Table,
        entity_id: &str,
        fields: &FieldSet,
        provenance: &Provenance,
    ) -> Result<()> {
        self.stage(table, entity_id, StageOperation::Update, fields, provenance)
            .await
    }

    async fn stage(
        &self,
        table: Table,
        entity_id: &str,
        operation: StageOperation,
        fields: &FieldSet,
        provenance: &Provenance,
    ) -> Result<()> {
        if entity_id.is_empty() {
            bail!("Cannot stage a write with an empty entity id");
        }
        validate_fields(fields)
            .with_context(|| format!("Rejected staged write for {}/{}", table, entity_id))?;

        let fields_json = serde_json::to_string(fields)?;

        sqlx::query(
            r#"
            INSERT INTO mempool (
                table_name, entity_id, operation, fields_json,
                ordinal, source, staged_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(table.as_str())
        .bind(entity_id)
        .bind(operation.as_str())
        .bind(fields_json)
        .bind(provenance.ordinal as i64)
        .bind(&provenance.source)
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to stage write for {}/{}", table, entity_id))?;

        Ok(())
    }

    /// Number of staged, non-quarantined writes for a table.
    pub async fn pending_count(&self, table: Table) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM mempool WHERE table_name = ? AND quarantined = 0",
        )
        .bind(table.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count pending writes")?;

        Ok(count as u64)
    }

    /// Entities of a table with staged, non-quarantined writes.
    pub async fn pending_entities(&self, table: Table) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT entity_id
            FROM mempool
            WHERE table_name = ? AND quarantined = 0
            GROUP BY entity_id
            ORDER BY MIN(id)
            "#,
        )
        .bind(table.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pending entities")?;

        Ok(ids)
    }

    /// Hold back every staged write of an entity from future drains.
    pub async fn quarantine_entity(&self, table: Table, entity_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE mempool SET quarantined = 1 WHERE table_name = ? AND entity_id = ?",
        )
        .bind(table.as_str())
        .bind(entity_id)
        .execute(&self.pool)
        .await
        .context("Failed to quarantine staged writes")?;

        Ok(result.rows_affected())
    }

    fn row_to_mempool_entry(row: SqliteRow) -> Result<MempoolEntry> {
        let table: String = row.get("table_name");
        let operation: String = row.get("operation");
        let fields_json: String = row.get("fields_json");

        Ok(MempoolEntry {
            id: row.get("id"),
            table: table.parse()?,
            entity_id: row.get("entity_id"),
            operation: operation.parse().map_err(|e: String| anyhow!(e))?,
            fields: serde_json::from_str(&fields_json)
                .context("Failed to decode staged fields")?,
            provenance: Provenance::new(
                row.get::<i64, _>("ordinal") as u64,
                row.get::<String, _>("source"),
            ),
            staged_at: row.get("staged_at"),
        })
    }
}

/// Staged, non-quarantined writes of one entity in staging order.
pub(crate) async fn entity_entries(
    conn: &mut SqliteConnection,
    table: Table,
    entity_id: &str,
) -> Result<Vec<MempoolEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT id, table_name, entity_id, operation, fields_json, ordinal, source, staged_at
        FROM mempool
        WHERE table_name = ? AND entity_id = ? AND quarantined = 0
        ORDER BY id
        "#,
    )
    .bind(table.as_str())
    .bind(entity_id)
    .fetch_all(&mut *conn)
    .await
    .context("Failed to fetch staged writes")?;

    rows.into_iter().map(Storage::row_to_mempool_entry).collect()
}

/// Remove consumed writes.
pub(crate) async fn delete_entries(conn: &mut SqliteConnection, ids: &[i64]) -> Result<()> {
    for id in ids {
        sqlx::query("DELETE FROM mempool WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .context("Failed to delete consumed write")?;
    }
    Ok(())
}

/// Return quarantined writes of an entity to the drain.
pub(crate) async fn release_entity(
    conn: &mut SqliteConnection,
    table: Table,
    entity_id: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE mempool SET quarantined = 0 WHERE table_name = ? AND entity_id = ? AND quarantined = 1",
    )
    .bind(table.as_str())
    .bind(entity_id)
    .execute(&mut *conn)
    .await
    .context("Failed to release quarantined writes")?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::setup_storage;
    use serde_json::json;

    #[tokio::test]
    async fn test_stage_and_fetch() {
        let (storage, _temp_db) = setup_storage().await;

        let record = EntityRecord::new("ethereum/0xabc/1").with("owner", "0x01");
        storage
            .stage_insert(Table::Nfts, &record, &Provenance::new(10, "transfers"))
            .await
            .unwrap();

        let mut update = FieldSet::new();
        update.insert("owner".into(), json!("0x02"));
        storage
            .stage_update(
                Table::Nfts,
                "ethereum/0xabc/1",
                &update,
                &Provenance::new(11, "transfers"),
            )
            .await
            .unwrap();

        assert_eq!(storage.pending_count(Table::Nfts).await.unwrap(), 2);
        assert_eq!(storage.pending_count(Table::Artists).await.unwrap(), 0);
        assert_eq!(
            storage.pending_entities(Table::Nfts).await.unwrap(),
            vec!["ethereum/0xabc/1".to_string()]
        );

        let mut conn = storage.pool().acquire().await.unwrap();
        let entries = entity_entries(&mut conn, Table::Nfts, "ethereum/0xabc/1")
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, StageOperation::Insert);
        assert_eq!(entries[1].operation, StageOperation::Update);
        assert_eq!(entries[1].provenance.ordinal, 11);
        assert_eq!(entries[1].fields["owner"], json!("0x02"));
    }

    #[tokio::test]
    async fn test_stage_rejects_bad_input() {
        let (storage, _temp_db) = setup_storage().await;
        let provenance = Provenance::new(1, "test");

        let bad_field = EntityRecord::new("ethereum/0xabc").with("bad field", 1);
        assert!(storage
            .stage_insert(Table::Artists, &bad_field, &provenance)
            .await
            .is_err());

        let empty_id = EntityRecord::new("").with("name", "x");
        assert!(storage
            .stage_insert(Table::Artists, &empty_id, &provenance)
            .await
            .is_err());

        assert_eq!(storage.pending_count(Table::Artists).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quarantine_and_release() {
        let (storage, _temp_db) = setup_storage().await;

        let record = EntityRecord::new("ethereum/0xabc").with("name", "a");
        storage
            .stage_insert(Table::Artists, &record, &Provenance::new(1, "seeds"))
            .await
            .unwrap();

        assert_eq!(
            storage
                .quarantine_entity(Table::Artists, "ethereum/0xabc")
                .await
                .unwrap(),
            1
        );
        assert_eq!(storage.pending_count(Table::Artists).await.unwrap(), 0);
        assert!(storage
            .pending_entities(Table::Artists)
            .await
            .unwrap()
            .is_empty());

        let mut conn = storage.pool().acquire().await.unwrap();
        assert_eq!(
            release_entity(&mut conn, Table::Artists, "ethereum/0xabc")
                .await
                .unwrap(),
            1
        );
        drop(conn);
        assert_eq!(storage.pending_count(Table::Artists).await.unwrap(), 1);
    }
}
