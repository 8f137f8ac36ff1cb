//! CRDT register persistence and the canonical projection.
//!
//! `crdt_state` holds the merge state. `canonical_records` holds the projected
//! field values and is what processors read. Each table also gets a SQL view
//! `view_<table>` with one column per known field, recreated whenever the
//! table's field set changes.

use super::{now_unix, CanonicalRecord, Storage};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use spinsync_core::{validate_field_name, Register, Table};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

impl Storage {
    /// Load and decode the register of an entity.
    ///
    /// Fails when the stored register is malformed or over capacity.
    pub async fn load_register(&self, table: Table, entity_id: &str) -> Result<Option<Register>> {
        let mut conn = self.pool.acquire().await?;
        let raw = fetch_register_raw(&mut conn, table, entity_id).await?;

        raw.map(|raw| {
            Register::decode(&raw, self.register_capacity)
                .with_context(|| format!("Register {}/{} is unreadable", table, entity_id))
        })
        .transpose()
    }

    /// Materialized record of an entity.
    pub async fn get_record(&self, table: Table, entity_id: &str) -> Result<Option<CanonicalRecord>> {
        let row = sqlx::query(
            r#"
            SELECT entity_id, record_json
            FROM canonical_records
            WHERE table_name = ? AND entity_id = ? AND hidden = 0
            "#,
        )
        .bind(table.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch canonical record")?;

        row.map(Self::row_to_canonical_record).transpose()
    }

    /// Page through materialized records of a table in id order.
    pub async fn canonical_records(
        &self,
        table: Table,
        after_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<CanonicalRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, record_json
            FROM canonical_records
            WHERE table_name = ? AND entity_id > ? AND hidden = 0
            ORDER BY entity_id
            LIMIT ?
            "#,
        )
        .bind(table.as_str())
        .bind(after_id.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch canonical records")?;

        rows.into_iter().map(Self::row_to_canonical_record).collect()
    }

    /// Records without a `missing` key (and with a non-null `required`, if
    /// given) whose entity carries no active error annotation.
    ///
    /// A key holding JSON `null` counts as present.
    ///
    /// This is the usual trigger query of an enrichment processor.
    pub async fn records_missing_field(
        &self,
        table: Table,
        missing: &str,
        required: Option<&str>,
        after_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<CanonicalRecord>> {
        validate_field_name(missing)?;
        if let Some(required) = required {
            validate_field_name(required)?;
        }

        let rows = sqlx::query(
            r#"
            SELECT c.entity_id, c.record_json
            FROM canonical_records c
            WHERE c.table_name = ?
              AND c.hidden = 0
              AND c.entity_id > ?
              AND json_type(c.record_json, ?) IS NULL
              AND (? IS NULL OR json_extract(c.record_json, ?) IS NOT NULL)
              AND NOT EXISTS (
                  SELECT 1 FROM error_annotations e
                  WHERE e.table_name = c.table_name
                    AND e.entity_id = c.entity_id
                    AND e.status != 'reset'
              )
            ORDER BY c.entity_id
            LIMIT ?
            "#,
        )
        .bind(table.as_str())
        .bind(after_id.unwrap_or(""))
        .bind(json_path(missing))
        .bind(required)
        .bind(required.map(json_path))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query records missing a field")?;

        rows.into_iter().map(Self::row_to_canonical_record).collect()
    }

    /// Number of materialized records in a table.
    pub async fn count_canonical(&self, table: Table) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM canonical_records WHERE table_name = ? AND hidden = 0",
        )
        .bind(table.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count canonical records")?;

        Ok(count as u64)
    }

    /// Columns of a table's view, as last built.
    pub async fn view_columns(&self, table: Table) -> Result<Vec<String>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT columns_json FROM view_shapes WHERE table_name = ?")
                .bind(table.as_str())
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch view shape")?;

        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw).context("Failed to decode view shape")?),
            None => Ok(Vec::new()),
        }
    }

    /// Recreate a table's view if its field set changed.
    ///
    /// Returns `true` when the view was rebuilt.
    pub async fn sync_view(&self, table: Table) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let mut columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT j.key
            FROM canonical_records c, json_each(c.record_json) j
            WHERE c.table_name = ? AND c.hidden = 0
            ORDER BY j.key
            "#,
        )
        .bind(table.as_str())
        .fetch_all(&mut *tx)
        .await
        .context("Failed to collect view columns")?;
        columns.retain(|c| validate_field_name(c).is_ok());

        let current: Option<String> =
            sqlx::query_scalar("SELECT columns_json FROM view_shapes WHERE table_name = ?")
                .bind(table.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let columns_json = serde_json::to_string(&columns)?;

        if current.as_deref() == Some(columns_json.as_str()) {
            return Ok(false);
        }

        let view = table.view_name();
        sqlx::query(&format!("DROP VIEW IF EXISTS \"{}\"", view))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to drop view {}", view))?;
        sqlx::query(&view_definition(table, &columns))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create view {}", view))?;

        sqlx::query(
            r#"
            INSERT INTO view_shapes (table_name, columns_json)
            VALUES (?, ?)
            ON CONFLICT(table_name) DO UPDATE SET columns_json = excluded.columns_json
            "#,
        )
        .bind(table.as_str())
        .bind(&columns_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(table = %table, columns = columns.len(), "Rebuilt view");
        Ok(true)
    }

    fn row_to_canonical_record(row: SqliteRow) -> Result<CanonicalRecord> {
        let record_json: String = row.get("record_json");
        let fields: Map<String, Value> =
            serde_json::from_str(&record_json).context("Failed to decode canonical record")?;

        Ok(CanonicalRecord {
            id: row.get("entity_id"),
            fields,
        })
    }
}

fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

/// `CREATE VIEW` statement exposing each field as a column.
///
/// Column names are interpolated, so callers must pass validated field names.
fn view_definition(table: Table, columns: &[String]) -> String {
    let mut select = String::from("entity_id AS \"id\"");
    for column in columns {
        select.push_str(&format!(
            ", json_extract(record_json, '$.{0}') AS \"{0}\"",
            column
        ));
    }

    format!(
        "CREATE VIEW \"{}\" AS SELECT {} FROM canonical_records \
         WHERE table_name = '{}' AND hidden = 0",
        table.view_name(),
        select,
        table.as_str()
    )
}

/// Raw serialized register of an entity.
pub(crate) async fn fetch_register_raw(
    conn: &mut SqliteConnection,
    table: Table,
    entity_id: &str,
) -> Result<Option<String>> {
    let raw = sqlx::query_scalar("SELECT value FROM crdt_state WHERE table_name = ? AND entity_id = ?")
        .bind(table.as_str())
        .bind(entity_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch register")?;

    Ok(raw)
}

/// Projected record of an entity as stored, without decoding it.
pub(crate) async fn fetch_canonical_raw(
    conn: &mut SqliteConnection,
    table: Table,
    entity_id: &str,
) -> Result<Option<String>> {
    let raw = sqlx::query_scalar(
        "SELECT record_json FROM canonical_records WHERE table_name = ? AND entity_id = ?",
    )
    .bind(table.as_str())
    .bind(entity_id)
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to fetch canonical record")?;

    Ok(raw)
}

/// Persist an encoded register and its projection.
pub(crate) async fn store_register(
    conn: &mut SqliteConnection,
    table: Table,
    entity_id: &str,
    register: &Register,
    encoded: &str,
) -> Result<()> {
    let now = now_unix();

    sqlx::query(
        r#"
        INSERT INTO crdt_state (table_name, entity_id, schema_version, value, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(table_name, entity_id) DO UPDATE SET
            schema_version = excluded.schema_version,
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(table.as_str())
    .bind(entity_id)
    .bind(register.schema_version as i64)
    .bind(encoded)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("Failed to store register")?;

    let record_json = serde_json::to_string(&register.project())?;

    sqlx::query(
        r#"
        INSERT INTO canonical_records (table_name, entity_id, record_json, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(table_name, entity_id) DO UPDATE SET
            record_json = excluded.record_json,
            hidden = 0,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(table.as_str())
    .bind(entity_id)
    .bind(record_json)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("Failed to materialize record")?;

    Ok(())
}

/// Delete an entity's register and its projection.
pub(crate) async fn delete_register(
    conn: &mut SqliteConnection,
    table: Table,
    entity_id: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM crdt_state WHERE table_name = ? AND entity_id = ?")
        .bind(table.as_str())
        .bind(entity_id)
        .execute(&mut *conn)
        .await
        .context("Failed to delete register")?;

    delete_canonical(conn, table, entity_id).await
}

/// Hide an entity's record from readers, keeping the row and the register.
pub(crate) async fn hide_canonical(
    conn: &mut SqliteConnection,
    table: Table,
    entity_id: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE canonical_records SET hidden = 1 WHERE table_name = ? AND entity_id = ?",
    )
    .bind(table.as_str())
    .bind(entity_id)
    .execute(&mut *conn)
    .await
    .context("Failed to hide canonical record")?;

    Ok(result.rows_affected() > 0)
}

/// Drop an entity from the canonical projection.
async fn delete_canonical(
    conn: &mut SqliteConnection,
    table: Table,
    entity_id: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM canonical_records WHERE table_name = ? AND entity_id = ?")
        .bind(table.as_str())
        .bind(entity_id)
        .execute(&mut *conn)
        .await
        .context("Failed to delete canonical record")?;

    Ok(())
}
