//! Processor cursor storage operations.

use super::{now_unix, Cursor, Storage};
use anyhow::{Context, Result};
use sqlx::Row;

impl Storage {
    /// Get the persisted cursor of a processor, if any.
    pub async fn get_cursor(&self, processor: &str) -> Result<Option<Cursor>> {
        let row = sqlx::query(
            r#"
            SELECT cursor
            FROM cursors
            WHERE processor = ?
            "#,
        )
        .bind(processor)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to fetch cursor for {}", processor))?;

        Ok(row.map(|row| Cursor::new(row.get::<String, _>("cursor"))))
    }

    /// Persist the cursor of a processor, replacing the previous one.
    pub async fn set_cursor(&self, processor: &str, cursor: &Cursor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cursors (processor, cursor, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(processor) DO UPDATE SET
                cursor = excluded.cursor,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(processor)
        .bind(cursor.as_str())
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to store cursor for {}", processor))?;

        Ok(())
    }

    /// Forget the cursor of a processor so it restarts from its initial cursor.
    pub async fn clear_cursor(&self, processor: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cursors WHERE processor = ?")
            .bind(processor)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to clear cursor for {}", processor))?;

        Ok(result.rows_affected() > 0)
    }

    /// List every persisted cursor, ordered by processor name.
    pub async fn list_cursors(&self) -> Result<Vec<(String, Cursor)>> {
        let rows = sqlx::query("SELECT processor, cursor FROM cursors ORDER BY processor")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list cursors")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("processor"),
                    Cursor::new(row.get::<String, _>("cursor")),
                )
            })
            .collect())
    }
}
