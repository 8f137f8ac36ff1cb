//! Error annotation storage operations.
//!
//! An annotation marks one entity as failed so triggers skip it. Resetting an
//! annotation clears whatever partial output the failing processor left on the
//! entity and hands it back to normal processing.

use super::{
    crdt, mempool, now_unix, ErrorAnnotation, ErrorKind, ErrorStatus, NewErrorAnnotation,
    ResetSummary, Storage,
};
use crate::merge::MERGE_SOURCE;
use anyhow::{anyhow, Context, Result};
use spinsync_core::{FieldSet, Provenance, Register, SourcePriority, Table};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Selection for [`Storage::list_errors`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorFilter {
    /// Only this table.
    pub table: Option<Table>,
    /// Only this status. `None` lists every annotation that is still active.
    pub status: Option<ErrorStatus>,
    /// Only annotations last updated at or before this unix timestamp.
    pub updated_before: Option<i64>,
}

impl Storage {
    /// Record an error against an entity.
    ///
    /// Re-annotating an entity replaces the message and puts it back into
    /// `pending_retry`, keeping its reset count.
    pub async fn annotate_error(&self, annotation: &NewErrorAnnotation) -> Result<()> {
        let now = now_unix();
        let reset_fields_json = serde_json::to_string(&annotation.reset_fields)?;

        sqlx::query(
            r#"
            INSERT INTO error_annotations (
                table_name, entity_id, kind, message, processor,
                status, reset_count, reset_fields_json, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 'pending_retry', 0, ?, ?, ?)
            ON CONFLICT(table_name, entity_id) DO UPDATE SET
                kind = excluded.kind,
                message = excluded.message,
                processor = excluded.processor,
                status = CASE
                    WHEN error_annotations.status = 'needs_intervention' THEN 'needs_intervention'
                    ELSE 'pending_retry'
                END,
                reset_fields_json = excluded.reset_fields_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(annotation.table.as_str())
        .bind(&annotation.entity_id)
        .bind(annotation.kind.as_str())
        .bind(&annotation.message)
        .bind(&annotation.processor)
        .bind(reset_fields_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to annotate {}/{}",
                annotation.table, annotation.entity_id
            )
        })?;

        Ok(())
    }

    /// Annotation of an entity, whatever its status.
    pub async fn get_error(&self, table: Table, entity_id: &str) -> Result<Option<ErrorAnnotation>> {
        let row = sqlx::query(
            r#"
            SELECT table_name, entity_id, kind, message, processor, status,
                   reset_count, reset_fields_json, created_at, updated_at
            FROM error_annotations
            WHERE table_name = ? AND entity_id = ?
            "#,
        )
        .bind(table.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch error annotation")?;

        row.map(Self::row_to_error_annotation).transpose()
    }

    /// Whether processors should skip this entity.
    pub async fn has_active_error(&self, table: Table, entity_id: &str) -> Result<bool> {
        Ok(self
            .get_error(table, entity_id)
            .await?
            .is_some_and(|annotation| annotation.status.is_active()))
    }

    /// List annotations, oldest first.
    pub async fn list_errors(&self, filter: ErrorFilter) -> Result<Vec<ErrorAnnotation>> {
        let rows = sqlx::query(
            r#"
            SELECT table_name, entity_id, kind, message, processor, status,
                   reset_count, reset_fields_json, created_at, updated_at
            FROM error_annotations
            WHERE (? IS NULL OR table_name = ?)
              AND ((? IS NULL AND status != 'reset') OR status = ?)
              AND (? IS NULL OR updated_at <= ?)
            ORDER BY created_at, table_name, entity_id
            "#,
        )
        .bind(filter.table.map(|t| t.as_str()))
        .bind(filter.table.map(|t| t.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.updated_before)
        .bind(filter.updated_before)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list error annotations")?;

        rows.into_iter().map(Self::row_to_error_annotation).collect()
    }

    /// Reset every `pending_retry` annotation.
    ///
    /// Annotations that already used up `max_resets` are flagged
    /// `needs_intervention` instead and left alone from then on.
    pub async fn reset_errors(&self, max_resets: u32) -> Result<ResetSummary> {
        self.reset_errors_before(max_resets, None).await
    }

    /// Like [`Storage::reset_errors`], limited to annotations last updated at
    /// or before `updated_before`.
    pub async fn reset_errors_before(
        &self,
        max_resets: u32,
        updated_before: Option<i64>,
    ) -> Result<ResetSummary> {
        let pending = self.resettable_errors(updated_before).await?;

        let mut summary = ResetSummary::default();
        let mut touched_tables = BTreeSet::new();

        for annotation in pending {
            if annotation.reset_count >= max_resets {
                sqlx::query(
                    r#"
                    UPDATE error_annotations
                    SET status = 'needs_intervention', updated_at = ?
                    WHERE table_name = ? AND entity_id = ?
                    "#,
                )
                .bind(now_unix())
                .bind(annotation.table.as_str())
                .bind(&annotation.entity_id)
                .execute(&self.pool)
                .await
                .context("Failed to escalate error annotation")?;

                warn!(
                    table = %annotation.table,
                    entity = %annotation.entity_id,
                    resets = annotation.reset_count,
                    "Entity needs manual intervention: {}",
                    annotation.message
                );
                summary.escalated += 1;
                continue;
            }

            self.reset_annotated_entity(&annotation, annotation.reset_count + 1)
                .await?;
            touched_tables.insert(annotation.table);
            summary.reset += 1;
        }

        for table in touched_tables {
            self.sync_view(table).await?;
        }

        if summary.reset > 0 || summary.escalated > 0 {
            info!(
                reset = summary.reset,
                escalated = summary.escalated,
                "Processed error annotations"
            );
        }

        Ok(summary)
    }

    /// `pending_retry` annotations last updated at or before `updated_before`.
    pub async fn resettable_errors(&self, updated_before: Option<i64>) -> Result<Vec<ErrorAnnotation>> {
        self.list_errors(ErrorFilter {
            table: None,
            status: Some(ErrorStatus::PendingRetry),
            updated_before,
        })
        .await
    }

    /// Reset one entity regardless of its annotation status.
    ///
    /// The reset count starts over so the entity gets a fresh round of
    /// automatic retries. Returns `false` when the entity has no annotation.
    pub async fn reset_entity(&self, table: Table, entity_id: &str) -> Result<bool> {
        let Some(annotation) = self.get_error(table, entity_id).await? else {
            return Ok(false);
        };

        self.reset_annotated_entity(&annotation, 0).await?;
        self.sync_view(table).await?;

        info!(table = %table, entity = %entity_id, "Manually reset entity");
        Ok(true)
    }

    /// Clear partial output, release quarantined writes and mark the
    /// annotation reset, all in one transaction.
    async fn reset_annotated_entity(
        &self,
        annotation: &ErrorAnnotation,
        reset_count: u32,
    ) -> Result<()> {
        let table = annotation.table;
        let entity_id = annotation.entity_id.as_str();
        let mut tx = self.pool.begin().await?;

        let raw = crdt::fetch_register_raw(&mut tx, table, entity_id).await?;
        match (annotation.kind, raw) {
            (_, None) => {}
            (ErrorKind::Integrity, Some(_)) => {
                self.rebuild_register(&mut tx, table, entity_id).await?;
            }
            (ErrorKind::Data, Some(raw)) => match Register::decode(&raw, self.register_capacity) {
                Ok(mut register) => {
                    if register.remove_fields(&annotation.reset_fields) > 0 {
                        let encoded = register.encode(self.register_capacity)?;
                        crdt::store_register(&mut tx, table, entity_id, &register, &encoded)
                            .await?;
                    }
                }
                Err(e) => {
                    warn!(
                        table = %table,
                        entity = %entity_id,
                        "Discarding unreadable register during reset: {}",
                        e
                    );
                    crdt::delete_register(&mut tx, table, entity_id).await?;
                }
            },
        }

        mempool::release_entity(&mut tx, table, entity_id).await?;

        sqlx::query(
            r#"
            UPDATE error_annotations
            SET status = 'reset', reset_count = ?, updated_at = ?
            WHERE table_name = ? AND entity_id = ?
            "#,
        )
        .bind(reset_count as i64)
        .bind(now_unix())
        .bind(table.as_str())
        .bind(entity_id)
        .execute(&mut *tx)
        .await
        .context("Failed to mark annotation reset")?;

        tx.commit()
            .await
            .with_context(|| format!("Failed to reset {}/{}", table, entity_id))?;

        Ok(())
    }

    /// Replace an unreadable register with one rebuilt from the entity's last
    /// projected record, at the lowest ordinal so any staged write wins.
    ///
    /// Without a usable projection the register is dropped.
    async fn rebuild_register(
        &self,
        conn: &mut SqliteConnection,
        table: Table,
        entity_id: &str,
    ) -> Result<()> {
        let projected = crdt::fetch_canonical_raw(conn, table, entity_id)
            .await?
            .and_then(|raw| serde_json::from_str::<FieldSet>(&raw).ok());

        let rebuilt = projected.and_then(|fields| {
            let mut register = Register::new();
            register
                .apply(&fields, &Provenance::new(0, MERGE_SOURCE), &SourcePriority::default())
                .ok()?;
            let encoded = register.encode(self.register_capacity).ok()?;
            Some((register, encoded))
        });

        match rebuilt {
            Some((register, encoded)) => {
                info!(table = %table, entity = %entity_id, "Rebuilt register from projection");
                crdt::store_register(conn, table, entity_id, &register, &encoded).await
            }
            None => {
                warn!(
                    table = %table,
                    entity = %entity_id,
                    "Discarding unreadable register without a usable projection"
                );
                crdt::delete_register(conn, table, entity_id).await
            }
        }
    }

    fn row_to_error_annotation(row: SqliteRow) -> Result<ErrorAnnotation> {
        let table: String = row.get("table_name");
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        let reset_fields_json: String = row.get("reset_fields_json");

        Ok(ErrorAnnotation {
            table: table.parse()?,
            entity_id: row.get("entity_id"),
            kind: kind.parse().map_err(|e: String| anyhow!(e))?,
            message: row.get("message"),
            processor: row.get("processor"),
            status: status.parse().map_err(|e: String| anyhow!(e))?,
            reset_count: row.get::<i64, _>("reset_count") as u32,
            reset_fields: serde_json::from_str(&reset_fields_json)
                .context("Failed to decode reset fields")?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}
