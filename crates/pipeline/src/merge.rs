//! Merge engine: folds staged writes into CRDT registers.
//!
//! Every entity with staged writes is folded in its own transaction: load the
//! register, apply the writes, store the register and its projection, delete
//! the consumed writes. A field write that would grow the register past
//! capacity is dropped and reported against the entity; the rest of the
//! register is kept. An entity whose stored register cannot be read is
//! quarantined, annotated and hidden from readers until reset. Updates that
//! wait too long for their entity's insert are quarantined and annotated as
//! orphans. In every case the drain carries on with the remaining entities.

use anyhow::Result;
use spinsync_core::{CoreError, FieldSet, Register, SourcePriority, Table};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::storage::{
    crdt, mempool, now_unix, ErrorKind, MempoolEntry, NewErrorAnnotation, StageOperation, Storage,
};

/// Source recorded on annotations raised by the merge engine.
pub const MERGE_SOURCE: &str = "merge";

/// How long an update may wait for its insert by default.
pub const DEFAULT_ORPHAN_AFTER: Duration = Duration::from_secs(86_400);

/// Failure while folding one entity.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The register of this entity is unusable. Other entities are unaffected.
    #[error("Integrity error in {table}/{entity_id}: {source}")]
    Integrity {
        /// Table of the entity.
        table: Table,
        /// Entity id.
        entity_id: String,
        /// Underlying decode/encode failure.
        #[source]
        source: CoreError,
    },

    /// The store itself failed. The whole drain is aborted.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Per-table result of a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableDrain {
    /// Entities whose staged writes were folded.
    pub touched: u64,
    /// Entities quarantined or annotated by the drain.
    pub errored: u64,
    /// Entities whose updates are waiting for an insert.
    pub deferred: u64,
}

/// Result of a full drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Counts per table; tables without staged writes are omitted.
    pub tables: BTreeMap<Table, TableDrain>,
}

impl DrainReport {
    /// Add another drain's counts to this one.
    pub fn absorb(&mut self, other: &DrainReport) {
        for (table, counts) in &other.tables {
            let entry = self.tables.entry(*table).or_default();
            entry.touched += counts.touched;
            entry.errored += counts.errored;
            entry.deferred += counts.deferred;
        }
    }

    /// Whether nothing was folded or quarantined.
    pub fn is_empty(&self) -> bool {
        self.tables
            .values()
            .all(|counts| counts.touched == 0 && counts.errored == 0)
    }
}

/// A field value dropped because it would not fit in the register.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RejectedField {
    field: String,
    source: String,
}

enum EntityFold {
    Merged {
        shape_changed: bool,
        rejected: Vec<RejectedField>,
    },
    Deferred {
        waiting_since: i64,
        source: String,
    },
    Empty,
}

/// Folds the mempool into canonical state.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    storage: Storage,
    priority: SourcePriority,
    orphan_after: Duration,
}

impl MergeEngine {
    /// Create a merge engine over a store.
    pub fn new(storage: Storage, priority: SourcePriority) -> Self {
        Self {
            storage,
            priority,
            orphan_after: DEFAULT_ORPHAN_AFTER,
        }
    }

    /// Set how long updates may wait for their entity's insert.
    pub fn with_orphan_timeout(mut self, orphan_after: Duration) -> Self {
        self.orphan_after = orphan_after;
        self
    }

    /// Fold every staged, non-quarantined write.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        for table in Table::ALL {
            let entities = self.storage.pending_entities(table).await?;
            if entities.is_empty() {
                continue;
            }

            let mut counts = TableDrain::default();
            let mut rebuild_view = false;

            for entity_id in entities {
                if self.holds_integrity_error(table, &entity_id).await? {
                    self.storage.quarantine_entity(table, &entity_id).await?;
                    counts.errored += 1;
                    continue;
                }

                match self.fold_entity(table, &entity_id).await {
                    Ok(EntityFold::Merged {
                        shape_changed,
                        rejected,
                    }) => {
                        counts.touched += 1;
                        rebuild_view |= shape_changed;
                        if !rejected.is_empty() {
                            self.report_rejected(table, &entity_id, &rejected).await?;
                            counts.errored += 1;
                        }
                    }
                    Ok(EntityFold::Deferred {
                        waiting_since,
                        source,
                    }) => {
                        if self.is_orphaned(waiting_since) {
                            self.quarantine_orphan(table, &entity_id, &source).await?;
                            counts.errored += 1;
                        } else {
                            counts.deferred += 1;
                        }
                    }
                    Ok(EntityFold::Empty) => {}
                    Err(MergeError::Integrity {
                        table,
                        entity_id,
                        source,
                    }) => {
                        rebuild_view |= self.quarantine(table, &entity_id, &source).await?;
                        counts.errored += 1;
                    }
                    Err(MergeError::Storage(e)) => return Err(e),
                }
            }

            if rebuild_view {
                self.storage.sync_view(table).await?;
            }

            debug!(
                table = %table,
                touched = counts.touched,
                errored = counts.errored,
                deferred = counts.deferred,
                "Drained staged writes"
            );
            report.tables.insert(table, counts);
        }

        Ok(report)
    }

    async fn holds_integrity_error(&self, table: Table, entity_id: &str) -> Result<bool> {
        Ok(self
            .storage
            .get_error(table, entity_id)
            .await?
            .is_some_and(|a| a.kind == ErrorKind::Integrity && a.status.is_active()))
    }

    fn is_orphaned(&self, waiting_since: i64) -> bool {
        let waited = now_unix().saturating_sub(waiting_since);
        waited >= 0 && waited as u64 >= self.orphan_after.as_secs()
    }

    async fn fold_entity(&self, table: Table, entity_id: &str) -> Result<EntityFold, MergeError> {
        let integrity = |source: CoreError| MergeError::Integrity {
            table,
            entity_id: entity_id.to_string(),
            source,
        };
        let capacity = self.storage.register_capacity();

        let mut tx = self.storage.pool().begin().await.map_err(anyhow::Error::from)?;

        let entries = mempool::entity_entries(&mut tx, table, entity_id).await?;
        let Some(first) = entries.first() else {
            return Ok(EntityFold::Empty);
        };

        let raw = crdt::fetch_register_raw(&mut tx, table, entity_id).await?;
        let is_new = raw.is_none();
        let mut register = match raw {
            Some(raw) => Register::decode(&raw, capacity).map_err(integrity)?,
            None => {
                let has_insert = entries
                    .iter()
                    .any(|entry| entry.operation == StageOperation::Insert);
                if !has_insert {
                    let waiting_since = entries
                        .iter()
                        .map(|entry| entry.staged_at)
                        .min()
                        .unwrap_or(first.staged_at);
                    return Ok(EntityFold::Deferred {
                        waiting_since,
                        source: first.provenance.source.clone(),
                    });
                }
                Register::new()
            }
        };

        let mut changed = is_new;
        let mut shape_changed = is_new;
        let mut rejected = Vec::new();
        for entry in &entries {
            let fold = self
                .apply_within_capacity(&mut register, entry, capacity)
                .map_err(integrity)?;
            changed |= fold.changed;
            shape_changed |= fold.shape_changed;
            rejected.extend(fold.rejected);
        }

        if changed {
            let encoded = register.encode(capacity).map_err(integrity)?;
            crdt::store_register(&mut tx, table, entity_id, &register, &encoded).await?;
        }

        let ids: Vec<i64> = entries.iter().map(|entry| entry.id).collect();
        mempool::delete_entries(&mut tx, &ids).await?;

        tx.commit().await.map_err(anyhow::Error::from)?;

        Ok(EntityFold::Merged {
            shape_changed,
            rejected,
        })
    }

    /// Apply one staged write. If the whole write does not fit, its fields
    /// are applied one at a time and those that do not fit are rejected.
    fn apply_within_capacity(
        &self,
        register: &mut Register,
        entry: &MempoolEntry,
        capacity: usize,
    ) -> Result<WriteFold, CoreError> {
        let before = register.clone();
        let outcome = register.apply(&entry.fields, &entry.provenance, &self.priority)?;
        if !outcome.changed() || fits(register, capacity)? {
            return Ok(WriteFold {
                changed: outcome.changed(),
                shape_changed: outcome.shape_changed(),
                rejected: Vec::new(),
            });
        }

        *register = before;
        let mut fold = WriteFold::default();
        for (name, value) in &entry.fields {
            let before = register.clone();
            let single = FieldSet::from([(name.clone(), value.clone())]);
            let outcome = register.apply(&single, &entry.provenance, &self.priority)?;
            if !outcome.changed() {
                continue;
            }
            if fits(register, capacity)? {
                fold.changed = true;
                fold.shape_changed |= outcome.shape_changed();
            } else {
                *register = before;
                fold.rejected.push(RejectedField {
                    field: name.clone(),
                    source: entry.provenance.source.clone(),
                });
            }
        }

        Ok(fold)
    }

    async fn report_rejected(
        &self,
        table: Table,
        entity_id: &str,
        rejected: &[RejectedField],
    ) -> Result<()> {
        let fields: Vec<String> = rejected.iter().map(|r| r.field.clone()).collect();
        let message = format!(
            "Dropped write of {} exceeding register capacity of {} bytes",
            fields.join(", "),
            self.storage.register_capacity()
        );
        warn!(table = %table, entity = %entity_id, "{}", message);

        self.storage
            .annotate_error(&NewErrorAnnotation {
                table,
                entity_id: entity_id.to_string(),
                kind: ErrorKind::Data,
                message,
                processor: rejected[0].source.clone(),
                reset_fields: fields,
            })
            .await
    }

    async fn quarantine_orphan(&self, table: Table, entity_id: &str, source: &str) -> Result<()> {
        let message = format!(
            "Update waited more than {}s for an insert of this entity",
            self.orphan_after.as_secs()
        );
        warn!(table = %table, entity = %entity_id, source = %source, "{}", message);

        self.storage.quarantine_entity(table, entity_id).await?;
        self.storage
            .annotate_error(&NewErrorAnnotation {
                table,
                entity_id: entity_id.to_string(),
                kind: ErrorKind::Data,
                message,
                processor: source.to_string(),
                reset_fields: Vec::new(),
            })
            .await
    }

    /// Returns whether a materialized record was hidden.
    async fn quarantine(&self, table: Table, entity_id: &str, source: &CoreError) -> Result<bool> {
        error!(
            table = %table,
            entity = %entity_id,
            "Integrity error, quarantining entity: {}",
            source
        );

        self.storage.quarantine_entity(table, entity_id).await?;

        let mut conn = self.storage.pool().acquire().await?;
        let hidden = crdt::hide_canonical(&mut conn, table, entity_id).await?;
        drop(conn);

        self.storage
            .annotate_error(&NewErrorAnnotation {
                table,
                entity_id: entity_id.to_string(),
                kind: ErrorKind::Integrity,
                message: source.to_string(),
                processor: MERGE_SOURCE.to_string(),
                reset_fields: Vec::new(),
            })
            .await?;

        Ok(hidden)
    }
}

#[derive(Default)]
struct WriteFold {
    changed: bool,
    shape_changed: bool,
    rejected: Vec<RejectedField>,
}

fn fits(register: &Register, capacity: usize) -> Result<bool, CoreError> {
    match register.encode(capacity) {
        Ok(_) => Ok(true),
        Err(CoreError::RegisterTooLarge { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::setup_storage;
    use crate::storage::ErrorStatus;
    use serde_json::json;
    use spinsync_core::{EntityRecord, FieldSet, Provenance};

    fn engine(storage: &Storage) -> MergeEngine {
        MergeEngine::new(storage.clone(), SourcePriority::default())
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> FieldSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_drain_folds_and_materializes() {
        let (storage, _temp_db) = setup_storage().await;

        storage
            .stage_insert(
                Table::Artists,
                &EntityRecord::new("ethereum/0xa").with("name", "Alice"),
                &Provenance::new(100, "transfers"),
            )
            .await
            .unwrap();

        let report = engine(&storage).drain().await.unwrap();
        assert_eq!(report.tables[&Table::Artists].touched, 1);
        assert_eq!(storage.pending_count(Table::Artists).await.unwrap(), 0);

        let record = storage
            .get_record(Table::Artists, "ethereum/0xa")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.get_str("name"), Some("Alice"));
        assert_eq!(
            storage.view_columns(Table::Artists).await.unwrap(),
            vec!["name"]
        );
    }

    #[tokio::test]
    async fn test_later_block_wins_regardless_of_arrival() {
        let (storage, _temp_db) = setup_storage().await;
        let id = "ethereum/0xa";

        storage
            .stage_insert(
                Table::Artists,
                &EntityRecord::new(id).with("name", "Y"),
                &Provenance::new(105, "transfers"),
            )
            .await
            .unwrap();
        engine(&storage).drain().await.unwrap();

        storage
            .stage_update(
                Table::Artists,
                id,
                &fields(&[("name", json!("X"))]),
                &Provenance::new(100, "transfers"),
            )
            .await
            .unwrap();
        engine(&storage).drain().await.unwrap();

        let record = storage.get_record(Table::Artists, id).await.unwrap().unwrap();
        assert_eq!(record.get_str("name"), Some("Y"));
    }

    #[tokio::test]
    async fn test_update_waits_for_insert() {
        let (storage, _temp_db) = setup_storage().await;
        let id = "ethereum/0xabc/1";

        storage
            .stage_update(
                Table::Nfts,
                id,
                &fields(&[("owner", json!("0x02"))]),
                &Provenance::new(2, "transfers"),
            )
            .await
            .unwrap();

        let report = engine(&storage).drain().await.unwrap();
        assert_eq!(report.tables[&Table::Nfts].deferred, 1);
        assert!(storage.get_record(Table::Nfts, id).await.unwrap().is_none());
        assert_eq!(storage.pending_count(Table::Nfts).await.unwrap(), 1);

        storage
            .stage_insert(
                Table::Nfts,
                &EntityRecord::new(id).with("owner", "0x01"),
                &Provenance::new(1, "transfers"),
            )
            .await
            .unwrap();
        engine(&storage).drain().await.unwrap();

        let record = storage.get_record(Table::Nfts, id).await.unwrap().unwrap();
        assert_eq!(record.get_str("owner"), Some("0x02"));
        assert_eq!(storage.pending_count(Table::Nfts).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_redrain_is_idempotent() {
        let (storage, _temp_db) = setup_storage().await;
        let record = EntityRecord::new("sound").with("name", "Sound");
        let provenance = Provenance::new(1, "insert_seeds");

        storage
            .stage_insert(Table::Platforms, &record, &provenance)
            .await
            .unwrap();
        engine(&storage).drain().await.unwrap();
        let first = storage.load_register(Table::Platforms, "sound").await.unwrap();

        storage
            .stage_insert(Table::Platforms, &record, &provenance)
            .await
            .unwrap();
        engine(&storage).drain().await.unwrap();
        let second = storage.load_register(Table::Platforms, "sound").await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_oversized_field_is_dropped_not_the_entity() {
        let (storage, _temp_db) = setup_storage().await;
        let storage = storage.with_register_capacity(256);

        storage
            .stage_insert(
                Table::Nfts,
                &EntityRecord::new("nft/big")
                    .with("owner", "0x01")
                    .with("metadata", "x".repeat(1024)),
                &Provenance::new(1, "nft_metadata"),
            )
            .await
            .unwrap();
        storage
            .stage_insert(
                Table::Nfts,
                &EntityRecord::new("nft/small").with("owner", "0x01"),
                &Provenance::new(1, "transfers"),
            )
            .await
            .unwrap();

        let report = engine(&storage).drain().await.unwrap();
        let counts = report.tables[&Table::Nfts];
        assert_eq!(counts.touched, 2);
        assert_eq!(counts.errored, 1);

        let big = storage.get_record(Table::Nfts, "nft/big").await.unwrap().unwrap();
        assert_eq!(big.get_str("owner"), Some("0x01"));
        assert!(big.get("metadata").is_none());
        assert!(storage.get_record(Table::Nfts, "nft/small").await.unwrap().is_some());

        let annotation = storage.get_error(Table::Nfts, "nft/big").await.unwrap().unwrap();
        assert_eq!(annotation.kind, ErrorKind::Data);
        assert_eq!(annotation.status, ErrorStatus::PendingRetry);
        assert_eq!(annotation.processor, "nft_metadata");
        assert_eq!(annotation.reset_fields, vec!["metadata"]);

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.quarantined_writes, 0);
        assert_eq!(stats.pending_writes, 0);
    }

    #[tokio::test]
    async fn test_oversized_update_keeps_register() {
        let (storage, _temp_db) = setup_storage().await;
        let storage = storage.with_register_capacity(512);
        let id = "ethereum/0xabc/1";

        storage
            .stage_insert(
                Table::Nfts,
                &EntityRecord::new(id)
                    .with("owner", "0x01")
                    .with("tokenURI", "ipfs://a"),
                &Provenance::new(1, "transfers"),
            )
            .await
            .unwrap();
        engine(&storage).drain().await.unwrap();

        storage
            .stage_update(
                Table::Nfts,
                id,
                &fields(&[
                    ("metadata", json!("x".repeat(2048))),
                    ("mimeType", json!("application/json")),
                ]),
                &Provenance::new(2, "nft_metadata"),
            )
            .await
            .unwrap();
        let report = engine(&storage).drain().await.unwrap();
        assert_eq!(report.tables[&Table::Nfts].errored, 1);

        let record = storage.get_record(Table::Nfts, id).await.unwrap().unwrap();
        assert_eq!(record.get_str("owner"), Some("0x01"));
        assert_eq!(record.get_str("mimeType"), Some("application/json"));
        assert!(record.get("metadata").is_none());
        assert_eq!(storage.pending_count(Table::Nfts).await.unwrap(), 0);

        // Later writes are not held back by the annotation.
        storage
            .stage_update(
                Table::Nfts,
                id,
                &fields(&[("owner", json!("0x02"))]),
                &Provenance::new(3, "transfers"),
            )
            .await
            .unwrap();
        engine(&storage).drain().await.unwrap();
        let record = storage.get_record(Table::Nfts, id).await.unwrap().unwrap();
        assert_eq!(record.get_str("owner"), Some("0x02"));
    }

    #[tokio::test]
    async fn test_orphaned_update_is_quarantined() {
        let (storage, _temp_db) = setup_storage().await;
        let id = "ethereum/0xabc/7";
        let engine = engine(&storage).with_orphan_timeout(Duration::from_secs(3_600));

        storage
            .stage_update(
                Table::Nfts,
                id,
                &fields(&[("owner", json!("0x02"))]),
                &Provenance::new(2, "erc721_transfers_1"),
            )
            .await
            .unwrap();

        let report = engine.drain().await.unwrap();
        assert_eq!(report.tables[&Table::Nfts].deferred, 1);
        assert!(storage.get_error(Table::Nfts, id).await.unwrap().is_none());

        sqlx::query("UPDATE mempool SET staged_at = staged_at - 7200")
            .execute(storage.pool())
            .await
            .unwrap();

        let report = engine.drain().await.unwrap();
        assert_eq!(report.tables[&Table::Nfts].errored, 1);
        assert_eq!(report.tables[&Table::Nfts].deferred, 0);

        let annotation = storage.get_error(Table::Nfts, id).await.unwrap().unwrap();
        assert_eq!(annotation.kind, ErrorKind::Data);
        assert_eq!(annotation.processor, "erc721_transfers_1");
        assert_eq!(storage.pending_count(Table::Nfts).await.unwrap(), 0);
        assert_eq!(storage.stats().await.unwrap().quarantined_writes, 1);

        // Quarantined orphans are no longer re-read by every drain.
        assert!(engine.drain().await.unwrap().tables.is_empty());

        // Once the insert shows up, a reset lets the held update apply.
        storage
            .stage_insert(
                Table::Nfts,
                &EntityRecord::new(id).with("owner", "0x01"),
                &Provenance::new(1, "erc721_transfers_1"),
            )
            .await
            .unwrap();
        engine.drain().await.unwrap();
        assert!(storage.reset_entity(Table::Nfts, id).await.unwrap());
        engine.drain().await.unwrap();

        let record = storage.get_record(Table::Nfts, id).await.unwrap().unwrap();
        assert_eq!(record.get_str("owner"), Some("0x02"));
    }

    #[tokio::test]
    async fn test_corrupt_register_does_not_block_drain() {
        let (storage, _temp_db) = setup_storage().await;

        sqlx::query(
            "INSERT INTO crdt_state (table_name, entity_id, schema_version, value, updated_at) \
             VALUES ('artists', 'ethereum/0xbad', 1, 'not json', 0)",
        )
        .execute(storage.pool())
        .await
        .unwrap();

        for id in ["ethereum/0xbad", "ethereum/0xgood"] {
            storage
                .stage_insert(
                    Table::Artists,
                    &EntityRecord::new(id).with("name", "n"),
                    &Provenance::new(1, "transfers"),
                )
                .await
                .unwrap();
        }

        let report = engine(&storage).drain().await.unwrap();
        assert_eq!(report.tables[&Table::Artists].errored, 1);
        assert_eq!(report.tables[&Table::Artists].touched, 1);

        // New writes for a quarantined entity are held back too.
        storage
            .stage_update(
                Table::Artists,
                "ethereum/0xbad",
                &fields(&[("name", json!("m"))]),
                &Provenance::new(2, "transfers"),
            )
            .await
            .unwrap();
        let report = engine(&storage).drain().await.unwrap();
        assert_eq!(report.tables[&Table::Artists].errored, 1);
        assert_eq!(storage.stats().await.unwrap().quarantined_writes, 2);

        // Reset drops the broken register, which has no projection, and
        // releases the held writes.
        storage.reset_errors(3).await.unwrap();
        let report = engine(&storage).drain().await.unwrap();
        assert_eq!(report.tables[&Table::Artists].touched, 1);

        let record = storage
            .get_record(Table::Artists, "ethereum/0xbad")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.get_str("name"), Some("m"));
    }

    #[tokio::test]
    async fn test_unreadable_register_is_hidden_then_rebuilt() {
        let (storage, _temp_db) = setup_storage().await;
        let id = "ethereum/0xabc/1";

        storage
            .stage_insert(
                Table::Nfts,
                &EntityRecord::new(id)
                    .with("owner", "0x01")
                    .with("tokenURI", "ipfs://a"),
                &Provenance::new(1, "transfers"),
            )
            .await
            .unwrap();
        engine(&storage).drain().await.unwrap();

        sqlx::query("UPDATE crdt_state SET value = '{' WHERE entity_id = ?")
            .bind(id)
            .execute(storage.pool())
            .await
            .unwrap();
        storage
            .stage_update(
                Table::Nfts,
                id,
                &fields(&[("owner", json!("0x02"))]),
                &Provenance::new(2, "transfers"),
            )
            .await
            .unwrap();

        let report = engine(&storage).drain().await.unwrap();
        assert_eq!(report.tables[&Table::Nfts].errored, 1);
        assert!(storage.get_record(Table::Nfts, id).await.unwrap().is_none());
        assert_eq!(storage.count_canonical(Table::Nfts).await.unwrap(), 0);

        storage.reset_errors(3).await.unwrap();
        engine(&storage).drain().await.unwrap();

        let record = storage.get_record(Table::Nfts, id).await.unwrap().unwrap();
        assert_eq!(record.get_str("owner"), Some("0x02"));
        assert_eq!(record.get_str("tokenURI"), Some("ipfs://a"));
        assert!(!storage.has_active_error(Table::Nfts, id).await.unwrap());
    }
}
