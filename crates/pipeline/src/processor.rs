//! Processor contract.
//!
//! A processor pulls a batch of work with [`Processor::trigger`], keyed by its
//! cursor, and turns it into staged writes with [`Processor::process`]. The
//! runner owns the cursor: it is only advanced after the batch was processed
//! and its staged writes were folded.
//!
//! The processor's name is its cursor key. Renaming a processor makes it start
//! over from its initial cursor.

use async_trait::async_trait;
use spinsync_core::Table;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clients::Clients;
use crate::storage::{Cursor, ErrorKind, NewErrorAnnotation};

/// Failure of a trigger or of one processed item.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// A collaborator or the store is unavailable. The batch is abandoned and
    /// the cursor stays where it was.
    #[error("Transient failure: {0:#}")]
    Transient(#[from] anyhow::Error),

    /// One input cannot be transformed. The entity is annotated and the batch
    /// moves on.
    #[error("Data error on {table}/{entity_id}: {message}")]
    Data {
        /// Table of the affected entity.
        table: Table,
        /// Affected entity.
        entity_id: String,
        /// What went wrong.
        message: String,
    },
}

impl ProcessingError {
    /// Data error on one entity.
    pub fn data(table: Table, entity_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Data {
            table,
            entity_id: entity_id.into(),
            message: message.into(),
        }
    }

    /// Whether the error should stop the run for this processor.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Work returned by a trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    /// Items to process.
    pub items: Vec<T>,
    /// Cursor to store once the batch is folded. `None` keeps the current one,
    /// for processors whose trigger naturally excludes finished work.
    pub next_cursor: Option<Cursor>,
}

impl<T> Batch<T> {
    /// No more work this round.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }

    /// Items with a cursor to advance to.
    pub fn new(items: Vec<T>, next_cursor: Option<Cursor>) -> Self {
        Self { items, next_cursor }
    }

    /// Whether the trigger found nothing to do: no items and no cursor
    /// movement away from `current`.
    ///
    /// A batch without items that still moves the cursor (a scanned block
    /// range with no matching logs) counts as work.
    pub fn is_idle(&self, current: &Cursor) -> bool {
        self.items.is_empty() && self.next_cursor.as_ref().map_or(true, |next| next == current)
    }
}

/// Counts for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Items processed without error.
    pub processed: u64,
    /// Items annotated with a data error.
    pub errored: u64,
}

/// A named, cursor-driven unit of ingestion work.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Unit of work produced by the trigger.
    type Item: Send + Sync;

    /// Stable name, also the cursor key.
    fn name(&self) -> &str;

    /// Cursor used before anything has been persisted.
    fn initial_cursor(&self) -> Cursor;

    /// Fields holding partial output of this processor, cleared when one of
    /// its error annotations is reset.
    fn reset_fields(&self) -> Vec<String> {
        Vec::new()
    }

    /// Fetch the next batch after `cursor`. Must not write anything.
    async fn trigger(
        &self,
        clients: &Clients,
        cursor: &Cursor,
    ) -> Result<Batch<Self::Item>, ProcessingError>;

    /// Turn one item into staged writes. Must be idempotent.
    async fn process_item(&self, item: &Self::Item, clients: &Clients)
        -> Result<(), ProcessingError>;

    /// Process a batch item by item.
    ///
    /// Data errors are annotated and skipped; a transient error aborts the
    /// batch.
    async fn process(
        &self,
        batch: &Batch<Self::Item>,
        clients: &Clients,
    ) -> Result<BatchReport, ProcessingError> {
        let mut report = BatchReport::default();

        for item in &batch.items {
            let outcome = self.process_item(item, clients).await;
            record_item_outcome(self.name(), &self.reset_fields(), outcome, clients, &mut report)
                .await?;
        }

        Ok(report)
    }

    /// Erase the item type so processors can share one ordered list.
    fn boxed(self) -> Box<dyn ProcessorStep>
    where
        Self: Sized + 'static,
    {
        Box::new(Erased(self))
    }
}

/// Fold one item's result into a batch report, annotating data errors.
///
/// Transient errors are handed back to the caller.
pub async fn record_item_outcome(
    processor: &str,
    reset_fields: &[String],
    outcome: Result<(), ProcessingError>,
    clients: &Clients,
    report: &mut BatchReport,
) -> Result<(), ProcessingError> {
    match outcome {
        Ok(()) => {
            report.processed += 1;
            Ok(())
        }
        Err(ProcessingError::Data {
            table,
            entity_id,
            message,
        }) => {
            warn!(
                processor = processor,
                table = %table,
                entity = %entity_id,
                "Data error: {}",
                message
            );
            clients
                .storage
                .annotate_error(&NewErrorAnnotation {
                    table,
                    entity_id,
                    kind: ErrorKind::Data,
                    message,
                    processor: processor.to_string(),
                    reset_fields: reset_fields.to_vec(),
                })
                .await?;
            report.errored += 1;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// What one trigger + process step did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The trigger returned nothing.
    Idle,
    /// A batch was processed.
    Processed {
        /// Items in the batch.
        items: usize,
        /// Per-item results.
        report: BatchReport,
        /// Cursor to persist once staged writes are folded.
        next_cursor: Option<Cursor>,
    },
}

/// Object-safe view of a [`Processor`] used by the runner.
#[async_trait]
pub trait ProcessorStep: Send + Sync {
    /// Processor name.
    fn name(&self) -> &str;

    /// Cursor used before anything has been persisted.
    fn initial_cursor(&self) -> Cursor;

    /// Run the trigger and, if it produced work, process the batch.
    async fn step(&self, clients: &Clients, cursor: &Cursor)
        -> Result<StepOutcome, ProcessingError>;
}

struct Erased<P>(P);

#[async_trait]
impl<P: Processor> ProcessorStep for Erased<P> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn initial_cursor(&self) -> Cursor {
        self.0.initial_cursor()
    }

    async fn step(
        &self,
        clients: &Clients,
        cursor: &Cursor,
    ) -> Result<StepOutcome, ProcessingError> {
        let batch = self.0.trigger(clients, cursor).await?;
        if batch.is_idle(cursor) {
            return Ok(StepOutcome::Idle);
        }

        debug!(
            processor = self.0.name(),
            cursor = %cursor,
            items = batch.items.len(),
            "Processing batch"
        );

        let report = self.0.process(&batch, clients).await?;

        Ok(StepOutcome::Processed {
            items: batch.items.len(),
            report,
            next_cursor: batch.next_cursor,
        })
    }
}
