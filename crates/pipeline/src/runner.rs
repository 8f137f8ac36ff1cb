//! Runner: drives an ordered list of processors to a fixpoint.
//!
//! Each processor is run batch after batch until its trigger comes back empty,
//! then the next one takes over. After every batch the merge engine drains the
//! mempool and the processor's cursor is advanced. Whole passes repeat until a
//! pass finds no work anywhere.

use spinsync_core::Table;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clients::Clients;
use crate::merge::{DrainReport, MergeEngine};
use crate::processor::{record_item_outcome, BatchReport, ProcessorStep, StepOutcome};
use crate::storage::Cursor;

/// Errors that stop a run outright.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Two processors share a name, so they would share a cursor.
    #[error("Duplicate processor name: {0}")]
    DuplicateProcessor(String),

    /// The store failed.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Bounds on a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Maximum full passes over the processor list.
    pub max_passes: u32,
    /// Maximum batches per processor within one pass.
    pub max_batches_per_processor: u32,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_passes: 10,
            max_batches_per_processor: 1_000,
        }
    }
}

/// Activity of one processor over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorRun {
    /// Batches processed.
    pub batches: u64,
    /// Items seen.
    pub items: u64,
    /// Item results.
    pub results: BatchReport,
    /// Whether a transient error stopped this processor.
    pub failed: bool,
}

/// Summary of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Whether the run reached a pass with no work at all.
    pub completed: bool,
    /// Passes started.
    pub passes: u32,
    /// Per-processor activity, in processor order.
    pub processors: Vec<(String, ProcessorRun)>,
    /// Entities touched and errored per table.
    pub tables: DrainReport,
}

impl RunReport {
    /// Activity of a processor by name.
    pub fn processor(&self, name: &str) -> Option<&ProcessorRun> {
        self.processors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, run)| run)
    }
}

/// Sequential, cooperative scheduler over processors.
#[derive(Debug, Clone)]
pub struct Runner {
    merge: MergeEngine,
    limits: RunLimits,
    cancel: CancellationToken,
}

impl Runner {
    /// Create a runner.
    pub fn new(merge: MergeEngine, limits: RunLimits) -> Self {
        Self {
            merge,
            limits,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between batches once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every processor to completion.
    ///
    /// Returns `true` when a whole pass found no work, `false` when the run
    /// stopped early (pass or batch bound, transient error, cancellation).
    pub async fn run(
        &self,
        processors: &[Box<dyn ProcessorStep>],
        clients: &Clients,
    ) -> Result<bool, RunnerError> {
        Ok(self.run_with_report(processors, clients).await?.completed)
    }

    /// Like [`Runner::run`], returning the full report.
    pub async fn run_with_report(
        &self,
        processors: &[Box<dyn ProcessorStep>],
        clients: &Clients,
    ) -> Result<RunReport, RunnerError> {
        check_unique_names(processors)?;

        let mut report = RunReport {
            processors: processors
                .iter()
                .map(|p| (p.name().to_string(), ProcessorRun::default()))
                .collect(),
            ..Default::default()
        };

        // Writes left behind by an interrupted run are folded before anything
        // reads canonical state.
        report.tables.absorb(&self.merge.drain().await?);

        while report.passes < self.limits.max_passes {
            if self.cancel.is_cancelled() {
                break;
            }
            report.passes += 1;

            let mut idle = true;
            for (index, processor) in processors.iter().enumerate() {
                let worked = self
                    .run_processor(processor.as_ref(), clients, &mut report, index)
                    .await?;
                idle &= !worked;

                if self.cancel.is_cancelled() {
                    break;
                }
            }

            if idle && !self.cancel.is_cancelled() {
                report.completed = true;
                break;
            }
            if report.processors.iter().any(|(_, run)| run.failed) {
                break;
            }
        }

        self.log_report(&report, clients).await?;
        Ok(report)
    }

    /// Run one processor until its trigger is empty, a bound is hit or it
    /// fails. Returns whether any work was seen.
    async fn run_processor(
        &self,
        processor: &dyn ProcessorStep,
        clients: &Clients,
        report: &mut RunReport,
        index: usize,
    ) -> Result<bool, RunnerError> {
        let name = processor.name();
        let mut batches = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(batches > 0);
            }
            if batches >= self.limits.max_batches_per_processor {
                debug!(processor = name, batches, "Batch limit reached for this pass");
                return Ok(true);
            }

            let cursor = clients
                .storage
                .get_cursor(name)
                .await?
                .unwrap_or_else(|| processor.initial_cursor());

            match processor.step(clients, &cursor).await {
                Ok(StepOutcome::Idle) => return Ok(batches > 0),
                Ok(StepOutcome::Processed {
                    items,
                    report: batch,
                    next_cursor,
                }) => {
                    batches += 1;

                    report.tables.absorb(&self.merge.drain().await?);
                    if let Some(next) = next_cursor {
                        self.advance_cursor(name, &cursor, &next, clients).await?;
                    }

                    let run = &mut report.processors[index].1;
                    run.batches += 1;
                    run.items += items as u64;
                    run.results.processed += batch.processed;
                    run.results.errored += batch.errored;
                }
                Err(e) if e.is_transient() => {
                    warn!(processor = name, cursor = %cursor, "Stopping processor for this run: {}", e);
                    report.processors[index].1.failed = true;
                    return Ok(true);
                }
                Err(e) => {
                    // A trigger pinned the failure on a single entity.
                    let mut batch = BatchReport::default();
                    record_item_outcome(name, &[], Err(e), clients, &mut batch)
                        .await
                        .map_err(|e| RunnerError::Storage(e.into()))?;
                    report.processors[index].1.results.errored += batch.errored;
                    return Ok(true);
                }
            }
        }
    }

    async fn advance_cursor(
        &self,
        name: &str,
        current: &Cursor,
        next: &Cursor,
        clients: &Clients,
    ) -> Result<(), RunnerError> {
        if let (Some(from), Some(to)) = (current.as_block(), next.as_block()) {
            if to < from {
                error!(processor = name, from, to, "Refusing to move a block cursor backwards");
                return Ok(());
            }
        }

        clients.storage.set_cursor(name, next).await?;
        debug!(processor = name, cursor = %next, "Cursor advanced");
        Ok(())
    }

    async fn log_report(&self, report: &RunReport, clients: &Clients) -> Result<(), RunnerError> {
        for (name, run) in &report.processors {
            if run.batches > 0 || run.failed {
                info!(
                    processor = %name,
                    batches = run.batches,
                    items = run.items,
                    processed = run.results.processed,
                    errored = run.results.errored,
                    failed = run.failed,
                    "Processor summary"
                );
            }
        }

        for (table, counts) in &report.tables.tables {
            info!(
                table = %table,
                touched = counts.touched,
                errored = counts.errored,
                deferred = counts.deferred,
                "Table summary"
            );
        }

        for table in [Table::Nfts, Table::Artists, Table::ProcessedTracks] {
            let count = clients.storage.count_canonical(table).await?;
            info!("DB has {} {}", count, table);
        }

        info!(
            completed = report.completed,
            passes = report.passes,
            "Run finished"
        );
        Ok(())
    }
}

fn check_unique_names(processors: &[Box<dyn ProcessorStep>]) -> Result<(), RunnerError> {
    let mut seen = HashSet::new();
    for processor in processors {
        if !seen.insert(processor.name()) {
            return Err(RunnerError::DuplicateProcessor(processor.name().to_string()));
        }
    }
    Ok(())
}

/// Re-run the pipeline every `interval` until `cancel` fires.
///
/// Failed runs are logged and retried on the next tick. A run in progress
/// finishes its current batch before the loop exits.
pub async fn poll_loop(
    runner: &Runner,
    processors: &[Box<dyn ProcessorStep>],
    clients: &Clients,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), RunnerError> {
    check_unique_names(processors)?;
    info!(interval_secs = interval.as_secs(), "Poll loop starting");

    while !cancel.is_cancelled() {
        match runner.run(processors, clients).await {
            Ok(true) => debug!("Pipeline caught up"),
            Ok(false) => info!("Pipeline has more work, continuing next tick"),
            Err(RunnerError::DuplicateProcessor(name)) => {
                return Err(RunnerError::DuplicateProcessor(name));
            }
            Err(e) => error!("Pipeline run failed: {:#}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Poll loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::test_support::{clients, FakeChain, FakeMetadata};
    use crate::processor::{Batch, ProcessingError, Processor};
    use crate::storage::test_support::setup_storage;
    use crate::storage::Storage;
    use async_trait::async_trait;
    use spinsync_core::{EntityRecord, Provenance, SourcePriority};
    use std::sync::Arc;

    /// Always has one more block to cover.
    struct Endless;

    #[async_trait]
    impl Processor for Endless {
        type Item = u64;

        fn name(&self) -> &str {
            "endless"
        }

        fn initial_cursor(&self) -> Cursor {
            Cursor::from_block(0)
        }

        async fn trigger(
            &self,
            _clients: &Clients,
            cursor: &Cursor,
        ) -> Result<Batch<u64>, ProcessingError> {
            let next = cursor.as_block().unwrap_or(0) + 1;
            Ok(Batch::new(vec![next], Some(Cursor::from_block(next))))
        }

        async fn process_item(&self, item: &u64, clients: &Clients) -> Result<(), ProcessingError> {
            let record = EntityRecord::new(format!("block/{}", item));
            clients
                .storage
                .stage_insert(Table::ProcessedTracks, &record, &Provenance::new(*item, "endless"))
                .await?;
            Ok(())
        }
    }

    /// Asks to move its cursor back to block 1.
    struct Rewinder;

    #[async_trait]
    impl Processor for Rewinder {
        type Item = ();

        fn name(&self) -> &str {
            "rewinder"
        }

        fn initial_cursor(&self) -> Cursor {
            Cursor::from_block(10)
        }

        async fn trigger(
            &self,
            _clients: &Clients,
            cursor: &Cursor,
        ) -> Result<Batch<()>, ProcessingError> {
            if cursor.as_block() == Some(10) {
                Ok(Batch::new(vec![()], Some(Cursor::from_block(1))))
            } else {
                Ok(Batch::empty())
            }
        }

        async fn process_item(&self, _item: &(), _clients: &Clients) -> Result<(), ProcessingError> {
            Ok(())
        }
    }

    fn runner(storage: &Storage, limits: RunLimits) -> Runner {
        Runner::new(
            MergeEngine::new(storage.clone(), SourcePriority::default()),
            limits,
        )
    }

    fn test_clients(storage: &Storage) -> Clients {
        clients(
            storage.clone(),
            Arc::new(FakeChain::default()),
            Arc::new(FakeMetadata::default()),
        )
    }

    #[tokio::test]
    async fn test_bounds_stop_run() {
        let (storage, _temp_db) = setup_storage().await;
        let clients = test_clients(&storage);
        let limits = RunLimits {
            max_passes: 2,
            max_batches_per_processor: 3,
        };

        let report = runner(&storage, limits)
            .run_with_report(&[Endless.boxed()], &clients)
            .await
            .unwrap();

        assert!(!report.completed);
        assert_eq!(report.passes, 2);
        assert_eq!(report.processor("endless").unwrap().batches, 6);
        assert_eq!(
            storage.get_cursor("endless").await.unwrap(),
            Some(Cursor::from_block(6))
        );
        assert_eq!(storage.count_canonical(Table::ProcessedTracks).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_cancelled_run_does_no_work() {
        let (storage, _temp_db) = setup_storage().await;
        let clients = test_clients(&storage);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let completed = runner(&storage, RunLimits::default())
            .with_cancellation(cancel)
            .run(&[Endless.boxed()], &clients)
            .await
            .unwrap();

        assert!(!completed);
        assert_eq!(storage.get_cursor("endless").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_block_cursor_never_moves_backwards() {
        let (storage, _temp_db) = setup_storage().await;
        let clients = test_clients(&storage);
        let limits = RunLimits {
            max_passes: 1,
            max_batches_per_processor: 1,
        };

        runner(&storage, limits)
            .run(&[Rewinder.boxed()], &clients)
            .await
            .unwrap();

        assert_eq!(storage.get_cursor("rewinder").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_poll_loop_stops_on_cancel() {
        let (storage, _temp_db) = setup_storage().await;
        let clients = test_clients(&storage);
        let cancel = CancellationToken::new();
        let limits = RunLimits {
            max_passes: 1,
            max_batches_per_processor: 1,
        };
        let runner = runner(&storage, limits).with_cancellation(cancel.clone());
        let processors = vec![Endless.boxed()];

        let stopper = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        poll_loop(
            &runner,
            &processors,
            &clients,
            Duration::from_secs(3_600),
            cancel,
        )
        .await
        .unwrap();
        handle.await.unwrap();
    }
}
