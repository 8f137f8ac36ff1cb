//! Automatic reset of error annotations.

use async_trait::async_trait;
use tracing::debug;

use crate::clients::Clients;
use crate::processor::{Batch, ProcessingError, Processor};
use crate::storage::{now_unix, Cursor};

/// One reset sweep over annotations last touched at or before `cutoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSweep {
    /// Unix timestamp bounding the sweep.
    pub cutoff: i64,
    /// Annotations waiting to be reset when the sweep was planned.
    pub pending: usize,
}

/// Hands annotated entities back to their processors.
///
/// Only annotations that have been quiet for `retry_after_secs` are reset, so
/// a failing entity is retried once per cooldown rather than once per pass.
#[derive(Debug, Clone)]
pub struct ErrorResetProcessor {
    max_resets: u32,
    retry_after_secs: u64,
}

impl ErrorResetProcessor {
    /// Reset annotations up to `max_resets` times, `retry_after_secs` apart.
    pub fn new(max_resets: u32, retry_after_secs: u64) -> Self {
        Self {
            max_resets,
            retry_after_secs,
        }
    }
}

#[async_trait]
impl Processor for ErrorResetProcessor {
    type Item = ResetSweep;

    fn name(&self) -> &str {
        "error_reset"
    }

    fn initial_cursor(&self) -> Cursor {
        Cursor::new("")
    }

    async fn trigger(
        &self,
        clients: &Clients,
        _cursor: &Cursor,
    ) -> Result<Batch<ResetSweep>, ProcessingError> {
        let cooldown = i64::try_from(self.retry_after_secs).unwrap_or(i64::MAX);
        let cutoff = now_unix().saturating_sub(cooldown);

        let pending = clients.storage.resettable_errors(Some(cutoff)).await?.len();
        if pending == 0 {
            return Ok(Batch::empty());
        }

        debug!(pending, cutoff, "Error annotations due for reset");
        Ok(Batch::new(vec![ResetSweep { cutoff, pending }], None))
    }

    async fn process_item(
        &self,
        sweep: &ResetSweep,
        clients: &Clients,
    ) -> Result<(), ProcessingError> {
        clients
            .storage
            .reset_errors_before(self.max_resets, Some(sweep.cutoff))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::test_support::{clients, FakeChain, FakeMetadata};
    use crate::processor::StepOutcome;
    use crate::storage::test_support::setup_storage;
    use crate::storage::{ErrorKind, ErrorStatus, NewErrorAnnotation};
    use spinsync_core::Table;
    use std::sync::Arc;

    fn annotation(entity_id: &str) -> NewErrorAnnotation {
        NewErrorAnnotation {
            table: Table::Nfts,
            entity_id: entity_id.to_string(),
            kind: ErrorKind::Data,
            message: "404".to_string(),
            processor: "nft_metadata".to_string(),
            reset_fields: vec!["metadata".to_string()],
        }
    }

    #[tokio::test]
    async fn test_resets_due_annotations() {
        let (storage, _temp_db) = setup_storage().await;
        let clients = clients(
            storage.clone(),
            Arc::new(FakeChain::default()),
            Arc::new(FakeMetadata::default()),
        );
        storage.annotate_error(&annotation("nft/1")).await.unwrap();

        let processor = ErrorResetProcessor::new(3, 0).boxed();
        let cursor = processor.initial_cursor();
        let outcome = processor.step(&clients, &cursor).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Processed { items: 1, .. }));

        let reset = storage.get_error(Table::Nfts, "nft/1").await.unwrap().unwrap();
        assert_eq!(reset.status, ErrorStatus::Reset);
        assert_eq!(reset.reset_count, 1);

        assert_eq!(
            processor.step(&clients, &cursor).await.unwrap(),
            StepOutcome::Idle
        );
    }

    #[tokio::test]
    async fn test_cooldown_defers_reset() {
        let (storage, _temp_db) = setup_storage().await;
        let clients = clients(
            storage.clone(),
            Arc::new(FakeChain::default()),
            Arc::new(FakeMetadata::default()),
        );
        storage.annotate_error(&annotation("nft/1")).await.unwrap();

        let processor = ErrorResetProcessor::new(3, 3_600).boxed();
        assert_eq!(
            processor
                .step(&clients, &processor.initial_cursor())
                .await
                .unwrap(),
            StepOutcome::Idle
        );
        assert!(storage.has_active_error(Table::Nfts, "nft/1").await.unwrap());
    }
}
