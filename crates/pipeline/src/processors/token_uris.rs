//! Token URI backfill for canonical NFTs.

use async_trait::async_trait;
use serde_json::Value;
use spinsync_core::{FieldSet, Table};

use super::wall_clock_provenance;
use crate::clients::Clients;
use crate::processor::{Batch, ProcessingError, Processor};
use crate::storage::{CanonicalRecord, Cursor};

/// Reads `tokenURI(tokenId)` for NFTs that have none yet.
///
/// The trigger only returns NFTs still lacking the field, so the cursor never
/// moves; finished and annotated NFTs drop out of the query by themselves.
#[derive(Debug, Clone)]
pub struct TokenUriProcessor {
    batch_size: u32,
}

impl TokenUriProcessor {
    /// Fetch up to `batch_size` URIs per batch.
    pub fn new(batch_size: u32) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl Processor for TokenUriProcessor {
    type Item = CanonicalRecord;

    fn name(&self) -> &str {
        "erc721_token_uris"
    }

    fn initial_cursor(&self) -> Cursor {
        Cursor::new("")
    }

    fn reset_fields(&self) -> Vec<String> {
        vec!["tokenURI".to_string()]
    }

    async fn trigger(
        &self,
        clients: &Clients,
        _cursor: &Cursor,
    ) -> Result<Batch<CanonicalRecord>, ProcessingError> {
        let nfts = clients
            .storage
            .records_missing_field(
                Table::Nfts,
                "tokenURI",
                Some("contractAddress"),
                None,
                self.batch_size,
            )
            .await?;

        Ok(Batch::new(nfts, None))
    }

    async fn process_item(
        &self,
        nft: &CanonicalRecord,
        clients: &Clients,
    ) -> Result<(), ProcessingError> {
        let contract = nft.get_str("contractAddress");
        let token_id = nft.get_str("tokenId");
        let (Some(contract), Some(token_id)) = (contract, token_id) else {
            return Err(ProcessingError::data(
                Table::Nfts,
                nft.id.as_str(),
                "NFT has no contract address or token id",
            ));
        };

        let Some(uri) = clients.chain.token_uri(contract, token_id).await? else {
            return Err(ProcessingError::data(
                Table::Nfts,
                nft.id.as_str(),
                format!("tokenURI({}) reverted on {}", token_id, contract),
            ));
        };

        let mut fields = FieldSet::new();
        fields.insert("tokenURI".to_string(), Value::from(uri));
        clients
            .storage
            .stage_update(Table::Nfts, &nft.id, &fields, &wall_clock_provenance(self.name()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::test_support::{clients, FakeChain, FakeMetadata};
    use crate::merge::MergeEngine;
    use crate::processor::StepOutcome;
    use crate::storage::test_support::setup_storage;
    use spinsync_core::{EntityRecord, Provenance, SourcePriority};
    use std::sync::Arc;

    const CONTRACT: &str = "0x1111111111111111111111111111111111111111";

    async fn seed_nft(clients: &Clients, token_id: &str) -> String {
        let id = format!("ethereum/{}/{}", CONTRACT, token_id);
        let nft = EntityRecord::new(id.as_str())
            .with("contractAddress", CONTRACT)
            .with("tokenId", token_id);
        clients
            .storage
            .stage_insert(Table::Nfts, &nft, &Provenance::new(1, "test"))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_backfills_and_annotates_reverts() {
        let (storage, _temp_db) = setup_storage().await;
        let chain = Arc::new(FakeChain::default());
        chain.token_uris.lock().unwrap().insert(
            (CONTRACT.to_string(), "1".to_string()),
            Some("ipfs://QmOne".to_string()),
        );
        chain
            .token_uris
            .lock()
            .unwrap()
            .insert((CONTRACT.to_string(), "2".to_string()), None);
        let clients = clients(storage.clone(), chain, Arc::new(FakeMetadata::default()));
        let merge = MergeEngine::new(storage.clone(), SourcePriority::default());

        let one = seed_nft(&clients, "1").await;
        let two = seed_nft(&clients, "2").await;
        merge.drain().await.unwrap();

        let processor = TokenUriProcessor::new(10).boxed();
        let cursor = processor.initial_cursor();
        let StepOutcome::Processed { report, next_cursor, .. } =
            processor.step(&clients, &cursor).await.unwrap()
        else {
            panic!("expected a batch");
        };
        assert_eq!(report.processed, 1);
        assert_eq!(report.errored, 1);
        assert_eq!(next_cursor, None);
        merge.drain().await.unwrap();

        let nft = storage.get_record(Table::Nfts, &one).await.unwrap().unwrap();
        assert_eq!(nft.get_str("tokenURI"), Some("ipfs://QmOne"));
        assert!(storage.has_active_error(Table::Nfts, &two).await.unwrap());

        // Both NFTs are now out of the trigger's reach.
        assert_eq!(
            processor.step(&clients, &cursor).await.unwrap(),
            StepOutcome::Idle
        );
    }

    #[tokio::test]
    async fn test_rpc_failure_is_transient() {
        let (storage, _temp_db) = setup_storage().await;
        let chain = Arc::new(FakeChain::default());
        let clients = clients(storage.clone(), chain.clone(), Arc::new(FakeMetadata::default()));

        seed_nft(&clients, "1").await;
        MergeEngine::new(storage, SourcePriority::default())
            .drain()
            .await
            .unwrap();

        *chain.offline.lock().unwrap() = true;
        let processor = TokenUriProcessor::new(10).boxed();
        let err = processor
            .step(&clients, &processor.initial_cursor())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
