//! Metadata enrichment for NFTs with a token URI.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use spinsync_core::{FieldSet, Table};

use super::wall_clock_provenance;
use crate::clients::metadata::ipfs_hash;
use crate::clients::Clients;
use crate::processor::{record_item_outcome, Batch, BatchReport, ProcessingError, Processor};
use crate::storage::{CanonicalRecord, Cursor};

/// Fetches the JSON document behind each NFT's `tokenURI`.
///
/// Every fetch failure is pinned on the NFT as a data error: a dead gateway
/// and a dead link look the same from here, and the reset sweep retries both.
#[derive(Debug, Clone)]
pub struct NftMetadataProcessor {
    batch_size: u32,
    concurrency: usize,
}

impl NftMetadataProcessor {
    /// Fetch up to `batch_size` documents per batch, `concurrency` at a time.
    pub fn new(batch_size: u32, concurrency: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
        }
    }
}

#[async_trait]
impl Processor for NftMetadataProcessor {
    type Item = CanonicalRecord;

    fn name(&self) -> &str {
        "nft_metadata"
    }

    fn initial_cursor(&self) -> Cursor {
        Cursor::new("")
    }

    fn reset_fields(&self) -> Vec<String> {
        ["metadata", "metadataIPFSHash", "mimeType"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn trigger(
        &self,
        clients: &Clients,
        _cursor: &Cursor,
    ) -> Result<Batch<CanonicalRecord>, ProcessingError> {
        let nfts = clients
            .storage
            .records_missing_field(Table::Nfts, "metadata", Some("tokenURI"), None, self.batch_size)
            .await?;

        Ok(Batch::new(nfts, None))
    }

    async fn process_item(
        &self,
        nft: &CanonicalRecord,
        clients: &Clients,
    ) -> Result<(), ProcessingError> {
        let Some(uri) = nft.get_str("tokenURI") else {
            return Err(ProcessingError::data(
                Table::Nfts,
                nft.id.as_str(),
                "NFT has no tokenURI",
            ));
        };

        let metadata = clients
            .metadata
            .fetch_json(uri)
            .await
            .map_err(|e| ProcessingError::data(Table::Nfts, nft.id.as_str(), format!("{:#}", e)))?;
        if !metadata.is_object() {
            return Err(ProcessingError::data(
                Table::Nfts,
                nft.id.as_str(),
                format!("Metadata at {} is not a JSON object", uri),
            ));
        }

        let mut fields = FieldSet::new();
        if let Some(mime_type) = metadata.get("mimeType").and_then(Value::as_str) {
            fields.insert("mimeType".to_string(), Value::from(mime_type));
        }
        if let Some(hash) = ipfs_hash(uri) {
            fields.insert("metadataIPFSHash".to_string(), Value::from(hash));
        }
        fields.insert("metadata".to_string(), metadata);

        clients
            .storage
            .stage_update(Table::Nfts, &nft.id, &fields, &wall_clock_provenance(self.name()))
            .await?;
        Ok(())
    }

    async fn process(
        &self,
        batch: &Batch<CanonicalRecord>,
        clients: &Clients,
    ) -> Result<BatchReport, ProcessingError> {
        let pending: Vec<_> = batch
            .items
            .iter()
            .map(|nft| self.process_item(nft, clients))
            .collect();
        let outcomes: Vec<Result<(), ProcessingError>> = stream::iter(pending)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let reset_fields = self.reset_fields();
        let mut report = BatchReport::default();
        for outcome in outcomes {
            record_item_outcome(self.name(), &reset_fields, outcome, clients, &mut report).await?;
        }

        Ok(report)
    }
}
