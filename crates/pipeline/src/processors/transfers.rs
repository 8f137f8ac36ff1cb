//! ERC-721 transfer discovery.
//!
//! Scans confirmed blocks in fixed windows for `Transfer` logs of the enabled
//! ERC-721 factories. Each log becomes an `erc721Transfers` row and an owner
//! update on its NFT; mints also create the NFT and the factory's artist.
//! All writes carry the log's chain position as provenance, so replays and
//! out-of-order windows converge to the latest owner.

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use spinsync_core::identifiers::{
    artist_id, controlled_ethereum_address_from_id, ethereum_track_id, ethereum_transfer_id,
    format_ethereum_address,
};
use spinsync_core::ordering::ordinal_for_chain;
use spinsync_core::{EntityRecord, FieldSet, NftFactory, NftStandard, Provenance, Table};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::clients::{Clients, TransferLog};
use crate::processor::{Batch, ProcessingError, Processor};
use crate::storage::Cursor;

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Transfer discovery for one chain.
#[derive(Debug, Clone)]
pub struct Erc721TransfersProcessor {
    name: String,
    chain_id: u64,
    factories: HashMap<String, NftFactory>,
    confirmations: u64,
    block_batch_size: u64,
}

impl Erc721TransfersProcessor {
    /// Scan `factories` on `chain_id`, staying `confirmations` blocks behind
    /// head and covering at most `block_batch_size` blocks per batch.
    pub fn new(
        chain_id: u64,
        factories: Vec<NftFactory>,
        confirmations: u64,
        block_batch_size: u64,
    ) -> Self {
        let factories = factories
            .into_iter()
            .filter(|f| f.enabled && f.standard == NftStandard::Erc721)
            .filter_map(|f| match format_ethereum_address(&f.address) {
                Ok(address) => Some((address, f)),
                Err(e) => {
                    warn!(address = %f.address, "Skipping factory: {}", e);
                    None
                }
            })
            .collect();

        Self {
            name: format!("erc721_transfers_{}", chain_id),
            chain_id,
            factories,
            confirmations,
            block_batch_size: block_batch_size.max(1),
        }
    }

    fn first_block(&self) -> Option<u64> {
        self.factories.values().map(|f| f.starting_block).min()
    }

    fn provenance(&self, log: &TransferLog) -> Provenance {
        Provenance::new(
            ordinal_for_chain(log.block_number, log.tx_index, log.log_index),
            self.name.as_str(),
        )
    }

    fn is_mint(log: &TransferLog) -> bool {
        log.from.eq_ignore_ascii_case(ZERO_ADDRESS)
    }
}

#[async_trait]
impl Processor for Erc721TransfersProcessor {
    type Item = TransferLog;

    fn name(&self) -> &str {
        &self.name
    }

    /// The block before the earliest factory's starting block.
    fn initial_cursor(&self) -> Cursor {
        Cursor::from_block(self.first_block().unwrap_or_default().saturating_sub(1))
    }

    async fn trigger(
        &self,
        clients: &Clients,
        cursor: &Cursor,
    ) -> Result<Batch<TransferLog>, ProcessingError> {
        if self.factories.is_empty() {
            return Ok(Batch::empty());
        }
        if clients.chain.chain_id() != self.chain_id {
            return Err(anyhow!(
                "Chain source is on chain {}, processor expects chain {}",
                clients.chain.chain_id(),
                self.chain_id
            )
            .into());
        }

        let Some(last) = cursor.as_block() else {
            return Err(anyhow!("Cursor '{}' is not a block number", cursor).into());
        };

        let head = clients.chain.head_block().await?;
        let safe = head.saturating_sub(self.confirmations);
        if last >= safe {
            return Ok(Batch::empty());
        }

        let from = last + 1;
        let to = safe.min(last.saturating_add(self.block_batch_size));

        let contracts: Vec<String> = self
            .factories
            .iter()
            .filter(|(_, f)| f.starting_block <= to)
            .map(|(address, _)| address.clone())
            .collect();

        let logs = if contracts.is_empty() {
            Vec::new()
        } else {
            clients.chain.transfer_logs(&contracts, from, to).await?
        };

        let items: Vec<TransferLog> = logs
            .into_iter()
            .filter(|log| {
                self.factories
                    .get(&log.contract)
                    .is_some_and(|f| log.block_number >= f.starting_block)
            })
            .collect();

        debug!(
            processor = %self.name,
            from,
            to,
            transfers = items.len(),
            "Scanned block window"
        );

        Ok(Batch::new(items, Some(Cursor::from_block(to))))
    }

    async fn process_item(
        &self,
        log: &TransferLog,
        clients: &Clients,
    ) -> Result<(), ProcessingError> {
        let transfer_id = ethereum_transfer_id(log.block_number, log.log_index);
        let Some(factory) = self.factories.get(&log.contract) else {
            return Err(ProcessingError::data(
                Table::Erc721Transfers,
                transfer_id,
                format!("Transfer from unknown contract {}", log.contract),
            ));
        };

        let nft_id = ethereum_track_id(&log.contract, &log.token_id).map_err(|e| {
            ProcessingError::data(Table::Erc721Transfers, transfer_id.as_str(), e.to_string())
        })?;
        let provenance = self.provenance(log);
        let storage = &clients.storage;

        let transfer = EntityRecord::new(transfer_id.as_str())
            .with("from", log.from.as_str())
            .with("to", log.to.as_str())
            .with("contractAddress", log.contract.as_str())
            .with("tokenId", log.token_id.as_str())
            .with("nftId", nft_id.as_str())
            .with("createdAtEthereumBlockNumber", log.block_number);
        storage
            .stage_insert(Table::Erc721Transfers, &transfer, &provenance)
            .await?;

        if !Self::is_mint(log) {
            let mut owner = FieldSet::new();
            owner.insert("owner".to_string(), Value::from(log.to.as_str()));
            storage
                .stage_update(Table::Nfts, &nft_id, &owner, &provenance)
                .await?;
            return Ok(());
        }

        let mut nft = EntityRecord::new(nft_id.as_str())
            .with("contractAddress", log.contract.as_str())
            .with("tokenId", log.token_id.as_str())
            .with("platformId", factory.platform_id.as_str())
            .with("standard", "erc721")
            .with("owner", log.to.as_str())
            .with("createdAtEthereumBlockNumber", log.block_number);

        if let Some(artist_address) = &factory.artist_address {
            let id = artist_id(NftStandard::Erc721, artist_address).map_err(|e| {
                ProcessingError::data(Table::Nfts, nft_id.as_str(), e.to_string())
            })?;

            let mut artist = EntityRecord::new(id.as_str());
            if let Some(address) = controlled_ethereum_address_from_id(&id) {
                artist = artist.with("address", address);
            }
            storage
                .stage_insert(Table::Artists, &artist, &provenance)
                .await?;

            nft = nft.with("artistId", id.as_str());
        }

        storage.stage_insert(Table::Nfts, &nft, &provenance).await?;
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
    use spinsync_core::SourcePriority;
    use std::sync::Arc;

    const CONTRACT: &str = "0x1111111111111111111111111111111111111111";
    const ARTIST: &str = "0x2222222222222222222222222222222222222222";
    const ALICE: &str = "0x000000000000000000000000000000000000a11c";
    const BOB: &str = "0x0000000000000000000000000000000000000b0b";

    fn factory() -> NftFactory {
        NftFactory {
            address: CONTRACT.to_string(),
            platform_id: "sound".to_string(),
            standard: NftStandard::Erc721,
            chain_id: Some(1),
            starting_block: 100,
            artist_address: Some(ARTIST.to_string()),
            enabled: true,
        }
    }

    fn transfer(from: &str, to: &str, block: u64, log_index: u64) -> TransferLog {
        TransferLog {
            contract: CONTRACT.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            token_id: "7".to_string(),
            block_number: block,
            tx_index: 0,
            log_index,
        }
    }

    fn processor() -> Erc721TransfersProcessor {
        Erc721TransfersProcessor::new(1, vec![factory()], 5, 50)
    }

    #[tokio::test]
    async fn test_empty_window_still_advances() {
        let (storage, _temp_db) = setup_storage().await;
        let chain = Arc::new(FakeChain::default());
        *chain.head.lock().unwrap() = 1_000;
        let clients = clients(storage, chain, Arc::new(FakeMetadata::default()));

        let processor = processor().boxed();
        let cursor = processor.initial_cursor();
        assert_eq!(cursor, Cursor::from_block(99));

        let outcome = processor.step(&clients, &cursor).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Processed {
                items: 0,
                report: Default::default(),
                next_cursor: Some(Cursor::from_block(149)),
            }
        );
    }

    #[tokio::test]
    async fn test_stops_at_confirmed_head() {
        let (storage, _temp_db) = setup_storage().await;
        let chain = Arc::new(FakeChain::default());
        *chain.head.lock().unwrap() = 120;
        let clients = clients(storage, chain, Arc::new(FakeMetadata::default()));
        let processor = processor();

        let batch = processor
            .trigger(&clients, &Cursor::from_block(99))
            .await
            .unwrap();
        assert_eq!(batch.next_cursor, Some(Cursor::from_block(115)));

        let batch = processor
            .trigger(&clients, &Cursor::from_block(115))
            .await
            .unwrap();
        assert!(batch.is_idle(&Cursor::from_block(115)));
    }

    #[tokio::test]
    async fn test_mint_then_transfer() {
        let (storage, _temp_db) = setup_storage().await;
        let chain = Arc::new(FakeChain::default());
        *chain.head.lock().unwrap() = 200;
        chain.logs.lock().unwrap().extend([
            transfer(ZERO_ADDRESS, ALICE, 100, 0),
            transfer(ALICE, BOB, 105, 3),
        ]);
        let clients = clients(storage.clone(), chain, Arc::new(FakeMetadata::default()));
        let processor = processor();

        let batch = processor
            .trigger(&clients, &Cursor::from_block(99))
            .await
            .unwrap();
        assert_eq!(batch.items.len(), 2);

        // Later transfer first: the owner must still end up as BOB.
        for log in batch.items.iter().rev() {
            processor.process_item(log, &clients).await.unwrap();
        }
        MergeEngine::new(storage.clone(), SourcePriority::default())
            .drain()
            .await
            .unwrap();

        let nft_id = format!("ethereum/{}/7", CONTRACT);
        let nft = storage.get_record(Table::Nfts, &nft_id).await.unwrap().unwrap();
        assert_eq!(nft.get_str("owner"), Some(BOB));
        assert_eq!(nft.get_str("platformId"), Some("sound"));
        assert_eq!(nft.get_str("artistId"), Some(format!("ethereum/{}", ARTIST).as_str()));
        assert_eq!(nft.get("createdAtEthereumBlockNumber"), Some(&Value::from(100)));

        let artist = storage
            .get_record(Table::Artists, &format!("ethereum/{}", ARTIST))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artist.get_str("address"), Some(ARTIST));

        let transfer = storage
            .get_record(Table::Erc721Transfers, "ethereum/105/3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transfer.get_str("nftId"), Some(nft_id.as_str()));
        assert_eq!(transfer.get_str("from"), Some(ALICE));
    }

    #[tokio::test]
    async fn test_logs_before_starting_block_ignored() {
        let (storage, _temp_db) = setup_storage().await;
        let chain = Arc::new(FakeChain::default());
        *chain.head.lock().unwrap() = 200;
        chain
            .logs
            .lock()
            .unwrap()
            .push(transfer(ZERO_ADDRESS, ALICE, 60, 0));
        let clients = clients(storage, chain, Arc::new(FakeMetadata::default()));

        let batch = processor()
            .trigger(&clients, &Cursor::from_block(40))
            .await
            .unwrap();
        assert!(batch.items.is_empty());
        assert_eq!(batch.next_cursor, Some(Cursor::from_block(90)));
    }

    #[tokio::test]
    async fn test_offline_chain_is_transient() {
        let (storage, _temp_db) = setup_storage().await;
        let chain = Arc::new(FakeChain::default());
        *chain.offline.lock().unwrap() = true;
        let clients = clients(storage, chain, Arc::new(FakeMetadata::default()));

        let err = processor()
            .trigger(&clients, &Cursor::from_block(99))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
