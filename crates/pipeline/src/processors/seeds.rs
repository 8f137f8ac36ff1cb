//! Stages configured platforms and NFT factories.
//!
//! The cursor is a content marker of the seed configuration, so seeds are
//! staged once per distinct configuration rather than on every run.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use spinsync_core::hashing::content_marker;
use spinsync_core::identifiers::{format_ethereum_address, format_solana_address};
use spinsync_core::{EntityRecord, NftFactory, NftStandard, Platform, Table};

use super::wall_clock_provenance;
use crate::clients::Clients;
use crate::config::SeedsConfig;
use crate::processor::{Batch, ProcessingError, Processor};
use crate::storage::Cursor;

/// One seed row destined for a canonical table.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedRecord {
    /// Target table.
    pub table: Table,
    /// Record to insert.
    pub record: EntityRecord,
}

/// Processor that stages the seed configuration.
#[derive(Debug, Clone)]
pub struct InsertSeedsProcessor {
    seeds: SeedsConfig,
}

impl InsertSeedsProcessor {
    /// Stage the given seeds.
    pub fn new(seeds: SeedsConfig) -> Self {
        Self { seeds }
    }

    fn records(&self) -> anyhow::Result<Vec<SeedRecord>> {
        let mut records: Vec<SeedRecord> = self
            .seeds
            .platforms
            .iter()
            .map(|platform| SeedRecord {
                table: Table::Platforms,
                record: platform_record(platform),
            })
            .collect();

        for factory in &self.seeds.nft_factories {
            records.push(SeedRecord {
                table: Table::NftFactories,
                record: factory_record(factory)?,
            });
        }

        Ok(records)
    }
}

fn platform_record(platform: &Platform) -> EntityRecord {
    EntityRecord::new(&platform.id)
        .with("name", platform.name.as_str())
        .with("type", platform.platform_type.as_str())
}

fn factory_record(factory: &NftFactory) -> anyhow::Result<EntityRecord> {
    let address = match factory.standard {
        NftStandard::Erc721 => format_ethereum_address(&factory.address),
        NftStandard::Metaplex => format_solana_address(&factory.address),
    }
    .with_context(|| format!("Invalid seed factory address {}", factory.address))?;

    let standard = serde_json::to_value(factory.standard)?;
    let mut record = EntityRecord::new(&address)
        .with("address", address.as_str())
        .with("platformId", factory.platform_id.as_str())
        .with("standard", standard)
        .with("startingBlock", factory.starting_block)
        .with("enabled", factory.enabled);

    if let Some(chain_id) = factory.chain_id {
        record = record.with("chainId", chain_id);
    }
    if let Some(artist) = &factory.artist_address {
        record = record.with("artistAddress", Value::from(artist.to_lowercase()));
    }

    Ok(record)
}

#[async_trait]
impl Processor for InsertSeedsProcessor {
    type Item = SeedRecord;

    fn name(&self) -> &str {
        "insert_seeds"
    }

    fn initial_cursor(&self) -> Cursor {
        Cursor::new("")
    }

    async fn trigger(
        &self,
        _clients: &Clients,
        cursor: &Cursor,
    ) -> Result<Batch<SeedRecord>, ProcessingError> {
        let marker = content_marker(&self.seeds).map_err(anyhow::Error::from)?;
        if cursor.as_str() == marker {
            return Ok(Batch::empty());
        }

        Ok(Batch::new(self.records()?, Some(Cursor::new(marker))))
    }

    async fn process_item(
        &self,
        item: &SeedRecord,
        clients: &Clients,
    ) -> Result<(), ProcessingError> {
        clients
            .storage
            .stage_insert(item.table, &item.record, &wall_clock_provenance(self.name()))
            .await?;
        Ok(())
    }
}
