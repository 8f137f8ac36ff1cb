//! JSON-RPC chain client.

use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use anyhow::{Context, Result};
use async_trait::async_trait;
use spinsync_core::identifiers::format_ethereum_address;
use std::str::FromStr;
use tracing::warn;

use super::{ChainSource, TransferLog};

sol! {
    /// ERC-721 Transfer event. `tokenId` is indexed, unlike the ERC-20 event
    /// with the same signature hash.
    #[derive(Debug, PartialEq, Eq)]
    event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);

    #[sol(rpc)]
    interface IERC721Metadata {
        function tokenURI(uint256 tokenId) external view returns (string);
    }
}

impl TransferLog {
    /// Decode an ERC-721 `Transfer` from an RPC log.
    pub fn from_log(log: &Log) -> Result<Self> {
        let event =
            Transfer::decode_log(log.as_ref(), true).context("Failed to decode Transfer event")?;

        let block_number = log.block_number.context("Log missing block_number")?;
        let tx_index = log
            .transaction_index
            .context("Log missing transaction_index")?;
        let log_index = log.log_index.context("Log missing log_index")?;

        Ok(Self {
            contract: format_ethereum_address(&log.address().to_string())?,
            from: format_ethereum_address(&event.from.to_string())?,
            to: format_ethereum_address(&event.to.to_string())?,
            token_id: event.tokenId.to_string(),
            block_number,
            tx_index,
            log_index,
        })
    }
}

/// HTTP RPC chain source.
#[derive(Clone)]
pub struct RpcChainSource {
    provider: RootProvider<Http<Client>>,
    chain_id: u64,
}

impl RpcChainSource {
    /// Connect to an RPC endpoint.
    pub async fn new(rpc_url: &str, chain_id: u64) -> Result<Self> {
        let url = rpc_url
            .parse()
            .with_context(|| format!("Invalid RPC URL: {}", rpc_url))?;

        let provider = ProviderBuilder::new().on_http(url);

        Ok(Self { provider, chain_id })
    }
}

#[async_trait]
impl ChainSource for RpcChainSource {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn head_block(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .context("Failed to get block number")
    }

    async fn transfer_logs(
        &self,
        contracts: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>> {
        if contracts.is_empty() {
            return Ok(Vec::new());
        }

        let addresses = contracts
            .iter()
            .map(|c| Address::from_str(c).with_context(|| format!("Invalid contract: {}", c)))
            .collect::<Result<Vec<_>>>()?;

        let filter = Filter::new()
            .address(addresses)
            .event_signature(Transfer::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let logs: Vec<Log> = self
            .provider
            .get_logs(&filter)
            .await
            .context("Failed to fetch logs from RPC")?;

        let mut transfers = Vec::with_capacity(logs.len());
        for log in &logs {
            match TransferLog::from_log(log) {
                Ok(transfer) => transfers.push(transfer),
                // ERC-20 transfers share the topic but not the indexed layout.
                Err(e) => warn!("Skipping non ERC-721 Transfer log: {}", e),
            }
        }
        transfers.sort_by_key(|t| (t.block_number, t.tx_index, t.log_index));

        Ok(transfers)
    }

    async fn token_uri(&self, contract: &str, token_id: &str) -> Result<Option<String>> {
        let address =
            Address::from_str(contract).with_context(|| format!("Invalid contract: {}", contract))?;
        let token_id =
            U256::from_str(token_id).with_context(|| format!("Invalid token id: {}", token_id))?;

        let contract = IERC721Metadata::new(address, &self.provider);
        match contract.tokenURI(token_id).call().await {
            Ok(uri) => Ok(Some(uri._0)),
            Err(alloy::contract::Error::TransportError(e)) if e.as_error_resp().is_some() => {
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to call tokenURI"),
        }
    }
}
