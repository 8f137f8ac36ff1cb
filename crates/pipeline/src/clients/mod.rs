//! External collaborators reached by processors.
//!
//! Processors only see the traits below, bundled with the store in
//! [`Clients`]. Concrete implementations live in the submodules; tests plug in
//! in-process fakes.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::storage::Storage;

pub mod chain;
pub mod metadata;

pub use chain::RpcChainSource;
pub use metadata::HttpMetadataSource;

/// An ERC-721 `Transfer` log with its chain position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    /// Emitting contract, lower-case hex.
    pub contract: String,
    /// Previous owner, lower-case hex.
    pub from: String,
    /// New owner, lower-case hex.
    pub to: String,
    /// Token id in decimal.
    pub token_id: String,
    /// Block number.
    pub block_number: u64,
    /// Transaction index within the block.
    pub tx_index: u64,
    /// Log index within the block.
    pub log_index: u64,
}

/// Read access to an EVM chain.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Chain id this source talks to.
    fn chain_id(&self) -> u64;

    /// Latest block number.
    async fn head_block(&self) -> Result<u64>;

    /// ERC-721 transfers emitted by `contracts` in `[from_block, to_block]`,
    /// ordered by chain position.
    async fn transfer_logs(
        &self,
        contracts: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>>;

    /// `tokenURI(tokenId)` of a contract.
    ///
    /// `Ok(None)` means the contract answered with a revert, which is a
    /// property of the token rather than of the connection.
    async fn token_uri(&self, contract: &str, token_id: &str) -> Result<Option<String>>;
}

/// Off-chain JSON documents (HTTP and IPFS).
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Fetch and parse the JSON document behind `uri`.
    async fn fetch_json(&self, uri: &str) -> Result<Value>;
}

/// Everything a processor may talk to.
#[derive(Clone)]
pub struct Clients {
    /// Pipeline store.
    pub storage: Storage,
    /// EVM chain access.
    pub chain: Arc<dyn ChainSource>,
    /// Metadata fetching.
    pub metadata: Arc<dyn MetadataSource>,
}

impl Clients {
    /// Bundle collaborators.
    pub fn new(
        storage: Storage,
        chain: Arc<dyn ChainSource>,
        metadata: Arc<dyn MetadataSource>,
    ) -> Self {
        Self {
            storage,
            chain,
            metadata,
        }
    }
}
