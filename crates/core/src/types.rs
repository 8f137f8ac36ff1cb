//! Core types for spinsync.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::ID_FIELD;
use crate::error::CoreError;

/// Field values of a proposed write, keyed by field name.
pub type FieldSet = BTreeMap<String, Value>;

/// Canonical tables backed by CRDT registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Table {
    /// Music platforms (sound, zora, ...).
    Platforms,
    /// Factories that deploy NFT factories.
    MetaFactories,
    /// NFT contracts being indexed.
    NftFactories,
    /// Individual tokens.
    Nfts,
    /// Artists.
    Artists,
    /// Tracks derived from NFTs and platform APIs.
    ProcessedTracks,
    /// Raw ERC-721 transfer events.
    Erc721Transfers,
}

impl Table {
    /// Every canonical table, in drain order.
    pub const ALL: [Table; 7] = [
        Table::Platforms,
        Table::MetaFactories,
        Table::NftFactories,
        Table::Nfts,
        Table::Artists,
        Table::ProcessedTracks,
        Table::Erc721Transfers,
    ];

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Platforms => "platforms",
            Table::MetaFactories => "metaFactories",
            Table::NftFactories => "nftFactories",
            Table::Nfts => "nfts",
            Table::Artists => "artists",
            Table::ProcessedTracks => "processedTracks",
            Table::Erc721Transfers => "erc721Transfers",
        }
    }

    /// Name of the SQL view projecting this table.
    pub fn view_name(&self) -> String {
        format!("view_{}", self.as_str())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Table {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| CoreError::UnknownTable(s.to_string()))
    }
}

/// Chains an identifier can be qualified with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Ethereum and EVM-compatible chains.
    Ethereum,
    /// Solana.
    Solana,
}

impl Chain {
    /// Prefix used in composite identifiers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Solana => "solana",
        }
    }
}

/// Token standard of an NFT factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NftStandard {
    /// ERC-721 on an EVM chain.
    Erc721,
    /// Metaplex on Solana.
    Metaplex,
}

impl NftStandard {
    /// Chain whose identifier format this standard uses.
    pub fn chain(&self) -> Chain {
        match self {
            NftStandard::Erc721 => Chain::Ethereum,
            NftStandard::Metaplex => Chain::Solana,
        }
    }
}

/// Where a write came from and how recent it is.
///
/// `ordinal` is either a packed chain position (see [`crate::ordering`]) or
/// wall-clock milliseconds. A given field is expected to be written from one
/// ordinal domain only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    /// Ordering key; larger is newer.
    pub ordinal: u64,
    /// Name of the processor that produced the write.
    pub source: String,
}

impl Provenance {
    /// Create a provenance tag.
    pub fn new(ordinal: u64, source: impl Into<String>) -> Self {
        Self {
            ordinal,
            source: source.into(),
        }
    }
}

/// Deterministic rank of sources used to break ties between writes with equal
/// ordinals.
///
/// Sources listed earlier win; unlisted sources rank below every listed one and
/// are then ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePriority(Vec<String>);

impl SourcePriority {
    /// Build a priority list, highest priority first.
    pub fn new(order: Vec<String>) -> Self {
        Self(order)
    }

    /// Rank of a source; lower is stronger.
    pub fn rank(&self, source: &str) -> usize {
        self.0
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.0.len())
    }
}

/// A whole entity proposed for insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Composite identifier.
    pub id: String,
    /// Field values.
    pub fields: FieldSet,
}

impl EntityRecord {
    /// Create a record with no fields.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: FieldSet::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }
}

/// Check a field name can be stored in a register and exposed as a view column.
///
/// Names must start with an ASCII letter or underscore, contain only ASCII
/// alphanumerics and underscores, and must not be the reserved `id`.
pub fn validate_field_name(name: &str) -> Result<(), CoreError> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name == ID_FIELD || name.len() > 64 {
        return Err(CoreError::InvalidFieldName(name.to_string()));
    }
    Ok(())
}

/// Validate every field name in a set.
pub fn validate_fields(fields: &FieldSet) -> Result<(), CoreError> {
    fields.keys().try_for_each(|name| validate_field_name(name))
}

/// Music platform seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Platform id, e.g. `sound`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Platform type, e.g. `single-track-multiprint-contract`.
    #[serde(rename = "type")]
    pub platform_type: String,
}

/// NFT contract seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftFactory {
    /// Contract address (EVM hex or Solana base58).
    pub address: String,
    /// Platform the contract belongs to.
    pub platform_id: String,
    /// Token standard.
    pub standard: NftStandard,
    /// Chain id for EVM contracts.
    #[serde(default)]
    pub chain_id: Option<u64>,
    /// First block worth scanning.
    #[serde(default)]
    pub starting_block: u64,
    /// Address credited as artist for tokens minted by this contract.
    #[serde(default)]
    pub artist_address: Option<String>,
    /// Whether processors should pick this factory up.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}
