//! Configuration management for the pipeline.
//!
//! This module handles loading configuration from:
//! - TOML files
//! - Environment variables referenced as `${VAR}`
//! - Default values (fallbacks)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use spinsync_core::identifiers::{format_ethereum_address, format_solana_address};
use spinsync_core::{
    NftFactory, NftStandard, Platform, SourcePriority, DEFAULT_REGISTER_CAPACITY_BYTES,
    MIN_REGISTER_CAPACITY_BYTES,
};
use std::collections::HashSet;
use std::path::Path;

use crate::runner::RunLimits;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Chain configuration
    pub chain: ChainConfig,

    /// Metadata fetching configuration
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Runner configuration
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Merge engine configuration
    #[serde(default)]
    pub merge: MergeConfig,

    /// Error bookkeeping configuration
    #[serde(default)]
    pub errors: ErrorsConfig,

    /// Processor selection
    #[serde(default)]
    pub processors: ProcessorsConfig,

    /// Platforms and NFT contracts to seed
    #[serde(default)]
    pub seeds: SeedsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://spinsync.db")
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Ethereum RPC URL
    pub rpc_url: String,

    /// Chain ID (1 for mainnet)
    pub chain_id: u64,

    /// Blocks behind head considered final
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,

    /// Blocks scanned per transfer batch
    #[serde(default = "default_block_batch_size")]
    pub block_batch_size: u64,
}

/// Metadata fetching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Gateway prefix for `ipfs://` URIs
    #[serde(default = "default_ipfs_gateway")]
    pub ipfs_gateway: String,

    /// Request timeout in seconds
    #[serde(default = "default_metadata_timeout_secs")]
    pub timeout_secs: u64,

    /// Largest accepted metadata document
    #[serde(default = "default_metadata_max_bytes")]
    pub max_bytes: usize,

    /// Concurrent metadata requests per batch
    #[serde(default = "default_metadata_concurrency")]
    pub concurrency: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            ipfs_gateway: default_ipfs_gateway(),
            timeout_secs: default_metadata_timeout_secs(),
            max_bytes: default_metadata_max_bytes(),
            concurrency: default_metadata_concurrency(),
        }
    }
}

/// Runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Seconds between runs in the poll loop
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Full passes over the processor list per run
    #[serde(default = "default_max_passes")]
    pub max_passes: u32,

    /// Batches per processor per pass
    #[serde(default = "default_max_batches_per_processor")]
    pub max_batches_per_processor: u32,

    /// Items per batch for table-driven processors
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_passes: default_max_passes(),
            max_batches_per_processor: default_max_batches_per_processor(),
            batch_size: default_batch_size(),
        }
    }
}

impl RunnerConfig {
    /// Bounds for [`crate::runner::Runner`].
    pub fn limits(&self) -> RunLimits {
        RunLimits {
            max_passes: self.max_passes,
            max_batches_per_processor: self.max_batches_per_processor,
        }
    }
}

/// Merge engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Largest serialized register accepted
    #[serde(default = "default_max_register_bytes")]
    pub max_register_bytes: usize,

    /// Sources in descending priority, used to break ordinal ties
    #[serde(default)]
    pub source_priority: SourcePriority,

    /// Seconds an update may wait for its entity's insert before it is
    /// flagged as orphaned
    #[serde(default = "default_orphan_after_secs")]
    pub orphan_after_secs: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_register_bytes: default_max_register_bytes(),
            source_priority: SourcePriority::default(),
            orphan_after_secs: default_orphan_after_secs(),
        }
    }
}

/// Error bookkeeping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorsConfig {
    /// Automatic resets before an entity needs manual intervention
    #[serde(default = "default_max_resets")]
    pub max_resets: u32,

    /// Seconds an annotation waits before the automatic reset retries it
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            max_resets: default_max_resets(),
            retry_after_secs: default_retry_after_secs(),
        }
    }
}

/// Processor selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorsConfig {
    /// Processor names to leave out of the run
    #[serde(default)]
    pub disabled: Vec<String>,
}

impl ProcessorsConfig {
    /// Whether a processor should run.
    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.iter().any(|d| d == name)
    }
}

/// Platforms and NFT contracts to seed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedsConfig {
    /// Music platforms
    #[serde(default)]
    pub platforms: Vec<Platform>,

    /// NFT contracts
    #[serde(default)]
    pub nft_factories: Vec<NftFactory>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_confirmations() -> u64 {
    6
}

fn default_block_batch_size() -> u64 {
    2_000
}

fn default_ipfs_gateway() -> String {
    "https://ipfs.io/ipfs/".to_string()
}

fn default_metadata_timeout_secs() -> u64 {
    10
}

fn default_metadata_max_bytes() -> usize {
    32 * 1024 // 32 KB, half the default register capacity
}

fn default_metadata_concurrency() -> usize {
    20
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_passes() -> u32 {
    10
}

fn default_max_batches_per_processor() -> u32 {
    1_000
}

fn default_batch_size() -> u32 {
    100
}

fn default_max_register_bytes() -> usize {
    DEFAULT_REGISTER_CAPACITY_BYTES
}

fn default_orphan_after_secs() -> u64 {
    86_400 // 1 day
}

fn default_max_resets() -> u32 {
    3
}

fn default_retry_after_secs() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables can be referenced using `${VAR_NAME}` syntax.
    /// For example: `rpc_url = "${ETHEREUM_RPC_URL}"`
    ///
    /// # Example
    /// ```no_run
    /// # use spinsync_pipeline::config::Config;
    /// let config = Config::from_file("spinsync.toml")?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let expanded = expand_env_vars(&contents)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml).context("Failed to parse TOML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            bail!("Database max_connections must be > 0");
        }
        if self.database.min_connections > self.database.max_connections {
            bail!(
                "Database min_connections ({}) cannot exceed max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.chain.rpc_url.is_empty() {
            bail!("Chain RPC URL cannot be empty");
        }
        if self.chain.chain_id == 0 {
            bail!("Chain ID must be non-zero");
        }
        if self.chain.block_batch_size == 0 {
            bail!("Chain block_batch_size must be > 0");
        }

        if self.metadata.ipfs_gateway.is_empty() {
            bail!("Metadata ipfs_gateway cannot be empty");
        }
        if self.metadata.timeout_secs == 0 {
            bail!("Metadata timeout_secs must be > 0");
        }
        if self.metadata.concurrency == 0 {
            bail!("Metadata concurrency must be > 0");
        }
        if self.metadata.max_bytes == 0 {
            bail!("Metadata max_bytes must be > 0");
        }

        if self.runner.poll_interval_secs == 0 {
            bail!("Runner poll_interval_secs must be > 0");
        }
        if self.runner.max_passes == 0 {
            bail!("Runner max_passes must be > 0");
        }
        if self.runner.max_batches_per_processor == 0 {
            bail!("Runner max_batches_per_processor must be > 0");
        }
        if self.runner.batch_size == 0 {
            bail!("Runner batch_size must be > 0");
        }

        if self.merge.max_register_bytes < MIN_REGISTER_CAPACITY_BYTES {
            bail!(
                "Merge max_register_bytes must be at least {} (got {})",
                MIN_REGISTER_CAPACITY_BYTES,
                self.merge.max_register_bytes
            );
        }
        // A metadata document is stored whole in one register field.
        if self.metadata.max_bytes >= self.merge.max_register_bytes {
            bail!(
                "Metadata max_bytes ({}) must be below merge max_register_bytes ({})",
                self.metadata.max_bytes,
                self.merge.max_register_bytes
            );
        }

        self.validate_seeds()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "Logging level must be one of: {} (got '{}')",
                valid_levels.join(", "),
                self.logging.level
            );
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            bail!(
                "Logging format must be one of: {} (got '{}')",
                valid_formats.join(", "),
                self.logging.format
            );
        }

        Ok(())
    }

    fn validate_seeds(&self) -> Result<()> {
        let mut platform_ids = HashSet::new();
        for platform in &self.seeds.platforms {
            if platform.id.trim().is_empty() {
                bail!("Seed platform id cannot be empty");
            }
            if !platform_ids.insert(platform.id.as_str()) {
                bail!("Duplicate seed platform '{}'", platform.id);
            }
        }

        let mut addresses = HashSet::new();
        for factory in &self.seeds.nft_factories {
            if !platform_ids.contains(factory.platform_id.as_str()) {
                bail!(
                    "NFT factory {} references unknown platform '{}'",
                    factory.address,
                    factory.platform_id
                );
            }

            let address = match factory.standard {
                NftStandard::Erc721 => {
                    if factory.address.parse::<alloy::primitives::Address>().is_err() {
                        bail!("NFT factory address '{}' is not an EVM address", factory.address);
                    }
                    if let Some(chain_id) = factory.chain_id {
                        if chain_id != self.chain.chain_id {
                            bail!(
                                "NFT factory {} is on chain {}, pipeline is configured for chain {}",
                                factory.address,
                                chain_id,
                                self.chain.chain_id
                            );
                        }
                    }
                    if let Some(artist) = &factory.artist_address {
                        format_ethereum_address(artist).with_context(|| {
                            format!("Invalid artist address for factory {}", factory.address)
                        })?;
                    }
                    format_ethereum_address(&factory.address)?
                }
                NftStandard::Metaplex => {
                    if factory.enabled {
                        bail!(
                            "NFT factory {} uses the metaplex standard, which has no ingestion \
                             processor; set enabled = false to seed it without scanning",
                            factory.address
                        );
                    }
                    format_solana_address(&factory.address)?
                }
            };

            if !addresses.insert(address) {
                bail!("Duplicate NFT factory '{}'", factory.address);
            }
        }

        Ok(())
    }

    /// Enabled ERC-721 factories, the ones scanned for transfers.
    pub fn erc721_factories(&self) -> Vec<NftFactory> {
        self.seeds
            .nft_factories
            .iter()
            .filter(|f| f.enabled && f.standard == NftStandard::Erc721)
            .cloned()
            .collect()
    }
}

/// Expand environment variables in the format `${VAR_NAME}`.
///
/// Placeholders after a `#` that is outside a quoted string are left alone.
///
/// # Errors
/// Returns an error if a referenced variable is not set or a placeholder is
/// malformed.
fn expand_env_vars(input: &str) -> Result<String> {
    let mut result = String::with_capacity(input.len());

    for (line_no, line) in input.split_inclusive('\n').enumerate() {
        let mut quote: Option<char> = None;
        let mut escaped = false;
        let mut rest = line.char_indices().peekable();

        while let Some((idx, ch)) = rest.next() {
            if escaped {
                escaped = false;
                result.push(ch);
                continue;
            }

            match (quote, ch) {
                (Some('"'), '\\') => {
                    escaped = true;
                    result.push(ch);
                }
                (Some(q), c) if c == q => {
                    quote = None;
                    result.push(ch);
                }
                (None, '"') | (None, '\'') => {
                    quote = Some(ch);
                    result.push(ch);
                }
                (None, '#') => {
                    result.push_str(&line[idx..]);
                    break;
                }
                (_, '$') if matches!(rest.peek(), Some((_, '{'))) => {
                    let start = idx + 2;
                    let Some(len) = line[start..].find('}') else {
                        bail!(
                            "Unclosed environment variable placeholder on line {}",
                            line_no + 1
                        );
                    };
                    let var_name = &line[start..start + len];
                    if var_name.is_empty() {
                        bail!("Empty environment variable name on line {}", line_no + 1);
                    }

                    let value = std::env::var(var_name).with_context(|| {
                        format!(
                            "Environment variable '{}' is not set (referenced on line {})",
                            var_name,
                            line_no + 1
                        )
                    })?;
                    result.push_str(&value);

                    // Skip past the closing brace.
                    while let Some((i, _)) = rest.next() {
                        if i == start + len {
                            break;
                        }
                    }
                }
                _ => result.push(ch),
            }
        }
    }

    Ok(result)
}
