//! Concrete processors and the default processor order.
//!
//! Order encodes dependencies: seeds must exist before transfers reference
//! their factories, NFTs must exist before their token URI is read, and the
//! token URI must exist before metadata can be fetched.

use spinsync_core::ordering::ordinal_for_wall_clock;
use spinsync_core::Provenance;
use tracing::info;

use crate::config::Config;
use crate::processor::{Processor, ProcessorStep};

pub mod metadata;
pub mod reset;
pub mod seeds;
pub mod token_uris;
pub mod transfers;

pub use metadata::NftMetadataProcessor;
pub use reset::ErrorResetProcessor;
pub use seeds::InsertSeedsProcessor;
pub use token_uris::TokenUriProcessor;
pub use transfers::Erc721TransfersProcessor;

/// The production processor list, minus anything listed in
/// `processors.disabled`.
pub fn default_processors(config: &Config) -> Vec<Box<dyn ProcessorStep>> {
    let candidates: Vec<Box<dyn ProcessorStep>> = vec![
        InsertSeedsProcessor::new(config.seeds.clone()).boxed(),
        ErrorResetProcessor::new(config.errors.max_resets, config.errors.retry_after_secs).boxed(),
        Erc721TransfersProcessor::new(
            config.chain.chain_id,
            config.erc721_factories(),
            config.chain.confirmations,
            config.chain.block_batch_size,
        )
        .boxed(),
        TokenUriProcessor::new(config.runner.batch_size).boxed(),
        NftMetadataProcessor::new(config.runner.batch_size, config.metadata.concurrency).boxed(),
    ];

    candidates
        .into_iter()
        .filter(|processor| {
            let enabled = config.processors.is_enabled(processor.name());
            if !enabled {
                info!(processor = processor.name(), "Processor disabled by configuration");
            }
            enabled
        })
        .collect()
}

/// Provenance for a fact observed off-chain right now.
pub(crate) fn wall_clock_provenance(source: &str) -> Provenance {
    let millis = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
    Provenance::new(ordinal_for_wall_clock(millis), source)
}
