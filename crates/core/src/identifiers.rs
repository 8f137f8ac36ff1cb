//! Chain-qualified entity identifiers.
//!
//! Every producer that describes the same real-world entity must derive the
//! same key without talking to any other producer, so all functions here are
//! pure. Keys have the shape `<chain>/<address>[/<subid>]`.

use alloy_primitives::{hex, Address};
use std::str::FromStr;

use crate::constants::{ETHEREUM_ADDRESS_LEN, ETHEREUM_BURN_ADDRESSES};
use crate::error::{CoreError, Result};
use crate::types::{Chain, NftStandard};

/// Normalize an EVM address for embedding in an identifier.
///
/// Hex addresses are lower-cased. Non-hex account names are lower-cased as-is.
pub fn format_ethereum_address(address: &str) -> Result<String> {
    let trimmed = check_embeddable(address)?;
    match Address::from_str(trimmed) {
        Ok(parsed) => Ok(format!("0x{}", hex::encode(parsed.as_slice()))),
        Err(_) => Ok(trimmed.to_lowercase()),
    }
}

/// Validate a Solana address; base58 keys are case-sensitive and passed through.
pub fn format_solana_address(address: &str) -> Result<String> {
    let trimmed = check_embeddable(address)?;
    bs58::decode(trimmed)
        .into_vec()
        .map_err(|_| CoreError::InvalidAddress(address.to_string()))?;
    Ok(trimmed.to_string())
}

fn check_embeddable(address: &str) -> Result<&str> {
    let trimmed = address.trim();
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains(char::is_whitespace) {
        return Err(CoreError::InvalidAddress(address.to_string()));
    }
    Ok(trimmed)
}

fn with_sub_id(base: String, sub_id: &str) -> String {
    if sub_id.is_empty() {
        base
    } else {
        format!("{base}/{sub_id}")
    }
}

/// `ethereum/<address>`
pub fn ethereum_id(address: &str) -> Result<String> {
    Ok(format!(
        "{}/{}",
        Chain::Ethereum.as_str(),
        format_ethereum_address(address)?
    ))
}

/// `ethereum/<address>[/<id>]`
pub fn ethereum_track_id(address: &str, id: &str) -> Result<String> {
    Ok(with_sub_id(ethereum_id(address)?, id))
}

/// `ethereum/<block>/<log index>` for a single transfer event.
pub fn ethereum_transfer_id(block_number: u64, log_index: u64) -> String {
    format!("{}/{}/{}", Chain::Ethereum.as_str(), block_number, log_index)
}

/// `solana/<address>`
pub fn solana_id(address: &str) -> Result<String> {
    Ok(format!(
        "{}/{}",
        Chain::Solana.as_str(),
        format_solana_address(address)?
    ))
}

/// `solana/<address>[/<id>]`
pub fn solana_track_id(address: &str, id: &str) -> Result<String> {
    Ok(with_sub_id(solana_id(address)?, id))
}

/// Artist id for an account, formatted for the factory's standard.
pub fn artist_id(standard: NftStandard, address: &str) -> Result<String> {
    match standard {
        NftStandard::Metaplex => solana_id(address),
        NftStandard::Erc721 => ethereum_id(address),
    }
}

/// Track or token id, formatted for the factory's standard.
pub fn track_id(standard: NftStandard, address: &str, id: &str) -> Result<String> {
    match standard {
        NftStandard::Metaplex => solana_track_id(address, id),
        NftStandard::Erc721 => ethereum_track_id(address, id),
    }
}

/// Extract an address someone can actually control from an id.
///
/// Accepts either a bare address or a composite id whose second segment is an
/// address. Burn addresses and anything that is not a 42 character `0x` string
/// yield `None`.
pub fn controlled_ethereum_address_from_id(id: &str) -> Option<&str> {
    if is_controlled_ethereum_address(id) {
        return Some(id);
    }

    id.split('/')
        .nth(1)
        .filter(|segment| is_controlled_ethereum_address(segment))
}

fn is_controlled_ethereum_address(address: &str) -> bool {
    address.len() == ETHEREUM_ADDRESS_LEN
        && address.starts_with("0x")
        && !ETHEREUM_BURN_ADDRESSES
            .iter()
            .any(|burn| burn.eq_ignore_ascii_case(address))
}
