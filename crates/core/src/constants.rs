//! Canonical constants shared by every pipeline component.

/// Ethereum addresses that never represent a controllable account.
///
/// Compared against lower-cased addresses.
pub const ETHEREUM_BURN_ADDRESSES: [&str; 2] = [
    "0x0000000000000000000000000000000000000000",
    "0x000000000000000000000000000000000000dead",
];

/// Length of a `0x`-prefixed hex Ethereum address.
pub const ETHEREUM_ADDRESS_LEN: usize = 42;

/// Register schema version written by this build.
pub const REGISTER_SCHEMA_VERSION: u32 = 1;

/// Smallest register capacity a deployment may configure.
///
/// Registers used to live in a 255 character column and were silently cut
/// off; 20 000 is the floor the store was widened to.
pub const MIN_REGISTER_CAPACITY_BYTES: usize = 20_000;

/// Default register capacity.
pub const DEFAULT_REGISTER_CAPACITY_BYTES: usize = 64 * 1024;

/// Field name reserved for the entity id in projected records.
pub const ID_FIELD: &str = "id";
