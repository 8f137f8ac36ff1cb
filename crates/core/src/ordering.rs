//! Provenance ordinals.
//!
//! Chain writes and off-chain writes both reduce to a single `u64` so the merge
//! function can compare them without knowing where they came from.

/// Encode a chain position (block, tx, log) into a u64.
///
/// Packs the tuple as:
/// - high 32 bits: block number (clamped to u32::MAX)
/// - next 16 bits: tx index (clamped to u16::MAX)
/// - low 16 bits: log index (clamped to u16::MAX)
///
/// Lexicographic order of the tuple is preserved while values fit their widths.
pub fn ordinal_for_chain(block_number: u64, tx_index: u64, log_index: u64) -> u64 {
    let block = block_number.min(u64::from(u32::MAX));
    let tx = tx_index.min(u64::from(u16::MAX));
    let log = log_index.min(u64::from(u16::MAX));

    (block << 32) | (tx << 16) | log
}

/// Ordinal for a fact known only at block granularity.
pub fn ordinal_for_block(block_number: u64) -> u64 {
    ordinal_for_chain(block_number, 0, 0)
}

/// Block number recovered from a chain ordinal.
pub fn block_of_ordinal(ordinal: u64) -> u64 {
    ordinal >> 32
}

/// Ordinal for a fact observed off-chain at the given unix time (milliseconds).
pub fn ordinal_for_wall_clock(unix_millis: u64) -> u64 {
    unix_millis
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_ordinal_preserves_order() {
        let a = ordinal_for_chain(100, 5, 2);
        let b = ordinal_for_chain(100, 5, 3);
        let c = ordinal_for_chain(100, 6, 0);
        let d = ordinal_for_chain(101, 0, 0);

        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
        assert_eq!(block_of_ordinal(c), 100);
        assert_eq!(ordinal_for_block(101), d);
    }

    #[test]
    fn test_chain_ordinal_clamps() {
        let max = ordinal_for_chain(u64::MAX, u64::MAX, u64::MAX);
        assert_eq!(max, u64::MAX);
    }
}
