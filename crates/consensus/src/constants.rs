//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 2_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = MAX_BLOCK_SIZE / 50;
/// Number of ancestors whose timestamps feed the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Upper bound on blocks connected per reorg step before re-evaluating candidates.
pub const MAX_CONNECT_WINDOW: i32 = 32;
/// Address type tag for pay-to-pubkey-hash outputs in the address indexes.
pub const ADDRESS_TYPE_P2PKH: u8 = 1;
/// Address type tag for pay-to-script-hash outputs in the address indexes.
pub const ADDRESS_TYPE_P2SH: u8 = 2;
/// DoS score that triggers an immediate disconnect of the source peer.
pub const MAX_DOS_SCORE: u32 = 100;
