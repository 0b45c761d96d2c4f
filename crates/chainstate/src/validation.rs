//! Consensus rejections and the context-free block checks run before a block is stored.

use std::collections::HashSet;

use divid_consensus::constants::MAX_BLOCK_SIZE;
use divid_consensus::money::money_range;
use divid_primitives::block::Block;
use divid_primitives::encoding::encode;

/// A block or transaction broke a consensus rule.
///
/// `dos` is the misbehaviour score charged to the peer that relayed the data.
/// `corruption_possible` means the failure may come from damaged local data
/// rather than the block itself, so the block must not be marked invalid.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationError {
    pub reject_reason: &'static str,
    pub dos: u32,
    pub corruption_possible: bool,
}

impl ValidationError {
    pub fn invalid(reject_reason: &'static str, dos: u32) -> Self {
        Self {
            reject_reason,
            dos,
            corruption_possible: false,
        }
    }

    pub fn corrupt(reject_reason: &'static str) -> Self {
        Self {
            reject_reason,
            dos: 0,
            corruption_possible: true,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.reject_reason, self.dos)
    }
}

impl std::error::Error for ValidationError {}

/// Structure rules that need no chain context.
pub fn check_block_structure(block: &Block) -> Result<(), ValidationError> {
    if block.transactions.is_empty() {
        return Err(ValidationError::invalid("bad-blk-length", 100));
    }
    if encode(block).len() > MAX_BLOCK_SIZE as usize {
        return Err(ValidationError::invalid("bad-blk-length", 100));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::invalid("bad-cb-missing", 100));
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(ValidationError::invalid("bad-cb-multiple", 100));
    }
    if block.transactions.len() > 2 && block.transactions[2..].iter().any(|tx| tx.is_coinstake()) {
        return Err(ValidationError::invalid("bad-cs-multiple", 100));
    }

    let mut seen = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        if tx.vin.is_empty() {
            return Err(ValidationError::invalid("bad-txns-vin-empty", 10));
        }
        if tx.vout.is_empty() {
            return Err(ValidationError::invalid("bad-txns-vout-empty", 10));
        }
        if tx.vout.iter().any(|output| !money_range(output.value)) || tx.value_out().is_none() {
            return Err(ValidationError::invalid("bad-txns-vout-toolarge", 100));
        }
        if !seen.insert(tx.txid()) {
            return Err(ValidationError::invalid("bad-txns-duplicate", 100));
        }
    }

    if block.merkle_root() != block.header.merkle_root {
        return Err(ValidationError::corrupt("bad-txnmrklroot"));
    }
    Ok(())
}
