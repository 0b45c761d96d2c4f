//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use divid_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

/// DarkGravityWave averaging window.
const DGW_PAST_BLOCKS: usize = 24;
/// Proof-of-stake retarget timespan.
const POS_TARGET_TIMESPAN: i64 = 60 * 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    NonContiguous,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// Minimal header view used by retargeting, oldest first.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if (bits & 0x0080_0000) != 0 && word != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        if word != 0
            && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32))
        {
            return Err(CompactError::Overflow);
        }
        U256::from(word) << (8 * (size - 3))
    };
    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }
    (size << 24) | (compact & 0x007f_ffff)
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &U256) -> bool {
    U256::from_little_endian(hash) <= *target
}

/// Expected number of hashes for a block at `bits`: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> U256 {
    let Ok(target) = compact_to_u256(bits) else {
        return U256::zero();
    };
    if target.is_zero() {
        return U256::zero();
    }
    (!target / (target + U256::one())) + U256::one()
}

pub fn cmp_targets(a: &Hash256, b: &Hash256) -> Ordering {
    U256::from_little_endian(a).cmp(&U256::from_little_endian(b))
}

/// Next block's compact target given the chain ending at the parent.
///
/// Proof-of-work heights use DarkGravityWave over the last 24 blocks. Past
/// `last_pow_block` the target moves exponentially toward the stake spacing.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let Some(last) = chain.last() else {
        return Ok(pow_limit_bits);
    };
    ensure_contiguous(chain)?;

    if last.height == 0 || last.height < DGW_PAST_BLOCKS as i64 {
        return Ok(pow_limit_bits);
    }
    if !params.retarget_difficulty {
        return Ok(last.bits);
    }

    if last.height > i64::from(params.last_pow_block) {
        return pos_next_work_required(chain, params);
    }
    dark_gravity_wave(chain, params)
}

fn pos_next_work_required(
    chain: &[HeaderInfo],
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let limit = U256::from_little_endian(&params.pos_limit);
    let spacing = params.pow_target_spacing;
    let (last, prev) = match chain {
        [.., prev, last] => (last, Some(prev)),
        [last] => (last, None),
        [] => return Ok(u256_to_compact(limit)),
    };

    let mut actual_spacing = prev.map_or(0, |prev| last.time - prev.time);
    if actual_spacing < 0 {
        actual_spacing = 1;
    }

    let interval = POS_TARGET_TIMESPAN / spacing;
    let mut next = compact_to_u256(last.bits)?;
    next = next.saturating_mul(U256::from(((interval - 1) * spacing + 2 * actual_spacing) as u64));
    next /= U256::from(((interval + 1) * spacing) as u64);

    if next.is_zero() || next > limit {
        next = limit;
    }
    Ok(u256_to_compact(next))
}

fn dark_gravity_wave(
    chain: &[HeaderInfo],
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let mut average = U256::zero();
    let mut actual_timespan: i64 = 0;
    let mut last_time: i64 = 0;
    let mut count: u64 = 0;

    for header in chain.iter().rev().take(DGW_PAST_BLOCKS) {
        if header.height == 0 {
            break;
        }
        count += 1;
        let target = compact_to_u256(header.bits)?;
        average = if count == 1 {
            target
        } else {
            (average * U256::from(count) + target) / U256::from(count + 1)
        };
        if last_time > 0 {
            actual_timespan += last_time - header.time;
        }
        last_time = header.time;
    }

    let target_timespan = count as i64 * params.pow_target_spacing;
    actual_timespan = actual_timespan.clamp(target_timespan / 3, target_timespan * 3);

    let mut next = average.saturating_mul(U256::from(actual_timespan.max(0) as u64));
    if target_timespan > 0 {
        next /= U256::from(target_timespan as u64);
    }
    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next > pow_limit {
        next = pow_limit;
    }
    Ok(u256_to_compact(next))
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}
