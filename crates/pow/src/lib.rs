//! Compact targets, chain work, and difficulty retargeting.

pub mod difficulty;
pub mod validation;

pub use difficulty::{block_proof, compact_to_u256, get_next_work_required, u256_to_compact, HeaderInfo};
pub use validation::{check_proof_of_work, PowError};
