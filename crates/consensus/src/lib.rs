//! Consensus constants, parameters, and soft-fork deployments.

pub mod constants;
pub mod deployments;
pub mod money;
pub mod params;

pub use deployments::{Bip9Deployment, ThresholdState};
pub use params::{consensus_params, hash256_from_hex, hash256_to_hex, ConsensusParams, Network};

/// 32-byte digest in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];
