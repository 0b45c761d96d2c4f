//! Script classification, signature-operation counting, and the verification seam.

pub mod opcodes;
pub mod sigops;
pub mod standard;
pub mod verify;
