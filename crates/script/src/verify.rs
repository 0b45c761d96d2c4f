//! Script verification seam used by block connection.

use divid_consensus::money::Amount;
use divid_primitives::transaction::Transaction;

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;

pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;
/// Flags every connected block is checked with; active deployments add more.
pub const BLOCK_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    EvalFalse,
    SigCheck,
    Other(&'static str),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::EvalFalse => write!(f, "script evaluated to false"),
            ScriptError::SigCheck => write!(f, "signature check failed"),
            ScriptError::Other(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Verifies one input's `script_sig` against the output it spends.
///
/// Implementations are called from a worker pool, one input at a time.
pub trait ScriptVerifier: Send + Sync {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        script_pubkey: &[u8],
        amount: Amount,
        flags: ScriptFlags,
    ) -> Result<(), ScriptError>;
}

/// Accepts every script.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllVerifier;

impl ScriptVerifier for AcceptAllVerifier {
    fn verify_input(
        &self,
        _tx: &Transaction,
        _input_index: usize,
        _script_pubkey: &[u8],
        _amount: Amount,
        _flags: ScriptFlags,
    ) -> Result<(), ScriptError> {
        Ok(())
    }
}
