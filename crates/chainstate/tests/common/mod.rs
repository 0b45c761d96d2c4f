#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use divid_chainstate::blockstore::FlatFileBlockStore;
use divid_chainstate::flatfiles::DEFAULT_MAX_FILE_SIZE;
use divid_chainstate::incentives::{IncentivesPolicy, LegacyIncentives};
use divid_chainstate::{
    fatal_channel, AbortSignal, ChainState, ChainStateError, ChainStateOptions, Collaborators,
    StartupOptions,
};
use divid_consensus::money::Amount;
use divid_consensus::{consensus_params, ConsensusParams, Hash256, Network};
use divid_pow::check_proof_of_work;
use divid_primitives::block::{Block, BlockHeader, CURRENT_BLOCK_VERSION};
use divid_primitives::outpoint::OutPoint;
use divid_primitives::transaction::{Transaction, TxIn, TxOut};
use divid_script::verify::{ScriptError, ScriptFlags, ScriptVerifier, SCRIPT_VERIFY_NONE};
use divid_storage::memory::MemoryStore;
use tempfile::TempDir;

pub const OP_TRUE: u8 = 0x51;
pub const GENESIS_TIME: u32 = 1_600_000_000;
pub const REGTEST_BITS: u32 = 0x207f_ffff;

pub type Engine = ChainState<Arc<MemoryStore>>;

/// Fails every input checked with all of its `flags` set.
#[derive(Clone, Copy, Debug)]
pub struct RejectingVerifier {
    flags: ScriptFlags,
}

impl RejectingVerifier {
    pub fn always() -> Self {
        Self {
            flags: SCRIPT_VERIFY_NONE,
        }
    }

    pub fn with_flags(flags: ScriptFlags) -> Self {
        Self { flags }
    }
}

impl ScriptVerifier for RejectingVerifier {
    fn verify_input(
        &self,
        _tx: &Transaction,
        _input_index: usize,
        _script_pubkey: &[u8],
        _amount: Amount,
        flags: ScriptFlags,
    ) -> Result<(), ScriptError> {
        if flags & self.flags == self.flags {
            Err(ScriptError::EvalFalse)
        } else {
            Ok(())
        }
    }
}

pub struct TestNode {
    pub params: ConsensusParams,
    pub options: ChainStateOptions,
    pub collaborators: Collaborators,
    pub store: Arc<MemoryStore>,
    pub dir: TempDir,
    pub state: Engine,
    pub abort: AbortSignal,
}

impl TestNode {
    pub fn regtest() -> Self {
        Self::with_params(consensus_params(Network::Regtest))
    }

    pub fn with_params(params: ConsensusParams) -> Self {
        let collaborators = Collaborators::standard(&params);
        Self::build(params, ChainStateOptions::default(), collaborators)
    }

    pub fn build(
        params: ConsensusParams,
        options: ChainStateOptions,
        collaborators: Collaborators,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let (state, abort) = open_state(
            &params,
            &store,
            dir.path(),
            options,
            collaborators.clone(),
            &StartupOptions::default(),
        );
        Self {
            params,
            options,
            collaborators,
            store,
            dir,
            state,
            abort,
        }
    }

    /// Drops the engine without flushing and opens a new one over the same data.
    pub fn restart(&mut self, startup: &StartupOptions) {
        let (state, abort) = open_state(
            &self.params,
            &self.store,
            self.dir.path(),
            self.options,
            self.collaborators.clone(),
            startup,
        );
        self.state = state;
        self.abort = abort;
    }

    pub fn height_of(&self, hash: &Hash256) -> i32 {
        self.state.entry(hash).expect("known block").height
    }

    /// A block on `prev` (genesis when `None`) paying the full reward to OP_TRUE.
    pub fn block_on(&self, prev: Option<Hash256>, tag: u8, extra: Vec<Transaction>) -> Block {
        let height = prev.map_or(0, |prev| self.height_of(&prev) + 1);
        let mut transactions = vec![coinbase(
            height,
            tag,
            vec![TxOut::new(reward(&self.params, height), vec![OP_TRUE])],
        )];
        transactions.extend(extra);
        mine(&self.params, prev.unwrap_or([0u8; 32]), height, transactions)
    }

    /// Mines and accepts `count` blocks on `prev`, returning their hashes.
    pub fn extend(&mut self, prev: Option<Hash256>, count: usize, tag: u8) -> Vec<Hash256> {
        let mut prev = prev;
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            let block = self.block_on(prev, tag, Vec::new());
            self.state.accept_block(&block, None).expect("accept block");
            prev = Some(block.hash());
            hashes.push(block.hash());
        }
        hashes
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.state.tip_hash().expect("active tip")
    }
}

pub fn open_state(
    params: &ConsensusParams,
    store: &Arc<MemoryStore>,
    dir: &Path,
    options: ChainStateOptions,
    collaborators: Collaborators,
    startup: &StartupOptions,
) -> (Engine, AbortSignal) {
    try_open_state(params, store, dir, options, collaborators, startup).expect("open chain state")
}

pub fn try_open_state(
    params: &ConsensusParams,
    store: &Arc<MemoryStore>,
    dir: &Path,
    options: ChainStateOptions,
    collaborators: Collaborators,
    startup: &StartupOptions,
) -> Result<(Engine, AbortSignal), ChainStateError> {
    let blocks = FlatFileBlockStore::open(dir, DEFAULT_MAX_FILE_SIZE)?;
    let (sink, abort) = fatal_channel();
    let mut state = ChainState::new(
        params.clone(),
        Arc::clone(store),
        Arc::new(blocks),
        options,
        collaborators,
        sink,
    )?;
    state.load_block_index(startup)?;
    Ok((state, abort))
}

pub fn reward(params: &ConsensusParams, height: i32) -> Amount {
    LegacyIncentives::new(params.clone())
        .expected_reward(height)
        .total()
}

pub fn coinbase(height: i32, tag: u8, outputs: Vec<TxOut>) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(tag);
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script_sig)],
        vout: outputs,
        lock_time: 0,
    }
}

pub fn spend(prevout: OutPoint, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn::new(prevout, Vec::new())],
        vout: outputs,
        lock_time: 0,
    }
}

/// Seals `transactions` into a block and grinds the nonce until the header
/// meets its target.
pub fn mine(
    params: &ConsensusParams,
    prev: Hash256,
    height: i32,
    transactions: Vec<Transaction>,
) -> Block {
    let mut block = Block {
        header: BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: GENESIS_TIME + height as u32 * 60,
            bits: REGTEST_BITS,
            nonce: 0,
        },
        transactions,
        block_sig: Vec::new(),
    };
    reseal(params, &mut block);
    block
}

/// Recomputes the merkle root after `transactions` changed and grinds again.
pub fn reseal(params: &ConsensusParams, block: &mut Block) {
    block.header.merkle_root = block.merkle_root();
    block.header.nonce = 0;
    while check_proof_of_work(&block.header, params).is_err() {
        block.header.nonce += 1;
    }
}
