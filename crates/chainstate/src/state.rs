//! The chain-state engine: block index, active chain, coins tip, and the
//! mediator that moves the active chain to the best valid candidate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use divid_consensus::deployments::{
    ThresholdState, DEPLOYMENT_CHECKLOCKTIMEVERIFY, DEPLOYMENT_DEPRECATE_MASTERNODES,
};
use divid_consensus::money::Amount;
use divid_consensus::{hash256_to_hex, ConsensusParams, Hash256};
use divid_pow::check_proof_of_work;
use divid_primitives::block::{Block, BlockHeader};
use divid_primitives::encoding::DecodeError;
use divid_script::verify::{AcceptAllVerifier, ScriptVerifier};
use divid_storage::{KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;

use crate::blockindex::{BlockIndexEntry, BlockIndexGraph, EntryId, BLOCK_VALID_TRANSACTIONS};
use crate::blockstore::BlockDataStore;
use crate::blocktree::{BlockTreeFlag, BlockTreeStore};
use crate::chain::ActiveChain;
use crate::coins::{CoinsError, CoinsRecord, CoinsView, CoinsViewCache};
use crate::coinsdb::StoreCoinsView;
use crate::connect::{ActiveRules, BlockConnector, BlockPersistence, Cleanliness, IndexingFlags};
use crate::difficulty::{ChainRetarget, DifficultyAdjuster};
use crate::fatal::FatalErrorSink;
use crate::flatfiles::FlatFileError;
use crate::incentives::{IncentivesPolicy, LegacyIncentives};
use crate::index_updates::{IndexDatabaseUpdateCollector, StandardIndexCollector};
use crate::metrics::ConnectMetrics;
use crate::peers::{MisbehaviorScores, PeerId, PeerMisbehaviorSink};
use crate::validation::{check_block_structure, ValidationError};
use crate::versionbits::{SignallingStats, VersionBitsManager};

/// Coins cache entries held before the tip is flushed to the store.
pub const DEFAULT_COINS_CACHE_ENTRIES: usize = 200_000;

/// An invalid chain this many blocks' worth of work ahead of the tip is worth a warning.
const INVALID_CHAIN_WARNING_BLOCKS: u64 = 6;

#[derive(Debug)]
pub enum ChainStateError {
    Validation(ValidationError),
    Store(StoreError),
    FlatFile(FlatFileError),
    Decode(DecodeError),
    OrphanHeader(Hash256),
    UnknownBlock(Hash256),
    MissingBlockData(Hash256),
    Invariant(&'static str),
    Corruption(String),
    Aborted(String),
}

impl ChainStateError {
    pub fn is_consensus(&self) -> bool {
        matches!(self, ChainStateError::Validation(_))
    }

    /// Chain state can no longer be trusted; the process must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainStateError::Store(_)
                | ChainStateError::FlatFile(_)
                | ChainStateError::Decode(_)
                | ChainStateError::MissingBlockData(_)
                | ChainStateError::Invariant(_)
                | ChainStateError::Corruption(_)
                | ChainStateError::Aborted(_)
        )
    }
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Validation(err) => write!(f, "{err}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::FlatFile(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::OrphanHeader(prev) => {
                write!(f, "header parent {} is unknown", hash256_to_hex(prev))
            }
            ChainStateError::UnknownBlock(hash) => write!(f, "block {} not found", hash256_to_hex(hash)),
            ChainStateError::MissingBlockData(hash) => {
                write!(f, "block data for {} is missing", hash256_to_hex(hash))
            }
            ChainStateError::Invariant(message) => write!(f, "invariant violated: {message}"),
            ChainStateError::Corruption(message) => write!(f, "database corruption: {message}"),
            ChainStateError::Aborted(message) => write!(f, "aborted: {message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        ChainStateError::Validation(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

impl From<CoinsError> for ChainStateError {
    fn from(err: CoinsError) -> Self {
        match err {
            CoinsError::Store(err) => ChainStateError::Store(err),
            missing @ CoinsError::MissingInput(_) => ChainStateError::Corruption(missing.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainStateOptions {
    pub indexing: IndexingFlags,
    pub check_scripts: bool,
    /// Script-check workers; 0 means one per logical CPU.
    pub script_threads: usize,
    /// Coins cache size (entries) above which a connect flushes the tip.
    pub coins_cache_entries: usize,
}

impl Default for ChainStateOptions {
    fn default() -> Self {
        Self {
            indexing: IndexingFlags {
                address_index: false,
                spent_index: false,
                tx_index: true,
            },
            check_scripts: true,
            script_threads: 0,
            coins_cache_entries: DEFAULT_COINS_CACHE_ENTRIES,
        }
    }
}

/// Pluggable policies the engine consults.
#[derive(Clone)]
pub struct Collaborators {
    pub incentives: Arc<dyn IncentivesPolicy>,
    pub collector: Arc<dyn IndexDatabaseUpdateCollector>,
    pub verifier: Arc<dyn ScriptVerifier>,
    pub difficulty: Arc<dyn DifficultyAdjuster>,
    pub peers: Arc<dyn PeerMisbehaviorSink>,
}

impl Collaborators {
    pub fn standard(params: &ConsensusParams) -> Self {
        Self {
            incentives: Arc::new(LegacyIncentives::new(params.clone())),
            collector: Arc::new(StandardIndexCollector),
            verifier: Arc::new(AcceptAllVerifier),
            difficulty: Arc::new(ChainRetarget::new(params.clone())),
            peers: Arc::new(MisbehaviorScores::new()),
        }
    }
}

/// Hash, height and work of the active tip.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: i32,
    pub chain_work: U256,
    pub money_supply: Amount,
}

pub type SharedChainState<S> = Arc<RwLock<ChainState<S>>>;

pub struct ChainState<S> {
    pub(crate) params: ConsensusParams,
    pub(crate) graph: BlockIndexGraph,
    pub(crate) chain: ActiveChain,
    pub(crate) coins: CoinsViewCache<StoreCoinsView<S>>,
    pub(crate) tree: BlockTreeStore<S>,
    pub(crate) blocks: Arc<dyn BlockDataStore>,
    pub(crate) connector: BlockConnector,
    pub(crate) difficulty: Arc<dyn DifficultyAdjuster>,
    pub(crate) peers: Arc<dyn PeerMisbehaviorSink>,
    pub(crate) versionbits: VersionBitsManager,
    block_sources: HashMap<Hash256, PeerId>,
    pub(crate) fatal: FatalErrorSink,
    interrupt: Arc<AtomicBool>,
    options: ChainStateOptions,
    metrics: Arc<ConnectMetrics>,
}

impl<S: KeyValueStore + Clone> ChainState<S> {
    /// Engine over `store` with an empty block index; call
    /// [`ChainState::load_block_index`] before use on an existing data dir.
    pub fn new(
        params: ConsensusParams,
        store: S,
        blocks: Arc<dyn BlockDataStore>,
        options: ChainStateOptions,
        collaborators: Collaborators,
        fatal: FatalErrorSink,
    ) -> Result<Self, ChainStateError> {
        let metrics = Arc::new(ConnectMetrics::default());
        let mut connector = BlockConnector::new(
            params.clone(),
            collaborators.incentives,
            collaborators.collector,
            collaborators.verifier,
            Arc::clone(&metrics),
        )
        .with_indexing(options.indexing);
        if options.check_scripts {
            connector = connector
                .with_script_threads(options.script_threads)
                .map_err(|err| ChainStateError::Aborted(format!("script check pool: {err}")))?;
        }
        let versionbits = VersionBitsManager::from_deployments(&params.deployments);
        Ok(Self {
            params,
            graph: BlockIndexGraph::new(),
            chain: ActiveChain::new(),
            coins: CoinsViewCache::new(StoreCoinsView::new(store.clone())),
            tree: BlockTreeStore::new(store),
            blocks,
            connector,
            difficulty: collaborators.difficulty,
            peers: collaborators.peers,
            versionbits,
            block_sources: HashMap::new(),
            fatal,
            interrupt: Arc::new(AtomicBool::new(false)),
            options,
            metrics,
        })
    }

    pub fn into_shared(self) -> SharedChainState<S> {
        Arc::new(RwLock::new(self))
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn options(&self) -> &ChainStateOptions {
        &self.options
    }

    pub fn graph(&self) -> &BlockIndexGraph {
        &self.graph
    }

    pub fn chain(&self) -> &ActiveChain {
        &self.chain
    }

    pub fn metrics(&self) -> &ConnectMetrics {
        &self.metrics
    }

    pub fn indexing(&self) -> IndexingFlags {
        self.connector.indexing()
    }

    pub fn block_tree(&self) -> &BlockTreeStore<S> {
        &self.tree
    }

    /// Setting the flag stops `activate_best_chain` at its next step.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn tip(&self) -> Option<ChainTip> {
        self.chain.tip().map(|id| {
            let entry = self.graph.get(id);
            ChainTip {
                hash: entry.hash,
                height: entry.height,
                chain_work: entry.chain_work,
                money_supply: entry.money_supply,
            }
        })
    }

    pub fn tip_hash(&self) -> Option<Hash256> {
        self.chain.tip().map(|id| self.graph.hash(id))
    }

    pub fn height(&self) -> i32 {
        self.chain.height()
    }

    pub fn entry(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        self.graph.lookup(hash).map(|id| self.graph.get(id))
    }

    pub fn coins_best_block(&self) -> Result<Option<Hash256>, ChainStateError> {
        Ok(self.coins.best_block()?)
    }

    /// Reads a coins record without warming the cache.
    pub fn peek_coins(&self, txid: &Hash256) -> Result<Option<CoinsRecord>, ChainStateError> {
        Ok(self.coins.peek_coins(txid)?.filter(|coins| !coins.is_pruned()))
    }

    pub fn coins_cache_size(&self) -> usize {
        self.coins.cache_size()
    }

    /// Raises fatal errors on the abort channel before handing them back.
    pub(crate) fn check_fatal<T>(&self, result: Result<T, ChainStateError>) -> Result<T, ChainStateError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.fatal.raise(format!("chain state: {err}"));
            }
        }
        result
    }

    /// Adds a header to the block index after its context checks.
    pub fn accept_header(&mut self, header: &BlockHeader) -> Result<EntryId, ChainStateError> {
        let hash = header.hash();
        if let Some(id) = self.graph.lookup(&hash) {
            if self.graph.get(id).is_failed() {
                return Err(ValidationError::invalid("duplicate-invalid", 0).into());
            }
            return Ok(id);
        }
        self.check_header_context(header)?;
        self.graph.insert_header(header)
    }

    fn check_header_context(&self, header: &BlockHeader) -> Result<(), ChainStateError> {
        if header.prev_block == [0u8; 32] {
            if let Some(genesis) = self.params.hash_genesis_block {
                if genesis != header.hash() {
                    return Err(ValidationError::invalid("bad-genesis", 100).into());
                }
            }
            return Ok(());
        }
        let parent = self
            .graph
            .lookup(&header.prev_block)
            .ok_or(ChainStateError::OrphanHeader(header.prev_block))?;
        if self.graph.get(parent).is_failed() {
            return Err(ValidationError::invalid("bad-prevblk", 100).into());
        }
        if i64::from(header.time) <= self.graph.median_time_past(parent) {
            return Err(ValidationError::invalid("time-too-old", 0).into());
        }
        let height = self.graph.get(parent).height + 1;
        if height <= self.params.last_pow_block {
            let required = self.difficulty.next_work_required(&self.graph, Some(parent))?;
            if header.bits != required {
                return Err(ValidationError::invalid("bad-diffbits", 100).into());
            }
            check_proof_of_work(header, &self.params)
                .map_err(|_| ValidationError::invalid("high-hash", 50))?;
        }
        Ok(())
    }

    /// Stores a full block and moves the active chain to the best candidate.
    /// `peer` is charged for consensus failures of this block.
    pub fn accept_block(&mut self, block: &Block, peer: Option<PeerId>) -> Result<(), ChainStateError> {
        let hash = block.hash();
        if let Err(err) = check_block_structure(block) {
            self.punish(peer, &err);
            if !err.corruption_possible {
                if let Some(id) = self.graph.lookup(&hash) {
                    self.graph.mark_invalid(id, &self.chain);
                }
            }
            return Err(err.into());
        }
        let id = match self.accept_header(&block.header) {
            Ok(id) => id,
            Err(ChainStateError::Validation(err)) => {
                self.punish(peer, &err);
                return Err(err.into());
            }
            Err(err) => return self.check_fatal(Err(err)),
        };
        if let Some(peer) = peer {
            self.block_sources.insert(hash, peer);
        }
        if !self.graph.get(id).have_data() {
            let stored = self.store_block_data(block, id);
            self.check_fatal(stored)?;
        }
        let mut invalid = Vec::new();
        let result = self.activate_best_chain_collecting(&mut invalid);
        self.check_fatal(result)?;
        match invalid.into_iter().find(|(failed, _)| *failed == hash) {
            Some((_, err)) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn store_block_data(&mut self, block: &Block, id: EntryId) -> Result<(), ChainStateError> {
        let location = self.blocks.write_block(block)?;
        let height = self.graph.get(id).height;
        let mut info = self.tree.file_info(location.file_id)?.unwrap_or_default();
        info.add_block(height, block.header.time);
        info.size = info.size.max(location.offset + 4 + u64::from(location.len));

        self.graph.received_block_transactions(
            id,
            block.transactions.len() as u32,
            location,
            block.is_proof_of_stake(),
            self.chain.tip(),
        );
        let mut batch = self.dirty_index_batch();
        BlockTreeStore::<S>::put_file_info(&mut batch, location.file_id, &info, location.file_id);
        self.tree.write_batch(&batch)?;
        Ok(())
    }

    fn dirty_index_batch(&mut self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for id in self.graph.take_dirty() {
            let entry = self.graph.get(id);
            BlockTreeStore::<S>::put_entry(&mut batch, &entry.hash, &entry.to_disk());
        }
        batch
    }

    fn punish(&self, peer: Option<PeerId>, err: &ValidationError) {
        if let Some(peer) = peer {
            if err.dos > 0 {
                self.peers.report(peer, err.dos, err.reject_reason);
            }
        }
    }

    /// Connects toward the most-work valid candidate until none is better
    /// than the tip, re-selecting after every batch.
    pub fn activate_best_chain(&mut self) -> Result<(), ChainStateError> {
        self.activate_best_chain_collecting(&mut Vec::new())
    }

    /// Same as [`ChainState::activate_best_chain`]; blocks that failed to
    /// connect are pushed onto `invalid` with their rejection.
    fn activate_best_chain_collecting(
        &mut self,
        invalid: &mut Vec<(Hash256, ValidationError)>,
    ) -> Result<(), ChainStateError> {
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                divid_log::log_info!("activate best chain interrupted at height {}", self.chain.height());
                return Ok(());
            }
            let Some(target) = self.graph.find_most_work_chain(&self.chain) else {
                break;
            };
            if let Some(tip) = self.chain.tip() {
                if target == tip
                    || self.graph.get(target).chain_work <= self.graph.get(tip).chain_work
                {
                    break;
                }
            }
            self.activate_step(target, invalid)?;
            if let Some(tip) = self.chain.tip() {
                self.graph.prune_candidates(tip);
            }
        }
        if let Some(tip) = self.chain.tip() {
            self.graph.prune_candidates(tip);
        }
        Ok(())
    }

    /// Disconnects to the fork point with `target`, then connects at most
    /// one window of blocks toward it.
    fn activate_step(
        &mut self,
        target: EntryId,
        invalid: &mut Vec<(Hash256, ValidationError)>,
    ) -> Result<(), ChainStateError> {
        let fork = self.chain.find_fork(&self.graph, target);
        while self.chain.tip().is_some() && self.chain.tip() != fork {
            self.disconnect_tip()?;
        }

        let fork_height = fork.map_or(-1, |fork| self.graph.get(fork).height);
        let window_end = (fork_height + divid_consensus::constants::MAX_CONNECT_WINDOW)
            .min(self.graph.get(target).height);
        let path: Vec<EntryId> = ((fork_height + 1)..=window_end)
            .filter_map(|height| self.graph.ancestor(target, height))
            .collect();
        for id in path {
            match self.connect_tip(id) {
                Ok(()) => {}
                Err(ChainStateError::Validation(err)) => {
                    if !err.corruption_possible {
                        self.invalid_block_found(id, &err);
                    }
                    invalid.push((self.graph.hash(id), err));
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn invalid_block_found(&mut self, id: EntryId, err: &ValidationError) {
        let hash = self.graph.hash(id);
        divid_log::log_warn!(
            "invalid block {} at height {}: {err}",
            hash256_to_hex(&hash),
            self.graph.get(id).height
        );
        self.graph.mark_invalid(id, &self.chain);
        if let Some(peer) = self.block_sources.remove(&hash) {
            self.punish(Some(peer), err);
        }
        self.check_fork_warning();
    }

    fn check_fork_warning(&self) {
        let (Some(invalid), Some(tip)) = (self.graph.best_invalid(), self.chain.tip()) else {
            return;
        };
        let tip_entry = self.graph.get(tip);
        let margin = divid_pow::block_proof(tip_entry.bits)
            .saturating_mul(U256::from(INVALID_CHAIN_WARNING_BLOCKS));
        let invalid_entry = self.graph.get(invalid);
        if invalid_entry.chain_work > tip_entry.chain_work.saturating_add(margin) {
            divid_log::log_warn!(
                "invalid chain found: invalid tip {} at height {} (log2 work {:.6}) beyond active tip at height {}",
                hash256_to_hex(&invalid_entry.hash),
                invalid_entry.height,
                log2_work(&invalid_entry.chain_work),
                tip_entry.height
            );
        }
    }

    /// Connects the child `id` of the tip through a per-block cache layered
    /// over the coins tip.
    fn connect_tip(&mut self, id: EntryId) -> Result<(), ChainStateError> {
        let mut entry = self.graph.get(id).clone();
        let block = self.blocks.read_block(&entry)?;
        let prev_supply = entry
            .prev
            .map_or(0, |prev| self.graph.get(prev).money_supply);
        let undo_before = entry.undo_pos;
        let rules = self.active_rules(entry.prev);
        {
            let persistence = BlockPersistence {
                blocks: self.blocks.as_ref(),
                tree: &self.tree,
            };
            let mut view = CoinsViewCache::new(&mut self.coins);
            self.connector
                .connect(&block, &mut entry, prev_supply, rules, &mut view, Some(&persistence))?;
            view.flush()?;
        }

        if entry.undo_pos != undo_before {
            if let Some(undo) = entry.undo_pos {
                let mut info = self.tree.file_info(undo.file_id)?.unwrap_or_default();
                info.undo_size = info.undo_size.max(undo.offset + 4 + u64::from(undo.len));
                let last_file = self.tree.last_block_file()?.unwrap_or(undo.file_id);
                let mut batch = WriteBatch::new();
                BlockTreeStore::<S>::put_file_info(&mut batch, undo.file_id, &info, last_file);
                self.tree.write_batch(&batch)?;
            }
        }
        *self.graph.get_mut(id) = entry;
        self.chain.set_tip(&self.graph, Some(id));
        self.block_sources.remove(&self.graph.hash(id));
        self.log_new_tip();

        if self.coins.cache_size() > self.options.coins_cache_entries {
            self.flush()?;
        }
        Ok(())
    }

    fn disconnect_tip(&mut self) -> Result<(), ChainStateError> {
        let tip = self
            .chain
            .tip()
            .ok_or(ChainStateError::Invariant("disconnect without an active tip"))?;
        let entry = self.graph.get(tip).clone();
        let block = self.blocks.read_block(&entry)?;
        let cleanliness = {
            let mut view = CoinsViewCache::new(&mut self.coins);
            let cleanliness =
                self.connector
                    .disconnect(&block, &entry, &mut view, self.blocks.as_ref(), Some(&self.tree))?;
            view.flush()?;
            cleanliness
        };
        if cleanliness == Cleanliness::Unclean {
            divid_log::log_error!(
                "disconnect of block {} at height {} left inconsistencies in the coins database",
                hash256_to_hex(&entry.hash),
                entry.height
            );
        }
        self.chain.set_tip(&self.graph, entry.prev);
        self.flush()?;
        self.log_new_tip();
        Ok(())
    }

    fn log_new_tip(&self) {
        match self.chain.tip() {
            Some(tip) => {
                let entry = self.graph.get(tip);
                divid_log::log_info!(
                    "new tip {} height {} log2_work {:.6} tx {} cache {}",
                    hash256_to_hex(&entry.hash),
                    entry.height,
                    log2_work(&entry.chain_work),
                    entry.chain_tx,
                    self.coins.cache_size()
                );
            }
            None => divid_log::log_info!("active chain is empty"),
        }
    }

    /// Writes dirty block-index entries, syncs block files, then flushes the coins tip.
    pub fn flush(&mut self) -> Result<(), ChainStateError> {
        let start = Instant::now();
        let batch = self.dirty_index_batch();
        if !batch.is_empty() {
            self.tree.write_batch(&batch)?;
        }
        self.blocks.sync()?;
        if self.coins.best_block()?.is_some() {
            self.coins.flush()?;
        }
        self.tree.store().sync()?;
        self.metrics.record_flush(start.elapsed());
        Ok(())
    }

    /// Flushes everything and records that the shutdown was orderly.
    pub fn shutdown(&mut self) -> Result<(), ChainStateError> {
        let result = self.flush();
        self.check_fatal(result)?;
        self.tree.write_flag(BlockTreeFlag::Shutdown, true)?;
        divid_log::log_info!("chain state flushed at height {}", self.chain.height());
        Ok(())
    }

    /// Marks `hash` failed, disconnects it and its active descendants, and
    /// activates the best remaining chain.
    pub fn invalidate_block(&mut self, hash: &Hash256) -> Result<(), ChainStateError> {
        let id = self
            .graph
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        // Flags active descendants as failed children too.
        self.graph.mark_invalid(id, &self.chain);
        while self.chain.contains(&self.graph, id) {
            let disconnected = self.disconnect_tip();
            self.check_fatal(disconnected)?;
        }

        if let Some(tip) = self.chain.tip() {
            let tip_work = self.graph.get(tip).chain_work;
            let eligible: Vec<EntryId> = self
                .graph
                .ids()
                .filter(|&other| {
                    let entry = self.graph.get(other);
                    entry.is_valid(BLOCK_VALID_TRANSACTIONS)
                        && entry.chain_tx != 0
                        && entry.chain_work >= tip_work
                })
                .collect();
            for other in eligible {
                self.graph.add_candidate(other);
            }
        }
        let result = self.activate_best_chain();
        self.check_fatal(result)
    }

    /// Clears failure flags on `hash`, its descendants and its ancestors.
    pub fn reconsider_block(&mut self, hash: &Hash256) -> Result<(), ChainStateError> {
        let id = self
            .graph
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        self.graph.reconsider(id, self.chain.tip());
        let result = self.activate_best_chain();
        self.check_fatal(result)
    }

    /// Runs every check of connecting `block` on the tip without keeping
    /// any of the effects.
    pub fn test_block_validity(&mut self, block: &Block) -> Result<(), ChainStateError> {
        let tip = self.chain.tip();
        let tip_hash = tip.map_or([0u8; 32], |tip| self.graph.hash(tip));
        if block.header.prev_block != tip_hash {
            return Err(ChainStateError::Invariant(
                "block under test does not build on the active tip",
            ));
        }
        check_block_structure(block)?;
        self.check_header_context(&block.header)?;

        let header = &block.header;
        let mut entry = BlockIndexEntry {
            hash: block.hash(),
            prev: tip,
            height: tip.map_or(0, |tip| self.graph.get(tip).height + 1),
            version: header.version,
            prev_hash: header.prev_block,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            is_proof_of_stake: block.is_proof_of_stake(),
            ..BlockIndexEntry::default()
        };
        let prev_supply = tip.map_or(0, |tip| self.graph.get(tip).money_supply);
        let rules = self.active_rules(tip);
        let mut view = CoinsViewCache::new(&mut self.coins);
        self.connector.connect(
            block,
            &mut entry,
            prev_supply,
            rules,
            &mut view,
            None::<&BlockPersistence<'_, S>>,
        )
    }

    /// Deployment rules for a block built on `prev`.
    pub fn active_rules(&self, prev: Option<EntryId>) -> ActiveRules {
        ActiveRules {
            check_lock_time_verify: self.versionbits.is_active(
                DEPLOYMENT_CHECKLOCKTIMEVERIFY,
                &self.graph,
                prev,
            ),
            masternodes_deprecated: self.versionbits.is_active(
                DEPLOYMENT_DEPRECATE_MASTERNODES,
                &self.graph,
                prev,
            ),
        }
    }

    pub fn versionbits(&self) -> &VersionBitsManager {
        &self.versionbits
    }

    /// State of deployment `name` for the block after the tip.
    pub fn deployment_state(&self, name: &str) -> Option<ThresholdState> {
        self.versionbits
            .state_for(name, &self.graph, self.chain.tip())
    }

    pub fn deployment_active(&self, name: &str) -> bool {
        self.versionbits
            .is_active(name, &self.graph, self.chain.tip())
    }

    pub fn next_block_version(&self) -> i32 {
        self.versionbits.block_version(&self.graph, self.chain.tip())
    }

    pub fn signalling_stats(&self, name: &str) -> Option<SignallingStats> {
        self.versionbits
            .signalling_stats(name, &self.graph, self.chain.tip())
    }
}

fn log2_work(work: &U256) -> f64 {
    let bits = work.bits();
    if bits <= 64 {
        return (work.low_u64() as f64).log2();
    }
    let shift = bits - 64;
    ((*work >> shift).low_u64() as f64).log2() + shift as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        let consensus = ChainStateError::from(ValidationError::invalid("bad-blk-sigops", 100));
        assert!(consensus.is_consensus());
        assert!(!consensus.is_fatal());
        assert!(ChainStateError::Invariant("best block mismatch").is_fatal());
        assert!(!ChainStateError::OrphanHeader([1u8; 32]).is_fatal());
        let missing = ChainStateError::from(CoinsError::MissingInput(
            divid_primitives::outpoint::OutPoint::new([2u8; 32], 1),
        ));
        assert!(matches!(missing, ChainStateError::Corruption(_)));
    }

    #[test]
    fn log2_work_of_powers_of_two() {
        assert_eq!(log2_work(&U256::from(1024u64)), 10.0);
        assert_eq!(log2_work(&(U256::one() << 100)), 100.0);
    }
}
