//! Applying and reversing one block against a coins view.

use std::sync::Arc;
use std::time::Instant;

use divid_consensus::constants::MAX_BLOCK_SIGOPS;
use divid_consensus::money::{money_range, Amount};
use divid_consensus::{hash256_to_hex, ConsensusParams};
use divid_primitives::block::Block;
use divid_primitives::transaction::Transaction;
use divid_script::sigops::{legacy_sigop_count, tx_p2sh_sigop_count};
use divid_script::verify::{
    ScriptFlags, ScriptVerifier, BLOCK_SCRIPT_VERIFY_FLAGS, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY,
};
use divid_storage::KeyValueStore;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use crate::blockindex::{BlockIndexEntry, BLOCK_HAVE_UNDO, BLOCK_VALID_SCRIPTS};
use crate::blockstore::{BlockDataReader, BlockDataStore};
use crate::blocktree::BlockTreeStore;
use crate::coins::{CoinsView, CoinsViewCache, TxReversalStatus};
use crate::incentives::IncentivesPolicy;
use crate::index_updates::{IndexDatabaseUpdateCollector, IndexDatabaseUpdates, TxLocationRef};
use crate::metrics::ConnectMetrics;
use crate::state::ChainStateError;
use crate::txindex::TxLocation;
use crate::undo::{BlockUndo, TxUndo};
use crate::validation::ValidationError;

/// Optional side tables maintained while connecting.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexingFlags {
    pub address_index: bool,
    pub spent_index: bool,
    pub tx_index: bool,
}

/// Deployment-controlled rules, as of the parent of the block being connected.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ActiveRules {
    pub check_lock_time_verify: bool,
    pub masternodes_deprecated: bool,
}

impl ActiveRules {
    pub fn script_flags(&self) -> ScriptFlags {
        let mut flags = BLOCK_SCRIPT_VERIFY_FLAGS;
        if self.check_lock_time_verify {
            flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
        }
        flags
    }
}

/// Where undo data and index deltas of a connected block are written.
/// Connecting without one only validates.
pub struct BlockPersistence<'a, S> {
    pub blocks: &'a dyn BlockDataStore,
    pub tree: &'a BlockTreeStore<S>,
}

/// Whether a disconnect left the coins view fully consistent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cleanliness {
    Clean,
    /// The block was reversed, but the view disagreed with it somewhere.
    Unclean,
}

struct ScriptJob<'a> {
    tx: &'a Transaction,
    tx_index: usize,
    input_index: usize,
    script_pubkey: &'a [u8],
    amount: Amount,
}

pub struct BlockConnector {
    params: ConsensusParams,
    incentives: Arc<dyn IncentivesPolicy>,
    collector: Arc<dyn IndexDatabaseUpdateCollector>,
    verifier: Arc<dyn ScriptVerifier>,
    script_pool: Option<ThreadPool>,
    indexing: IndexingFlags,
    metrics: Arc<ConnectMetrics>,
}

impl BlockConnector {
    /// Connector that skips script checks and keeps no side tables.
    pub fn new(
        params: ConsensusParams,
        incentives: Arc<dyn IncentivesPolicy>,
        collector: Arc<dyn IndexDatabaseUpdateCollector>,
        verifier: Arc<dyn ScriptVerifier>,
        metrics: Arc<ConnectMetrics>,
    ) -> Self {
        Self {
            params,
            incentives,
            collector,
            verifier,
            script_pool: None,
            indexing: IndexingFlags::default(),
            metrics,
        }
    }

    /// Runs script checks on a dedicated pool; `threads == 0` uses one per logical CPU.
    pub fn with_script_threads(mut self, threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("scriptch.{index}"))
            .build()?;
        self.script_pool = Some(pool);
        Ok(self)
    }

    pub fn with_indexing(mut self, indexing: IndexingFlags) -> Self {
        self.indexing = indexing;
        self
    }

    pub fn indexing(&self) -> IndexingFlags {
        self.indexing
    }

    pub fn set_indexing(&mut self, indexing: IndexingFlags) {
        self.indexing = indexing;
    }

    pub fn checks_scripts(&self) -> bool {
        self.script_pool.is_some()
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn metrics(&self) -> &ConnectMetrics {
        &self.metrics
    }

    /// Validates `block` against `view` and applies it.
    ///
    /// `entry` is the block's index entry; its supply counters, undo position
    /// and validity are updated in place. `prev_money_supply` is the parent's
    /// supply. `rules` are the deployment rules in force for the block. On
    /// error the view may hold a partial application and must be discarded.
    pub fn connect<V, S>(
        &self,
        block: &Block,
        entry: &mut BlockIndexEntry,
        prev_money_supply: Amount,
        rules: ActiveRules,
        view: &mut CoinsViewCache<V>,
        persistence: Option<&BlockPersistence<'_, S>>,
    ) -> Result<(), ChainStateError>
    where
        V: CoinsView,
        S: KeyValueStore,
    {
        let start = Instant::now();
        let view_best = view.best_block()?.unwrap_or([0u8; 32]);
        if view_best != entry.prev_hash {
            return Err(ChainStateError::Invariant(
                "coins view best block does not match the parent of the connected block",
            ));
        }

        let hash = entry.hash;
        if entry.height == 0 {
            self.connect_genesis(block, entry, view, persistence)?;
            self.metrics.record_connect(start.elapsed());
            return Ok(());
        }

        let height = entry.height;
        if block.is_proof_of_stake() && height <= self.params.last_pow_block {
            return Err(ValidationError::invalid("PoS-early", 100).into());
        }
        if block.is_proof_of_work() && height > self.params.last_pow_block {
            return Err(ValidationError::invalid("PoW-ended", 100).into());
        }

        for tx in &block.transactions {
            let txid = tx.txid();
            if view.access_coins(&txid)?.is_some_and(|coins| !coins.is_pruned()) {
                divid_log::log_warn!(
                    "connect: transaction {} would overwrite unspent outputs",
                    hash256_to_hex(&txid)
                );
                return Err(ValidationError::invalid("bad-txns-BIP30", 100).into());
            }
        }

        let mut sigops = 0u32;
        let mut fees: Amount = 0;
        let mut supply_delta: Amount = 0;
        let mut block_undo = BlockUndo {
            txs: Vec::with_capacity(block.transactions.len().saturating_sub(1)),
        };
        let mut updates =
            IndexDatabaseUpdates::new(self.indexing.address_index, self.indexing.spent_index);

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            sigops = sigops.saturating_add(legacy_sigop_count(tx));
            if sigops > MAX_BLOCK_SIGOPS {
                return Err(ValidationError::invalid("bad-blk-sigops", 100).into());
            }
            let value_out = tx
                .value_out()
                .ok_or(ValidationError::invalid("bad-txns-vout-toolarge", 100))?;

            let mut value_in: Amount = 0;
            if !tx.is_coinbase() {
                if !view.have_inputs(tx)? {
                    return Err(ValidationError::invalid("bad-txns-inputs-missingorspent", 100).into());
                }
                let mut spent_scripts = Vec::with_capacity(tx.vin.len());
                for input in &tx.vin {
                    let coins = view
                        .access_coins(&input.prevout.hash)?
                        .ok_or(ValidationError::invalid("bad-txns-inputs-missingorspent", 100))?;
                    if (coins.is_coinbase || coins.is_coinstake)
                        && height - coins.height < self.params.coinbase_maturity
                    {
                        return Err(
                            ValidationError::invalid("bad-txns-premature-spend-of-coinbase", 0).into()
                        );
                    }
                    let output = coins
                        .output(input.prevout.index)
                        .ok_or(ValidationError::invalid("bad-txns-inputs-missingorspent", 100))?;
                    value_in = value_in.saturating_add(output.value);
                    if !money_range(output.value) || !money_range(value_in) {
                        return Err(
                            ValidationError::invalid("bad-txns-inputvalues-outofrange", 100).into()
                        );
                    }
                    spent_scripts.push(output.script_pubkey.clone());
                }

                sigops = sigops.saturating_add(tx_p2sh_sigop_count(tx, |index| {
                    spent_scripts.get(index).map(Vec::as_slice)
                }));
                if sigops > MAX_BLOCK_SIGOPS {
                    return Err(ValidationError::invalid("bad-blk-sigops", 100).into());
                }

                if !tx.is_coinstake() {
                    if value_in < value_out {
                        return Err(ValidationError::invalid("bad-txns-in-belowout", 100).into());
                    }
                    let fee = value_in - value_out;
                    fees = fees.saturating_add(fee);
                    if !money_range(fee) || !money_range(fees) {
                        return Err(ValidationError::invalid("bad-txns-fee-outofrange", 100).into());
                    }
                }
            }
            supply_delta += value_out - value_in;

            let undo = view.apply_confirmed_transaction(tx, height)?;
            let location = TxLocationRef::new(tx, height, tx_index as u32);
            let spent = (!tx.is_coinbase()).then_some(&undo);
            self.collector
                .record_transaction(tx, &location, spent, &mut updates);
            if self.indexing.tx_index {
                if let Some(block_location) = entry.data_pos {
                    updates.tx_locations.push((
                        location.txid,
                        TxLocation {
                            block: block_location,
                            index: tx_index as u32,
                        },
                    ));
                }
            }
            if !tx.is_coinbase() {
                block_undo.txs.push(undo);
            }
        }

        self.check_scripts(block, &block_undo, rules.script_flags())?;

        let mint = supply_delta + fees;
        let mut expected = self.incentives.expected_reward(height);
        if rules.masternodes_deprecated {
            expected.stake += expected.masternode;
            expected.masternode = 0;
        }
        if block.is_proof_of_work() {
            expected.stake += fees;
        }
        if !self.incentives.is_block_value_valid(&expected, mint, height) {
            divid_log::log_warn!(
                "connect: block {} mints {mint}, expected at most {}",
                hash256_to_hex(&hash),
                expected.total()
            );
            return Err(ValidationError::invalid("bad-cb-amount", 100).into());
        }

        entry.money_supply = prev_money_supply + supply_delta;
        entry.mint = mint;

        let payment_tx = if block.is_proof_of_stake() {
            &block.transactions[1]
        } else {
            &block.transactions[0]
        };
        if !self.incentives.has_valid_payees(payment_tx, entry, &expected) {
            return Err(ValidationError::invalid("bad-cb-payee", 0).into());
        }

        if let Some(persistence) = persistence {
            if !entry.have_undo() || !entry.is_valid(BLOCK_VALID_SCRIPTS) {
                let undo_start = Instant::now();
                let location = persistence.blocks.write_undo(&block_undo, &entry.prev_hash)?;
                self.metrics
                    .record_undo(undo_start.elapsed(), u64::from(location.len));
                entry.undo_pos = Some(location);
                entry.status |= BLOCK_HAVE_UNDO;
            }
            entry.raise_validity(BLOCK_VALID_SCRIPTS);

            let index_start = Instant::now();
            let ops = updates.address_index.len()
                + updates.address_unspent.len()
                + updates.spent_index.len()
                + updates.tx_locations.len();
            persistence
                .tree
                .apply_connect_updates(&updates, &hash, Some(&entry.to_disk()))?;
            self.metrics.record_index(index_start.elapsed(), ops as u64);
        }

        view.set_best_block(hash);
        self.metrics.record_connect(start.elapsed());
        divid_log::log_debug!(
            "bench: connect block {} ({} txs, {sigops} sigops) in {:.2}ms",
            height,
            block.transactions.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }

    fn connect_genesis<V, S>(
        &self,
        block: &Block,
        entry: &mut BlockIndexEntry,
        view: &mut CoinsViewCache<V>,
        persistence: Option<&BlockPersistence<'_, S>>,
    ) -> Result<(), ChainStateError>
    where
        V: CoinsView,
        S: KeyValueStore,
    {
        let mut minted: Amount = 0;
        for tx in &block.transactions {
            minted += tx.value_out().unwrap_or(0);
            view.apply_confirmed_transaction(tx, 0)?;
        }
        entry.money_supply = minted;
        entry.mint = minted;
        if let Some(persistence) = persistence {
            entry.raise_validity(BLOCK_VALID_SCRIPTS);
            let updates =
                IndexDatabaseUpdates::new(self.indexing.address_index, self.indexing.spent_index);
            persistence
                .tree
                .apply_connect_updates(&updates, &entry.hash, Some(&entry.to_disk()))?;
        }
        view.set_best_block(entry.hash);
        Ok(())
    }

    /// Joins every input's script check before returning.
    fn check_scripts(
        &self,
        block: &Block,
        block_undo: &BlockUndo,
        flags: ScriptFlags,
    ) -> Result<(), ChainStateError> {
        let Some(pool) = self.script_pool.as_ref() else {
            return Ok(());
        };
        let mut jobs = Vec::new();
        for (offset, (tx, tx_undo)) in block.transactions[1..]
            .iter()
            .zip(&block_undo.txs)
            .enumerate()
        {
            for (input_index, spent) in tx_undo.prevouts.iter().enumerate() {
                jobs.push(ScriptJob {
                    tx,
                    tx_index: offset + 1,
                    input_index,
                    script_pubkey: &spent.output.script_pubkey,
                    amount: spent.output.value,
                });
            }
        }
        if jobs.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let verifier = self.verifier.as_ref();
        let result = pool.install(|| {
            jobs.par_iter().try_for_each(|job| {
                verifier
                    .verify_input(
                        job.tx,
                        job.input_index,
                        job.script_pubkey,
                        job.amount,
                        flags,
                    )
                    .map_err(|err| (job.tx_index, job.input_index, err))
            })
        });
        self.metrics
            .record_scripts(start.elapsed(), jobs.len() as u64);
        if let Err((tx_index, input_index, err)) = result {
            divid_log::log_warn!(
                "script validation failed for tx {} input {input_index}: {err}",
                hash256_to_hex(&block.transactions[tx_index].txid())
            );
            return Err(ValidationError::invalid("mandatory-script-verify-flag-failed", 100).into());
        }
        Ok(())
    }

    /// Reverses `block` against `view`, last transaction first.
    ///
    /// Inconsistencies the view can absorb make the result `Unclean`;
    /// undo data that cannot be applied at all fails with `Aborted`.
    pub fn disconnect<V, S>(
        &self,
        block: &Block,
        entry: &BlockIndexEntry,
        view: &mut CoinsViewCache<V>,
        blocks: &dyn BlockDataReader,
        tree: Option<&BlockTreeStore<S>>,
    ) -> Result<Cleanliness, ChainStateError>
    where
        V: CoinsView,
        S: KeyValueStore,
    {
        let start = Instant::now();
        if view.best_block()? != Some(entry.hash) {
            return Err(ChainStateError::Invariant(
                "coins view best block does not match the disconnected block",
            ));
        }

        let block_undo = match entry.undo_pos {
            None if entry.prev.is_none() && block.transactions.len() == 1 => BlockUndo::default(),
            _ => blocks.read_block_undo(entry)?,
        };
        if block_undo.txs.len() + 1 != block.transactions.len() {
            return Err(ChainStateError::Corruption(format!(
                "block {} and its undo data are inconsistent",
                hash256_to_hex(&entry.hash)
            )));
        }

        let mut clean = true;
        let mut updates =
            IndexDatabaseUpdates::new(self.indexing.address_index, self.indexing.spent_index);
        for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
            let tx_undo: Option<&TxUndo> = tx_index
                .checked_sub(1)
                .map(|undo_index| &block_undo.txs[undo_index]);
            match view.apply_reversed_transaction(tx, entry.height, tx_undo)? {
                TxReversalStatus::Ok => {}
                TxReversalStatus::ContinueWithErrors => clean = false,
                TxReversalStatus::AbortNoOtherErrors | TxReversalStatus::AbortWithOtherErrors => {
                    return Err(ChainStateError::Aborted(format!(
                        "cannot apply undo data of block {}",
                        hash256_to_hex(&entry.hash)
                    )));
                }
            }
            let location = TxLocationRef::new(tx, entry.height, tx_index as u32);
            self.collector
                .reverse_transaction(tx, &location, tx_undo, &mut updates);
        }

        view.set_best_block(entry.prev_hash);
        if let Some(tree) = tree {
            tree.apply_disconnect_updates(&updates, &entry.prev_hash)?;
        }
        self.metrics.record_disconnect(start.elapsed());
        Ok(if clean {
            Cleanliness::Clean
        } else {
            Cleanliness::Unclean
        })
    }
}

