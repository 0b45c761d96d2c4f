//! Startup: rebuild the block index and bring the coins database back in
//! line with the block tree after an unclean shutdown.

use divid_consensus::{hash256_to_hex, Hash256};
use divid_storage::{KeyValueStore, WriteBatch};

use crate::blockindex::{BlockIndexGraph, EntryId};
use crate::blocktree::{BlockTreeFlag, BlockTreeStore};
use crate::coins::CoinsView;
use crate::connect::{Cleanliness, IndexingFlags};
use crate::state::{ChainState, ChainStateError};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StartupOptions {
    /// Fall back to the coins best block when the block tree's is unusable.
    /// Address and spent indexing are switched off when this kicks in.
    pub recover_block_db: bool,
    /// Skip reconciliation even after an unclean shutdown.
    pub force_start: bool,
    /// Overrides the persisted shutdown flag before it is read.
    pub safe_shutdown: Option<bool>,
}

impl<S: KeyValueStore + Clone> ChainState<S> {
    /// Loads the persisted block index, reconciles the coins database with
    /// the block tree when the last shutdown was not clean, and activates
    /// the coins best block as the tip.
    pub fn load_block_index(&mut self, startup: &StartupOptions) -> Result<(), ChainStateError> {
        let entries = self.tree.load_entries()?;
        let fresh = entries.is_empty();
        self.graph = BlockIndexGraph::from_disk(entries)?;
        divid_log::log_info!("loaded {} block index entries", self.graph.len());

        if let Some(flag) = startup.safe_shutdown {
            self.tree.write_flag(BlockTreeFlag::Shutdown, flag)?;
        }
        let clean_shutdown = self.tree.read_flag(BlockTreeFlag::Shutdown)?;
        if fresh {
            self.write_indexing_flags(self.options().indexing)?;
        } else if !clean_shutdown && !startup.force_start {
            divid_log::log_warn!("last shutdown was not clean, checking the coins database");
            self.reconcile(startup.recover_block_db)?;
        }

        let indexing = IndexingFlags {
            address_index: self.tree.read_flag(BlockTreeFlag::AddressIndex)?,
            spent_index: self.tree.read_flag(BlockTreeFlag::SpentIndex)?,
            tx_index: self.tree.read_flag(BlockTreeFlag::TxIndex)?,
        };
        if indexing != self.options().indexing {
            divid_log::log_warn!(
                "indexing options differ from the database ({indexing:?}); a reindex is needed to change them"
            );
        }
        self.connector.set_indexing(indexing);
        self.tree.write_flag(BlockTreeFlag::Shutdown, false)?;

        let tip = match self.coins.best_block()? {
            Some(hash) => Some(self.graph.lookup(&hash).ok_or_else(|| {
                ChainStateError::Corruption(format!(
                    "coins best block {} is not in the block index",
                    hash256_to_hex(&hash)
                ))
            })?),
            None => None,
        };
        self.chain.set_tip(&self.graph, tip);
        if let Some(tip) = tip {
            self.graph.prune_candidates(tip);
            let entry = self.graph.get(tip);
            divid_log::log_info!(
                "chain tip {} height {} date {}",
                hash256_to_hex(&entry.hash),
                entry.height,
                entry.time
            );
        }
        Ok(())
    }

    fn write_indexing_flags(&self, indexing: IndexingFlags) -> Result<(), ChainStateError> {
        self.tree
            .write_flag(BlockTreeFlag::AddressIndex, indexing.address_index)?;
        self.tree
            .write_flag(BlockTreeFlag::SpentIndex, indexing.spent_index)?;
        self.tree.write_flag(BlockTreeFlag::TxIndex, indexing.tx_index)?;
        Ok(())
    }

    /// Moves the coins database to the block tree's best block: back to the
    /// fork point with undo data, then forward by re-applying blocks.
    fn reconcile(&mut self, recover_block_db: bool) -> Result<(), ChainStateError> {
        let coins_best = self.coins.best_block()?;
        let tree_best = self.tree.best_block()?;
        let tree_tip = match tree_best {
            None => None,
            Some(hash) => match self.graph.lookup(&hash) {
                Some(id) => Some(id),
                None => return self.recover_block_tree(recover_block_db, coins_best),
            },
        };

        if coins_best == tree_best {
            return Ok(());
        }
        let coins_tip = match coins_best {
            Some(hash) => Some(self.graph.lookup(&hash).ok_or_else(|| {
                ChainStateError::Corruption(format!(
                    "coins best block {} is not in the block index",
                    hash256_to_hex(&hash)
                ))
            })?),
            None => None,
        };
        let fork = match (coins_tip, tree_tip) {
            (Some(coins_tip), Some(tree_tip)) => self.graph.last_common_ancestor(coins_tip, tree_tip),
            _ => None,
        };

        let mut rolled_back = 0usize;
        let mut cursor = coins_tip;
        while let Some(id) = cursor {
            if Some(id) == fork {
                break;
            }
            self.roll_back_block(id)?;
            rolled_back += 1;
            cursor = self.graph.get(id).prev;
        }

        let fork_height = fork.map_or(-1, |fork| self.graph.get(fork).height);
        let tree_height = tree_tip.map_or(-1, |tip| self.graph.get(tip).height);
        let mut rolled_forward = 0usize;
        for height in (fork_height + 1)..=tree_height {
            let id = tree_tip
                .and_then(|tip| self.graph.ancestor(tip, height))
                .ok_or(ChainStateError::Invariant("block tree tip has a gap in its ancestry"))?;
            self.roll_forward_block(id)?;
            rolled_forward += 1;
        }

        let tree_hash = tree_best.unwrap_or([0u8; 32]);
        if self.coins.best_block()?.is_none() {
            self.coins.set_best_block(tree_hash);
        }
        self.coins.flush()?;
        let mut batch = WriteBatch::new();
        BlockTreeStore::<S>::put_best_block(&mut batch, &tree_hash);
        self.tree.write_batch(&batch)?;
        divid_log::log_info!(
            "coins database reconciled to {}: {rolled_back} blocks rolled back, {rolled_forward} re-applied",
            hash256_to_hex(&tree_hash)
        );
        Ok(())
    }

    /// The block tree names a best block the index does not know.
    fn recover_block_tree(
        &mut self,
        recover_block_db: bool,
        coins_best: Option<Hash256>,
    ) -> Result<(), ChainStateError> {
        if !recover_block_db {
            return Err(ChainStateError::Corruption(
                "block tree best block is missing from the block index".to_string(),
            ));
        }
        divid_log::log_warn!("recovering block tree from the coins best block; address and spent indexing disabled");
        let mut indexing = self.connector.indexing();
        indexing.address_index = false;
        indexing.spent_index = false;
        self.write_indexing_flags(indexing)?;
        if let Some(coins_best) = coins_best {
            let mut batch = WriteBatch::new();
            BlockTreeStore::<S>::put_best_block(&mut batch, &coins_best);
            self.tree.write_batch(&batch)?;
        }
        Ok(())
    }

    fn roll_back_block(&mut self, id: EntryId) -> Result<(), ChainStateError> {
        let entry = self.graph.get(id).clone();
        let block = self.blocks.read_block(&entry)?;
        let cleanliness =
            self.connector
                .disconnect(&block, &entry, &mut self.coins, self.blocks.as_ref(), Some(&self.tree))?;
        if cleanliness == Cleanliness::Unclean {
            return Err(ChainStateError::Corruption(format!(
                "rolling back block {} at height {} found inconsistent coins",
                hash256_to_hex(&entry.hash),
                entry.height
            )));
        }
        Ok(())
    }

    fn roll_forward_block(&mut self, id: EntryId) -> Result<(), ChainStateError> {
        let entry = self.graph.get(id).clone();
        let block = self.blocks.read_block(&entry)?;
        for tx in &block.transactions {
            if !tx.is_coinbase() && !self.coins.have_inputs(tx)? {
                return Err(ChainStateError::Corruption(format!(
                    "re-applying block {} at height {}: inputs of {} are missing",
                    hash256_to_hex(&entry.hash),
                    entry.height,
                    hash256_to_hex(&tx.txid())
                )));
            }
            self.coins.apply_confirmed_transaction(tx, entry.height)?;
        }
        self.coins.set_best_block(entry.hash);
        Ok(())
    }
}
