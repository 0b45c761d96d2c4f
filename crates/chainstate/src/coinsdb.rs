//! Coins view persisted in the `coins` column.

use divid_consensus::Hash256;
use divid_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::coins::{CoinsMap, CoinsRecord, CoinsView, CACHE_DIRTY};

pub const COINS_BEST_BLOCK_KEY: &[u8] = b"coins_best_block";

pub struct StoreCoinsView<S> {
    store: S,
}

impl<S> StoreCoinsView<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: KeyValueStore> StoreCoinsView<S> {
    /// Number of persisted records, read with a full column scan.
    pub fn record_count(&self) -> Result<usize, StoreError> {
        let mut count = 0usize;
        self.store.for_each_prefix(Column::Coins, &[], &mut |_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }
}

impl<S: KeyValueStore> CoinsView for StoreCoinsView<S> {
    fn get_coins(&mut self, txid: &Hash256) -> Result<Option<CoinsRecord>, StoreError> {
        self.peek_coins(txid)
    }

    fn peek_coins(&self, txid: &Hash256) -> Result<Option<CoinsRecord>, StoreError> {
        match self.store.get(Column::Coins, txid)? {
            Some(bytes) => Ok(Some(
                CoinsRecord::decode(&bytes).map_err(|err| StoreError::Backend(err.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        let Some(bytes) = self.store.get(Column::Meta, COINS_BEST_BLOCK_KEY)? else {
            return Ok(None);
        };
        let hash: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid coins best block".to_string()))?;
        // A fully unwound chain leaves the null hash behind.
        Ok((hash != [0u8; 32]).then_some(hash))
    }

    fn batch_write(&mut self, entries: CoinsMap, best_block: Hash256) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.reserve(entries.len() + 1);
        let mut written = 0usize;
        let mut erased = 0usize;
        for (txid, entry) in entries {
            if entry.flags & CACHE_DIRTY == 0 {
                continue;
            }
            if entry.coins.is_pruned() {
                batch.delete(Column::Coins, txid);
                erased += 1;
            } else {
                batch.put(Column::Coins, txid, entry.coins.encode());
                written += 1;
            }
        }
        batch.put(Column::Meta, COINS_BEST_BLOCK_KEY, best_block);
        self.store.write_batch(&batch)?;
        divid_log::log_debug!("committed {written} changed coins ({erased} erased) to coins database");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::{CacheEntry, CACHE_FRESH};
    use divid_primitives::transaction::TxOut;
    use divid_storage::memory::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn pruned_records_are_deleted() {
        let store = Arc::new(MemoryStore::new());
        let mut view = StoreCoinsView::new(Arc::clone(&store));
        let live = CoinsRecord {
            outputs: vec![Some(TxOut::new(3, vec![0x51]))],
            height: 2,
            version: 1,
            ..CoinsRecord::default()
        };
        let mut entries = CoinsMap::new();
        entries.insert([1u8; 32], CacheEntry { coins: live.clone(), flags: CACHE_DIRTY | CACHE_FRESH });
        entries.insert([2u8; 32], CacheEntry { coins: live.clone(), flags: 0 });
        view.batch_write(entries, [9u8; 32]).expect("write");
        assert_eq!(view.peek_coins(&[1u8; 32]).expect("get"), Some(live.clone()));
        assert_eq!(view.peek_coins(&[2u8; 32]).expect("get"), None);
        assert_eq!(view.best_block().expect("best"), Some([9u8; 32]));

        let mut entries = CoinsMap::new();
        entries.insert([1u8; 32], CacheEntry { coins: CoinsRecord::default(), flags: CACHE_DIRTY });
        view.batch_write(entries, [10u8; 32]).expect("write");
        assert_eq!(view.record_count().expect("count"), 0);
        assert_eq!(store.len(Column::Coins), 0);
    }
}
