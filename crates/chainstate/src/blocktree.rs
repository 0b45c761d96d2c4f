//! Block-index database: index entries, best block, persisted flags, file
//! statistics, and the optional side tables.

use divid_consensus::{hash256_to_hex, Hash256};
use divid_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::address_index::AddressIndex;
use crate::blockindex::DiskBlockIndex;
use crate::filemeta::{block_file_info_key, BlockFileInfo, LAST_BLOCK_FILE_KEY};
use crate::index_updates::IndexDatabaseUpdates;
use crate::spentindex::SpentIndex;
use crate::state::ChainStateError;
use crate::txindex::TxIndex;

pub const BEST_BLOCK_KEY: &[u8] = b"best_block";

/// Boolean settings persisted in the meta column as `flag:<name>`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockTreeFlag {
    AddressIndex,
    SpentIndex,
    TxIndex,
    /// Set on clean shutdown, cleared at startup.
    Shutdown,
    Reindexing,
}

impl BlockTreeFlag {
    fn key(self) -> &'static [u8] {
        match self {
            BlockTreeFlag::AddressIndex => b"flag:addressindex",
            BlockTreeFlag::SpentIndex => b"flag:spentindex",
            BlockTreeFlag::TxIndex => b"flag:txindex",
            BlockTreeFlag::Shutdown => b"flag:shutdown",
            BlockTreeFlag::Reindexing => b"flag:reindexing",
        }
    }
}

pub struct BlockTreeStore<S> {
    store: S,
}

impl<S> BlockTreeStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: KeyValueStore> BlockTreeStore<S> {
    pub fn load_entries(&self) -> Result<Vec<(Hash256, DiskBlockIndex)>, ChainStateError> {
        let mut entries = Vec::new();
        let mut bad_key = false;
        self.store.for_each_prefix(Column::BlockIndex, &[], &mut |key, value| {
            let Ok(hash) = Hash256::try_from(key) else {
                bad_key = true;
                return Ok(());
            };
            let entry = DiskBlockIndex::decode(value).map_err(|err| {
                StoreError::Backend(format!(
                    "block index entry {}: {err}",
                    hash256_to_hex(&hash)
                ))
            })?;
            entries.push((hash, entry));
            Ok(())
        })?;
        if bad_key {
            return Err(ChainStateError::Corruption(
                "block index column holds a malformed key".to_string(),
            ));
        }
        Ok(entries)
    }

    pub fn put_entry(batch: &mut WriteBatch, hash: &Hash256, entry: &DiskBlockIndex) {
        batch.put(Column::BlockIndex, hash, entry.encode());
    }

    pub fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        let Some(bytes) = self.store.get(Column::Meta, BEST_BLOCK_KEY)? else {
            return Ok(None);
        };
        let hash = Hash256::try_from(bytes.as_slice())
            .map_err(|_| StoreError::Backend("invalid best block hash".to_string()))?;
        Ok((hash != [0u8; 32]).then_some(hash))
    }

    pub fn put_best_block(batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, BEST_BLOCK_KEY, hash);
    }

    pub fn read_flag(&self, flag: BlockTreeFlag) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(Column::Meta, flag.key())?
            .is_some_and(|value| value.first() == Some(&1)))
    }

    pub fn write_flag(&self, flag: BlockTreeFlag, value: bool) -> Result<(), StoreError> {
        self.store.put(Column::Meta, flag.key(), &[u8::from(value)])
    }

    pub fn file_info(&self, file_id: u32) -> Result<Option<BlockFileInfo>, StoreError> {
        let Some(bytes) = self.store.get(Column::BlockFileInfo, &block_file_info_key(file_id))? else {
            return Ok(None);
        };
        BlockFileInfo::decode(&bytes)
            .map(Some)
            .ok_or_else(|| StoreError::Backend("invalid block file info".to_string()))
    }

    pub fn last_block_file(&self) -> Result<Option<u32>, StoreError> {
        let Some(bytes) = self.store.get(Column::Meta, LAST_BLOCK_FILE_KEY)? else {
            return Ok(None);
        };
        <[u8; 4]>::try_from(bytes.as_slice())
            .map(|bytes| Some(u32::from_le_bytes(bytes)))
            .map_err(|_| StoreError::Backend("invalid last block file".to_string()))
    }

    pub fn put_file_info(batch: &mut WriteBatch, file_id: u32, info: &BlockFileInfo, last_file: u32) {
        batch.put(Column::BlockFileInfo, block_file_info_key(file_id), info.encode());
        batch.put(Column::Meta, LAST_BLOCK_FILE_KEY, last_file.to_le_bytes());
    }

    /// Writes the side-table deltas of a connected block and advances the
    /// best block, together with the block's own index entry when given.
    pub fn apply_connect_updates(
        &self,
        updates: &IndexDatabaseUpdates,
        best_block: &Hash256,
        entry: Option<&DiskBlockIndex>,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        if let Some(entry) = entry {
            Self::put_entry(&mut batch, best_block, entry);
        }
        for (txid, location) in &updates.tx_locations {
            TxIndex::<S>::insert(&mut batch, txid, *location);
        }
        if updates.address_indexing {
            for (key, amount) in &updates.address_index {
                AddressIndex::<S>::insert_delta(&mut batch, key, *amount);
            }
            for (key, value) in &updates.address_unspent {
                AddressIndex::<S>::update_unspent(&mut batch, key, value.as_ref());
            }
        }
        if updates.spent_indexing {
            for (outpoint, value) in &updates.spent_index {
                SpentIndex::<S>::update(&mut batch, outpoint, value.as_ref());
            }
        }
        Self::put_best_block(&mut batch, best_block);
        self.store.write_batch(&batch)
    }

    /// Erases the address deltas of a disconnected block, restores the
    /// unspent and spent entries it consumed, and moves the best block back.
    pub fn apply_disconnect_updates(
        &self,
        updates: &IndexDatabaseUpdates,
        best_block: &Hash256,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        if updates.address_indexing {
            for (key, _) in &updates.address_index {
                AddressIndex::<S>::erase_delta(&mut batch, key);
            }
            for (key, value) in &updates.address_unspent {
                AddressIndex::<S>::update_unspent(&mut batch, key, value.as_ref());
            }
        }
        if updates.spent_indexing {
            for (outpoint, value) in &updates.spent_index {
                SpentIndex::<S>::update(&mut batch, outpoint, value.as_ref());
            }
        }
        Self::put_best_block(&mut batch, best_block);
        self.store.write_batch(&batch)
    }

    pub fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.store.write_batch(batch)
    }
}
