//! Block and undo data on flat files.
//!
//! Undo records carry a trailing `sha256d(prev_block_hash || undo)` that is
//! checked on every read.

use std::path::Path;

use divid_consensus::Hash256;
use divid_primitives::block::Block;
use divid_primitives::encoding::{decode, encode};
use divid_primitives::hash::sha256d_parts;

use crate::blockindex::BlockIndexEntry;
use crate::flatfiles::{FileLocation, FlatFileError, FlatFileStore};
use crate::state::ChainStateError;
use crate::undo::BlockUndo;

const UNDO_CHECKSUM_LEN: usize = 32;

pub trait BlockDataReader: Send + Sync {
    fn read_block(&self, entry: &BlockIndexEntry) -> Result<Block, ChainStateError>;
    fn read_block_undo(&self, entry: &BlockIndexEntry) -> Result<BlockUndo, ChainStateError>;
}

pub trait BlockDataStore: BlockDataReader {
    fn write_block(&self, block: &Block) -> Result<FileLocation, ChainStateError>;
    fn write_undo(&self, undo: &BlockUndo, prev_hash: &Hash256) -> Result<FileLocation, ChainStateError>;
    fn sync(&self) -> Result<(), ChainStateError>;
}

pub struct FlatFileBlockStore {
    blocks: FlatFileStore,
    undo: FlatFileStore,
}

impl FlatFileBlockStore {
    pub fn open(dir: impl AsRef<Path>, max_file_size: u64) -> Result<Self, FlatFileError> {
        let dir = dir.as_ref();
        Ok(Self {
            blocks: FlatFileStore::open(dir, "blk", max_file_size)?,
            undo: FlatFileStore::open(dir, "rev", max_file_size)?,
        })
    }
}

fn undo_checksum(prev_hash: &Hash256, undo: &[u8]) -> Hash256 {
    sha256d_parts(&[prev_hash.as_slice(), undo])
}

impl BlockDataReader for FlatFileBlockStore {
    fn read_block(&self, entry: &BlockIndexEntry) -> Result<Block, ChainStateError> {
        let location = entry
            .data_pos
            .ok_or(ChainStateError::MissingBlockData(entry.hash))?;
        let bytes = self.blocks.read(location)?;
        let block: Block = decode(&bytes)?;
        if block.hash() != entry.hash {
            return Err(ChainStateError::Corruption(format!(
                "block data at file {} offset {} does not match its index entry",
                location.file_id, location.offset
            )));
        }
        Ok(block)
    }

    fn read_block_undo(&self, entry: &BlockIndexEntry) -> Result<BlockUndo, ChainStateError> {
        let location = entry
            .undo_pos
            .ok_or(ChainStateError::MissingBlockData(entry.hash))?;
        let bytes = self.undo.read(location)?;
        if bytes.len() < UNDO_CHECKSUM_LEN {
            return Err(FlatFileError::TruncatedUndo.into());
        }
        let (payload, checksum) = bytes.split_at(bytes.len() - UNDO_CHECKSUM_LEN);
        if undo_checksum(&entry.prev_hash, payload).as_slice() != checksum {
            return Err(FlatFileError::UndoChecksum.into());
        }
        Ok(BlockUndo::decode(payload)?)
    }
}

impl BlockDataStore for FlatFileBlockStore {
    fn write_block(&self, block: &Block) -> Result<FileLocation, ChainStateError> {
        Ok(self.blocks.append(&encode(block))?)
    }

    fn write_undo(&self, undo: &BlockUndo, prev_hash: &Hash256) -> Result<FileLocation, ChainStateError> {
        let mut bytes = undo.encode();
        let checksum = undo_checksum(prev_hash, &bytes);
        bytes.extend_from_slice(&checksum);
        Ok(self.undo.append(&bytes)?)
    }

    fn sync(&self) -> Result<(), ChainStateError> {
        self.blocks.sync()?;
        self.undo.sync()?;
        Ok(())
    }
}
