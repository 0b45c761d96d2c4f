//! Transaction index: txid to the block record holding it.

use divid_consensus::Hash256;
use divid_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::flatfiles::FileLocation;

const TX_LOCATION_LEN: usize = FileLocation::ENCODED_LEN + 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxLocation {
    pub block: FileLocation,
    /// Position of the transaction inside the block.
    pub index: u32,
}

impl TxLocation {
    pub fn encode(&self) -> [u8; TX_LOCATION_LEN] {
        let mut out = [0u8; TX_LOCATION_LEN];
        out[..FileLocation::ENCODED_LEN].copy_from_slice(&self.block.encode());
        out[FileLocation::ENCODED_LEN..].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TX_LOCATION_LEN {
            return None;
        }
        let block = FileLocation::decode(&bytes[..FileLocation::ENCODED_LEN])?;
        let index = u32::from_le_bytes(bytes[FileLocation::ENCODED_LEN..].try_into().ok()?);
        Some(Self { block, index })
    }
}

pub struct TxIndex<S> {
    store: S,
}

impl<S> TxIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> TxIndex<S> {
    pub fn insert(batch: &mut WriteBatch, txid: &Hash256, location: TxLocation) {
        batch.put(Column::TxIndex, txid, location.encode());
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<TxLocation>, StoreError> {
        let Some(bytes) = self.store.get(Column::TxIndex, txid)? else {
            return Ok(None);
        };
        TxLocation::decode(&bytes)
            .ok_or_else(|| StoreError::Backend("invalid tx index entry".to_string()))
            .map(Some)
    }
}
