//! Spent output index.
//!
//! Maps an outpoint (txid + vout) to the input that spent it, together with
//! the amount and address of the spent output.

use divid_consensus::Hash256;
use divid_primitives::outpoint::OutPoint;
use divid_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const SPENT_INDEX_VALUE_LEN: usize = 69;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpentIndexValue {
    pub txid: Hash256,
    pub input_index: u32,
    pub block_height: i32,
    pub satoshis: i64,
    /// 0 when the spent script pays to neither a key hash nor a script hash.
    pub address_type: u8,
    pub address_hash: [u8; 20],
}

impl SpentIndexValue {
    pub fn encode(&self) -> [u8; SPENT_INDEX_VALUE_LEN] {
        let mut out = [0u8; SPENT_INDEX_VALUE_LEN];
        out[0..32].copy_from_slice(&self.txid);
        out[32..36].copy_from_slice(&self.input_index.to_le_bytes());
        out[36..40].copy_from_slice(&self.block_height.to_le_bytes());
        out[40..48].copy_from_slice(&self.satoshis.to_le_bytes());
        out[48] = self.address_type;
        out[49..69].copy_from_slice(&self.address_hash);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SPENT_INDEX_VALUE_LEN {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[0..32]);
        let mut address_hash = [0u8; 20];
        address_hash.copy_from_slice(&bytes[49..69]);
        Some(Self {
            txid,
            input_index: u32::from_le_bytes(bytes[32..36].try_into().ok()?),
            block_height: i32::from_le_bytes(bytes[36..40].try_into().ok()?),
            satoshis: i64::from_le_bytes(bytes[40..48].try_into().ok()?),
            address_type: bytes[48],
            address_hash,
        })
    }
}

pub struct SpentIndex<S> {
    store: S,
}

impl<S> SpentIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> SpentIndex<S> {
    /// Writes `value`, or erases the entry when it is `None`.
    pub fn update(batch: &mut WriteBatch, outpoint: &OutPoint, value: Option<&SpentIndexValue>) {
        match value {
            Some(value) => batch.put(Column::SpentIndex, outpoint.to_key(), value.encode()),
            None => batch.delete(Column::SpentIndex, outpoint.to_key()),
        }
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<SpentIndexValue>, StoreError> {
        let Some(bytes) = self.store.get(Column::SpentIndex, &outpoint.to_key())? else {
            return Ok(None);
        };
        SpentIndexValue::decode(&bytes)
            .ok_or_else(|| StoreError::Backend("invalid spent index entry".to_string()))
            .map(Some)
    }
}
