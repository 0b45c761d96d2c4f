//! Address activity and address-unspent side tables.
//!
//! Keys start with `address_type || hash160` so one prefix scan yields an
//! address's history. Heights and indexes are big-endian to keep entries in
//! chain order.

use divid_consensus::constants::{ADDRESS_TYPE_P2PKH, ADDRESS_TYPE_P2SH};
use divid_consensus::money::Amount;
use divid_consensus::Hash256;
use divid_script::standard::{script_hash160, ScriptType};
use divid_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const ADDRESS_PREFIX_LEN: usize = 21;
const ADDRESS_INDEX_KEY_LEN: usize = ADDRESS_PREFIX_LEN + 4 + 4 + 32 + 4 + 1;
const ADDRESS_UNSPENT_KEY_LEN: usize = ADDRESS_PREFIX_LEN + 32 + 4;

/// Address type and hash160 of a P2PKH or P2SH script.
pub fn script_address(script_pubkey: &[u8]) -> Option<(u8, [u8; 20])> {
    let (kind, hash) = script_hash160(script_pubkey)?;
    let address_type = match kind {
        ScriptType::P2Pkh => ADDRESS_TYPE_P2PKH,
        ScriptType::P2Sh => ADDRESS_TYPE_P2SH,
        _ => return None,
    };
    Some((address_type, hash))
}

pub fn address_prefix(address_type: u8, hash: &[u8; 20]) -> [u8; ADDRESS_PREFIX_LEN] {
    let mut prefix = [0u8; ADDRESS_PREFIX_LEN];
    prefix[0] = address_type;
    prefix[1..].copy_from_slice(hash);
    prefix
}

/// One credit (`spending == false`) or debit of an address.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct AddressIndexKey {
    pub address_type: u8,
    pub hash: [u8; 20],
    pub block_height: i32,
    pub tx_index: u32,
    pub txid: Hash256,
    /// Output index for credits, input index for debits.
    pub io_index: u32,
    pub spending: bool,
}

impl AddressIndexKey {
    pub fn encode(&self) -> [u8; ADDRESS_INDEX_KEY_LEN] {
        let mut out = [0u8; ADDRESS_INDEX_KEY_LEN];
        out[..21].copy_from_slice(&address_prefix(self.address_type, &self.hash));
        out[21..25].copy_from_slice(&self.block_height.to_be_bytes());
        out[25..29].copy_from_slice(&self.tx_index.to_be_bytes());
        out[29..61].copy_from_slice(&self.txid);
        out[61..65].copy_from_slice(&self.io_index.to_be_bytes());
        out[65] = u8::from(self.spending);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ADDRESS_INDEX_KEY_LEN {
            return None;
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[1..21]);
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[29..61]);
        Some(Self {
            address_type: bytes[0],
            hash,
            block_height: i32::from_be_bytes(bytes[21..25].try_into().ok()?),
            tx_index: u32::from_be_bytes(bytes[25..29].try_into().ok()?),
            txid,
            io_index: u32::from_be_bytes(bytes[61..65].try_into().ok()?),
            spending: bytes[65] != 0,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct AddressUnspentKey {
    pub address_type: u8,
    pub hash: [u8; 20],
    pub txid: Hash256,
    pub index: u32,
}

impl AddressUnspentKey {
    pub fn encode(&self) -> [u8; ADDRESS_UNSPENT_KEY_LEN] {
        let mut out = [0u8; ADDRESS_UNSPENT_KEY_LEN];
        out[..21].copy_from_slice(&address_prefix(self.address_type, &self.hash));
        out[21..53].copy_from_slice(&self.txid);
        out[53..57].copy_from_slice(&self.index.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ADDRESS_UNSPENT_KEY_LEN {
            return None;
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[1..21]);
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[21..53]);
        Some(Self {
            address_type: bytes[0],
            hash,
            txid,
            index: u32::from_be_bytes(bytes[53..57].try_into().ok()?),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressUnspentValue {
    pub satoshis: Amount,
    pub script_pubkey: Vec<u8>,
    pub block_height: i32,
}

impl AddressUnspentValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.script_pubkey.len());
        out.extend_from_slice(&self.satoshis.to_le_bytes());
        out.extend_from_slice(&self.block_height.to_le_bytes());
        out.extend_from_slice(&self.script_pubkey);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        Some(Self {
            satoshis: i64::from_le_bytes(bytes[0..8].try_into().ok()?),
            block_height: i32::from_le_bytes(bytes[8..12].try_into().ok()?),
            script_pubkey: bytes[12..].to_vec(),
        })
    }
}

pub struct AddressIndex<S> {
    store: S,
}

impl<S> AddressIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> AddressIndex<S> {
    pub fn insert_delta(batch: &mut WriteBatch, key: &AddressIndexKey, amount: Amount) {
        batch.put(Column::AddressIndex, key.encode(), amount.to_le_bytes());
    }

    pub fn erase_delta(batch: &mut WriteBatch, key: &AddressIndexKey) {
        batch.delete(Column::AddressIndex, key.encode());
    }

    /// Writes `value`, or erases the entry when it is `None`.
    pub fn update_unspent(
        batch: &mut WriteBatch,
        key: &AddressUnspentKey,
        value: Option<&AddressUnspentValue>,
    ) {
        match value {
            Some(value) => batch.put(Column::AddressUnspent, key.encode(), value.encode()),
            None => batch.delete(Column::AddressUnspent, key.encode()),
        }
    }

    /// Every delta recorded for an address, optionally bounded by inclusive heights.
    pub fn deltas(
        &self,
        address_type: u8,
        hash: &[u8; 20],
        heights: Option<(i32, i32)>,
    ) -> Result<Vec<(AddressIndexKey, Amount)>, StoreError> {
        let prefix = address_prefix(address_type, hash);
        let mut out = Vec::new();
        self.store
            .for_each_prefix(Column::AddressIndex, &prefix, &mut |key, value| {
                let key = AddressIndexKey::decode(key)
                    .ok_or_else(|| StoreError::Backend("invalid address index key".to_string()))?;
                if let Some((start, end)) = heights {
                    if key.block_height < start || key.block_height > end {
                        return Ok(());
                    }
                }
                let amount = <[u8; 8]>::try_from(value)
                    .map(i64::from_le_bytes)
                    .map_err(|_| StoreError::Backend("invalid address index value".to_string()))?;
                out.push((key, amount));
                Ok(())
            })?;
        out.sort_by_key(|(key, _)| *key);
        Ok(out)
    }

    pub fn unspent(
        &self,
        address_type: u8,
        hash: &[u8; 20],
    ) -> Result<Vec<(AddressUnspentKey, AddressUnspentValue)>, StoreError> {
        let prefix = address_prefix(address_type, hash);
        let entries = self.store.scan_prefix(Column::AddressUnspent, &prefix)?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let key = AddressUnspentKey::decode(&key)
                .ok_or_else(|| StoreError::Backend("invalid address unspent key".to_string()))?;
            let value = AddressUnspentValue::decode(&value)
                .ok_or_else(|| StoreError::Backend("invalid address unspent value".to_string()))?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Sum of all deltas for an address.
    pub fn balance(&self, address_type: u8, hash: &[u8; 20]) -> Result<Amount, StoreError> {
        Ok(self
            .deltas(address_type, hash, None)?
            .iter()
            .map(|(_, amount)| *amount)
            .sum())
    }
}
