//! Per-transaction unspent-output records and the layered coins cache.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use divid_consensus::money::Amount;
use divid_consensus::Hash256;
use divid_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use divid_primitives::outpoint::OutPoint;
use divid_primitives::transaction::{Transaction, TxIn, TxOut};
use divid_storage::StoreError;

use crate::undo::{InputUndo, TxUndo};

/// Unspent outputs of one transaction. Spent outputs are `None`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoinsRecord {
    pub is_coinbase: bool,
    pub is_coinstake: bool,
    pub outputs: Vec<Option<TxOut>>,
    pub height: i32,
    pub version: i32,
}

static EMPTY_RECORD: CoinsRecord = CoinsRecord {
    is_coinbase: false,
    is_coinstake: false,
    outputs: Vec::new(),
    height: 0,
    version: 0,
};

impl CoinsRecord {
    /// Record for a freshly confirmed transaction. `OP_RETURN` outputs start spent.
    pub fn from_tx(tx: &Transaction, height: i32) -> Self {
        let mut record = Self {
            is_coinbase: tx.is_coinbase(),
            is_coinstake: tx.is_coinstake(),
            outputs: tx
                .vout
                .iter()
                .map(|output| (!output.is_unspendable()).then(|| output.clone()))
                .collect(),
            height,
            version: tx.version,
        };
        record.cleanup();
        record
    }

    pub fn clear(&mut self) {
        self.is_coinbase = false;
        self.is_coinstake = false;
        self.outputs.clear();
        self.height = 0;
        self.version = 0;
    }

    /// Drops trailing spent outputs.
    pub fn cleanup(&mut self) {
        while matches!(self.outputs.last(), Some(None)) {
            self.outputs.pop();
        }
        if self.outputs.is_empty() {
            self.outputs = Vec::new();
        }
    }

    pub fn clear_unspendable(&mut self) {
        for slot in &mut self.outputs {
            if slot.as_ref().is_some_and(TxOut::is_unspendable) {
                *slot = None;
            }
        }
        self.cleanup();
    }

    pub fn is_available(&self, index: u32) -> bool {
        self.output(index).is_some()
    }

    pub fn output(&self, index: u32) -> Option<&TxOut> {
        self.outputs.get(index as usize).and_then(Option::as_ref)
    }

    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    /// Spends one output. The undo record carries the transaction metadata
    /// only when this spend leaves the record pruned.
    pub fn spend(&mut self, index: u32) -> Option<InputUndo> {
        let output = self.outputs.get_mut(index as usize)?.take()?;
        let mut undo = InputUndo {
            output,
            ..InputUndo::default()
        };
        self.cleanup();
        if self.outputs.is_empty() {
            undo.height = self.height;
            undo.is_coinbase = self.is_coinbase;
            undo.is_coinstake = self.is_coinstake;
            undo.version = self.version;
        }
        Some(undo)
    }

    /// Both pruned, or identical in every field.
    pub fn matches(&self, other: &CoinsRecord) -> bool {
        if self.is_pruned() && other.is_pruned() {
            return true;
        }
        self == other
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_u8(u8::from(self.is_coinbase) | (u8::from(self.is_coinstake) << 1));
        encoder.write_i32_le(self.height);
        encoder.write_varint(self.outputs.len() as u64);
        for slot in &self.outputs {
            match slot {
                Some(output) => {
                    encoder.write_bool(true);
                    output.consensus_encode(&mut encoder);
                }
                None => encoder.write_bool(false),
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_i32_le()?;
        let flags = decoder.read_u8()?;
        if flags & !0b11 != 0 {
            return Err(DecodeError::InvalidData("unknown coins flags"));
        }
        let height = decoder.read_i32_le()?;
        let count = decoder.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            outputs.push(if decoder.read_bool()? {
                Some(TxOut::consensus_decode(&mut decoder)?)
            } else {
                None
            });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            is_coinbase: flags & 1 != 0,
            is_coinstake: flags & 2 != 0,
            outputs,
            height,
            version,
        })
    }
}

pub const CACHE_DIRTY: u8 = 1;
/// The parent view has no unpruned record for this txid.
pub const CACHE_FRESH: u8 = 2;

#[derive(Clone, Debug, Default)]
pub struct CacheEntry {
    pub coins: CoinsRecord,
    pub flags: u8,
}

pub type CoinsMap = HashMap<Hash256, CacheEntry>;

pub trait CoinsView {
    /// Reads the record for `txid`, warming any cache layers on the way.
    fn get_coins(&mut self, txid: &Hash256) -> Result<Option<CoinsRecord>, StoreError>;

    /// Reads without populating caches.
    fn peek_coins(&self, txid: &Hash256) -> Result<Option<CoinsRecord>, StoreError>;

    fn best_block(&self) -> Result<Option<Hash256>, StoreError>;

    /// Applies the dirty entries of a child cache, then records `best_block`.
    fn batch_write(&mut self, entries: CoinsMap, best_block: Hash256) -> Result<(), StoreError>;
}

impl<V: CoinsView + ?Sized> CoinsView for &mut V {
    fn get_coins(&mut self, txid: &Hash256) -> Result<Option<CoinsRecord>, StoreError> {
        (**self).get_coins(txid)
    }

    fn peek_coins(&self, txid: &Hash256) -> Result<Option<CoinsRecord>, StoreError> {
        (**self).peek_coins(txid)
    }

    fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        (**self).best_block()
    }

    fn batch_write(&mut self, entries: CoinsMap, best_block: Hash256) -> Result<(), StoreError> {
        (**self).batch_write(entries, best_block)
    }
}

/// Outcome of reversing one transaction against the coins view.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxReversalStatus {
    Ok,
    /// Reversed, but the view disagreed with the block or undo data somewhere.
    ContinueWithErrors,
    AbortNoOtherErrors,
    AbortWithOtherErrors,
}

#[derive(Debug)]
pub enum CoinsError {
    Store(StoreError),
    MissingInput(OutPoint),
}

impl std::fmt::Display for CoinsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinsError::Store(err) => write!(f, "{err}"),
            CoinsError::MissingInput(outpoint) => {
                let txid = divid_consensus::hash256_to_hex(&outpoint.hash);
                write!(f, "missing input {txid}:{}", outpoint.index)
            }
        }
    }
}

impl std::error::Error for CoinsError {}

impl From<StoreError> for CoinsError {
    fn from(err: StoreError) -> Self {
        CoinsError::Store(err)
    }
}

/// Overlay over a parent view. Nothing reaches the parent until `flush`.
pub struct CoinsViewCache<V> {
    base: V,
    cache: CoinsMap,
    best_block: Option<Hash256>,
}

impl<V: CoinsView> CoinsViewCache<V> {
    pub fn new(base: V) -> Self {
        Self {
            base,
            cache: CoinsMap::new(),
            best_block: None,
        }
    }

    pub fn base(&self) -> &V {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut V {
        &mut self.base
    }

    fn fetch(&mut self, txid: &Hash256) -> Result<bool, StoreError> {
        if self.cache.contains_key(txid) {
            return Ok(true);
        }
        let Some(coins) = self.base.get_coins(txid)? else {
            return Ok(false);
        };
        let flags = if coins.is_pruned() { CACHE_FRESH } else { 0 };
        self.cache.insert(*txid, CacheEntry { coins, flags });
        Ok(true)
    }

    pub fn access_coins(&mut self, txid: &Hash256) -> Result<Option<&CoinsRecord>, StoreError> {
        if !self.fetch(txid)? {
            return Ok(None);
        }
        Ok(self.cache.get(txid).map(|entry| &entry.coins))
    }

    /// A record with at least one output slot exists.
    pub fn have_coins(&mut self, txid: &Hash256) -> Result<bool, StoreError> {
        Ok(self
            .access_coins(txid)?
            .is_some_and(|coins| !coins.outputs.is_empty()))
    }

    /// Exclusive handle on the record for `txid`, created empty if absent.
    /// The entry is marked dirty; dropping the handle prunes it if it ended
    /// empty and the parent never had it.
    pub fn modify(&mut self, txid: &Hash256) -> Result<ModifyHandle<'_>, StoreError> {
        if !self.cache.contains_key(txid) {
            let parent = self.base.get_coins(txid)?;
            let fresh = parent.as_ref().map_or(true, CoinsRecord::is_pruned);
            self.cache.insert(
                *txid,
                CacheEntry {
                    coins: parent.unwrap_or_default(),
                    flags: if fresh { CACHE_FRESH } else { 0 },
                },
            );
        }
        let entry = self.cache.entry(*txid).or_default();
        entry.flags |= CACHE_DIRTY;
        Ok(ModifyHandle {
            map: &mut self.cache,
            txid: *txid,
        })
    }

    pub fn spend_output(&mut self, outpoint: &OutPoint) -> Result<Option<InputUndo>, StoreError> {
        let mut coins = self.modify(&outpoint.hash)?;
        Ok(coins.spend(outpoint.index))
    }

    pub fn output_for(&mut self, input: &TxIn) -> Result<Option<TxOut>, StoreError> {
        Ok(self
            .access_coins(&input.prevout.hash)?
            .and_then(|coins| coins.output(input.prevout.index).cloned()))
    }

    /// Every input of `tx` refers to an unspent output. Coinbases trivially pass.
    pub fn have_inputs(&mut self, tx: &Transaction) -> Result<bool, StoreError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        for input in &tx.vin {
            let available = self
                .access_coins(&input.prevout.hash)?
                .is_some_and(|coins| coins.is_available(input.prevout.index));
            if !available {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sum of spent output values. Missing inputs count as zero.
    pub fn value_in(&mut self, tx: &Transaction) -> Result<Amount, StoreError> {
        if tx.is_coinbase() {
            return Ok(0);
        }
        let mut total: Amount = 0;
        for input in &tx.vin {
            if let Some(output) = self.output_for(input)? {
                total = total.saturating_add(output.value);
            }
        }
        Ok(total)
    }

    /// Spends the inputs of `tx` and adds its outputs at `height`.
    pub fn apply_confirmed_transaction(
        &mut self,
        tx: &Transaction,
        height: i32,
    ) -> Result<TxUndo, CoinsError> {
        let mut undo = TxUndo::default();
        if !tx.is_coinbase() {
            undo.prevouts.reserve(tx.vin.len());
            for input in &tx.vin {
                let spent = self
                    .spend_output(&input.prevout)?
                    .ok_or(CoinsError::MissingInput(input.prevout))?;
                undo.prevouts.push(spent);
            }
        }
        let mut coins = self.modify(&tx.txid())?;
        *coins = CoinsRecord::from_tx(tx, height);
        Ok(undo)
    }

    /// Removes the outputs `tx` created and, unless it is a coinbase, restores
    /// the outputs it spent from `undo`, last input first.
    pub fn apply_reversed_transaction(
        &mut self,
        tx: &Transaction,
        height: i32,
        undo: Option<&TxUndo>,
    ) -> Result<TxReversalStatus, StoreError> {
        let mut clean = true;
        {
            let expected = CoinsRecord::from_tx(tx, height);
            let mut outs = self.modify(&tx.txid())?;
            outs.clear_unspendable();
            if expected.version < 0 {
                outs.version = expected.version;
            }
            if !outs.matches(&expected) {
                divid_log::log_error!(
                    "disconnect: added transaction {} mismatch, coins database may be corrupt",
                    divid_consensus::hash256_to_hex(&tx.txid())
                );
                clean = false;
            }
            outs.clear();
        }

        if tx.is_coinbase() {
            return Ok(if clean {
                TxReversalStatus::Ok
            } else {
                TxReversalStatus::ContinueWithErrors
            });
        }

        let prevouts = undo.map_or(&[][..], |undo| undo.prevouts.as_slice());
        if prevouts.len() != tx.vin.len() {
            divid_log::log_error!(
                "disconnect: transaction and undo data inconsistent ({} undo entries, {} inputs)",
                prevouts.len(),
                tx.vin.len()
            );
            return Ok(if clean {
                TxReversalStatus::AbortNoOtherErrors
            } else {
                TxReversalStatus::AbortWithOtherErrors
            });
        }

        for (input, spent) in tx.vin.iter().zip(prevouts).rev() {
            if !self.restore_input(&input.prevout, spent)? {
                clean = false;
            }
        }
        Ok(if clean {
            TxReversalStatus::Ok
        } else {
            TxReversalStatus::ContinueWithErrors
        })
    }

    fn restore_input(&mut self, outpoint: &OutPoint, spent: &InputUndo) -> Result<bool, StoreError> {
        let mut clean = true;
        let mut coins = self.modify(&outpoint.hash)?;
        if spent.height != 0 {
            if !coins.is_pruned() {
                divid_log::log_error!("disconnect: undo data overwriting existing transaction");
                clean = false;
            }
            coins.clear();
            coins.is_coinbase = spent.is_coinbase;
            coins.is_coinstake = spent.is_coinstake;
            coins.height = spent.height;
            coins.version = spent.version;
        } else if coins.is_pruned() {
            divid_log::log_error!("disconnect: undo data adding output to missing transaction");
            clean = false;
        }
        if coins.is_available(outpoint.index) {
            divid_log::log_error!("disconnect: undo data overwriting existing output");
            clean = false;
        }
        let index = outpoint.index as usize;
        if coins.outputs.len() <= index {
            coins.outputs.resize(index + 1, None);
        }
        coins.outputs[index] = Some(spent.output.clone());
        Ok(clean)
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.cache
            .values()
            .filter(|entry| entry.flags & CACHE_DIRTY != 0)
            .count()
    }

    /// Pushes every dirty entry into the parent in one batch and empties the cache.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let Some(best_block) = self.best_block()? else {
            return Err(StoreError::Backend("coins cache has no best block".to_string()));
        };
        let entries = std::mem::take(&mut self.cache);
        self.base.batch_write(entries, best_block)
    }

    /// Drops all pending changes.
    pub fn discard(&mut self) {
        self.cache.clear();
        self.best_block = None;
    }
}

impl<V: CoinsView> CoinsView for CoinsViewCache<V> {
    fn get_coins(&mut self, txid: &Hash256) -> Result<Option<CoinsRecord>, StoreError> {
        Ok(self.access_coins(txid)?.cloned())
    }

    fn peek_coins(&self, txid: &Hash256) -> Result<Option<CoinsRecord>, StoreError> {
        match self.cache.get(txid) {
            Some(entry) => Ok(Some(entry.coins.clone())),
            None => self.base.peek_coins(txid),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        match self.best_block {
            Some(hash) => Ok(Some(hash)),
            None => self.base.best_block(),
        }
    }

    fn batch_write(&mut self, entries: CoinsMap, best_block: Hash256) -> Result<(), StoreError> {
        for (txid, child) in entries {
            if child.flags & CACHE_DIRTY == 0 {
                continue;
            }
            match self.cache.entry(txid) {
                Entry::Vacant(vacant) => {
                    if !child.coins.is_pruned() {
                        vacant.insert(CacheEntry {
                            coins: child.coins,
                            flags: CACHE_DIRTY | CACHE_FRESH,
                        });
                    }
                }
                Entry::Occupied(mut occupied) => {
                    if occupied.get().flags & CACHE_FRESH != 0 && child.coins.is_pruned() {
                        occupied.remove();
                    } else {
                        let entry = occupied.get_mut();
                        entry.coins = child.coins;
                        entry.flags |= CACHE_DIRTY;
                    }
                }
            }
        }
        self.best_block = Some(best_block);
        Ok(())
    }
}

/// Exclusive access to one cache entry. Holding it borrows the cache mutably,
/// so a second handle cannot exist at the same time.
pub struct ModifyHandle<'a> {
    map: &'a mut CoinsMap,
    txid: Hash256,
}

impl Deref for ModifyHandle<'_> {
    type Target = CoinsRecord;

    fn deref(&self) -> &CoinsRecord {
        self.map
            .get(&self.txid)
            .map_or(&EMPTY_RECORD, |entry| &entry.coins)
    }
}

impl DerefMut for ModifyHandle<'_> {
    fn deref_mut(&mut self) -> &mut CoinsRecord {
        &mut self.map.entry(self.txid).or_default().coins
    }
}

impl Drop for ModifyHandle<'_> {
    fn drop(&mut self) {
        if let Entry::Occupied(mut occupied) = self.map.entry(self.txid) {
            occupied.get_mut().coins.cleanup();
            let entry = occupied.get();
            if entry.flags & CACHE_FRESH != 0 && entry.coins.is_pruned() {
                occupied.remove();
            }
        }
    }
}
