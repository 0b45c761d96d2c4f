//! Side-table deltas produced while connecting or disconnecting a block.

use divid_consensus::money::Amount;
use divid_consensus::Hash256;
use divid_primitives::outpoint::OutPoint;
use divid_primitives::transaction::Transaction;

use crate::address_index::{script_address, AddressIndexKey, AddressUnspentKey, AddressUnspentValue};
use crate::spentindex::SpentIndexValue;
use crate::txindex::TxLocation;
use crate::undo::TxUndo;

/// Where a transaction sits in the chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxLocationRef {
    pub txid: Hash256,
    pub block_height: i32,
    pub tx_index: u32,
}

impl TxLocationRef {
    pub fn new(tx: &Transaction, block_height: i32, tx_index: u32) -> Self {
        Self {
            txid: tx.txid(),
            block_height,
            tx_index,
        }
    }
}

/// Deltas for one block. `None` values erase the keyed entry.
#[derive(Clone, Debug, Default)]
pub struct IndexDatabaseUpdates {
    pub address_indexing: bool,
    pub spent_indexing: bool,
    pub address_index: Vec<(AddressIndexKey, Amount)>,
    pub address_unspent: Vec<(AddressUnspentKey, Option<AddressUnspentValue>)>,
    pub spent_index: Vec<(OutPoint, Option<SpentIndexValue>)>,
    pub tx_locations: Vec<(Hash256, TxLocation)>,
}

impl IndexDatabaseUpdates {
    pub fn new(address_indexing: bool, spent_indexing: bool) -> Self {
        Self {
            address_indexing,
            spent_indexing,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.address_index.is_empty()
            && self.address_unspent.is_empty()
            && self.spent_index.is_empty()
            && self.tx_locations.is_empty()
    }
}

/// Turns transactions into side-table deltas.
///
/// `spent` carries the outputs consumed by `tx`, one per input; it is `None`
/// for the coinbase.
pub trait IndexDatabaseUpdateCollector: Send + Sync {
    fn record_transaction(
        &self,
        tx: &Transaction,
        location: &TxLocationRef,
        spent: Option<&TxUndo>,
        updates: &mut IndexDatabaseUpdates,
    );

    fn reverse_transaction(
        &self,
        tx: &Transaction,
        location: &TxLocationRef,
        spent: Option<&TxUndo>,
        updates: &mut IndexDatabaseUpdates,
    );
}

/// Records P2PKH and P2SH activity according to the flags on the updates.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardIndexCollector;

impl IndexDatabaseUpdateCollector for StandardIndexCollector {
    fn record_transaction(
        &self,
        tx: &Transaction,
        location: &TxLocationRef,
        spent: Option<&TxUndo>,
        updates: &mut IndexDatabaseUpdates,
    ) {
        if let Some(spent) = spent.filter(|_| !tx.is_coinbase()) {
            for (input_index, (input, prevout)) in tx.vin.iter().zip(&spent.prevouts).enumerate() {
                let input_index = input_index as u32;
                let output = &prevout.output;
                let address = script_address(&output.script_pubkey);
                if updates.address_indexing {
                    if let Some((address_type, hash)) = address {
                        updates.address_index.push((
                            AddressIndexKey {
                                address_type,
                                hash,
                                block_height: location.block_height,
                                tx_index: location.tx_index,
                                txid: location.txid,
                                io_index: input_index,
                                spending: true,
                            },
                            -output.value,
                        ));
                        updates.address_unspent.push((
                            AddressUnspentKey {
                                address_type,
                                hash,
                                txid: input.prevout.hash,
                                index: input.prevout.index,
                            },
                            None,
                        ));
                    }
                }
                if updates.spent_indexing {
                    let (address_type, address_hash) = address.unwrap_or((0, [0u8; 20]));
                    updates.spent_index.push((
                        input.prevout,
                        Some(SpentIndexValue {
                            txid: location.txid,
                            input_index,
                            block_height: location.block_height,
                            satoshis: output.value,
                            address_type,
                            address_hash,
                        }),
                    ));
                }
            }
        }

        if !updates.address_indexing {
            return;
        }
        for (index, output) in tx.vout.iter().enumerate() {
            let Some((address_type, hash)) = script_address(&output.script_pubkey) else {
                continue;
            };
            updates.address_index.push((
                AddressIndexKey {
                    address_type,
                    hash,
                    block_height: location.block_height,
                    tx_index: location.tx_index,
                    txid: location.txid,
                    io_index: index as u32,
                    spending: false,
                },
                output.value,
            ));
            updates.address_unspent.push((
                AddressUnspentKey {
                    address_type,
                    hash,
                    txid: location.txid,
                    index: index as u32,
                },
                Some(AddressUnspentValue {
                    satoshis: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    block_height: location.block_height,
                }),
            ));
        }
    }

    fn reverse_transaction(
        &self,
        tx: &Transaction,
        location: &TxLocationRef,
        spent: Option<&TxUndo>,
        updates: &mut IndexDatabaseUpdates,
    ) {
        if updates.address_indexing {
            for (index, output) in tx.vout.iter().enumerate().rev() {
                let Some((address_type, hash)) = script_address(&output.script_pubkey) else {
                    continue;
                };
                updates.address_index.push((
                    AddressIndexKey {
                        address_type,
                        hash,
                        block_height: location.block_height,
                        tx_index: location.tx_index,
                        txid: location.txid,
                        io_index: index as u32,
                        spending: false,
                    },
                    output.value,
                ));
                updates.address_unspent.push((
                    AddressUnspentKey {
                        address_type,
                        hash,
                        txid: location.txid,
                        index: index as u32,
                    },
                    None,
                ));
            }
        }

        let Some(spent) = spent.filter(|_| !tx.is_coinbase()) else {
            return;
        };
        for (input_index, (input, prevout)) in
            tx.vin.iter().zip(&spent.prevouts).enumerate().rev()
        {
            let output = &prevout.output;
            if updates.address_indexing {
                if let Some((address_type, hash)) = script_address(&output.script_pubkey) {
                    updates.address_index.push((
                        AddressIndexKey {
                            address_type,
                            hash,
                            block_height: location.block_height,
                            tx_index: location.tx_index,
                            txid: location.txid,
                            io_index: input_index as u32,
                            spending: true,
                        },
                        -output.value,
                    ));
                    updates.address_unspent.push((
                        AddressUnspentKey {
                            address_type,
                            hash,
                            txid: input.prevout.hash,
                            index: input.prevout.index,
                        },
                        Some(AddressUnspentValue {
                            satoshis: output.value,
                            script_pubkey: output.script_pubkey.clone(),
                            // Zero unless the undo record carries coin metadata.
                            block_height: prevout.height,
                        }),
                    ));
                }
            }
            if updates.spent_indexing {
                updates.spent_index.push((input.prevout, None));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::undo::InputUndo;
    use divid_primitives::transaction::{TxIn, TxOut};
    use divid_script::standard::{p2pkh_script, p2sh_script};

    fn spend_tx() -> (Transaction, TxUndo) {
        let tx = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([4u8; 32], 1), Vec::new())],
            vout: vec![
                TxOut::new(60, p2sh_script(&[0xbb; 20])),
                TxOut::new(30, vec![0x51]),
            ],
            lock_time: 0,
        };
        let undo = TxUndo {
            prevouts: vec![InputUndo {
                output: TxOut::new(100, p2pkh_script(&[0xaa; 20])),
                ..InputUndo::default()
            }],
        };
        (tx, undo)
    }

    #[test]
    fn confirmed_spend_records_both_sides() {
        let (tx, undo) = spend_tx();
        let location = TxLocationRef::new(&tx, 12, 1);
        let mut updates = IndexDatabaseUpdates::new(true, true);
        StandardIndexCollector.record_transaction(&tx, &location, Some(&undo), &mut updates);

        assert_eq!(updates.address_index.len(), 2);
        let (debit, amount) = &updates.address_index[0];
        assert!(debit.spending);
        assert_eq!((debit.address_type, debit.hash, *amount), (1, [0xaa; 20], -100));
        let (credit, amount) = &updates.address_index[1];
        assert!(!credit.spending);
        assert_eq!((credit.address_type, *amount), (2, 60));

        assert_eq!(updates.address_unspent[0].1, None);
        assert!(updates.address_unspent[1].1.is_some());
        let (outpoint, value) = &updates.spent_index[0];
        assert_eq!(*outpoint, OutPoint::new([4u8; 32], 1));
        let value = value.expect("spent value");
        assert_eq!((value.satoshis, value.address_type, value.block_height), (100, 1, 12));
    }

    #[test]
    fn reversal_erases_what_confirmation_added() {
        let (tx, undo) = spend_tx();
        let location = TxLocationRef::new(&tx, 12, 1);
        let mut updates = IndexDatabaseUpdates::new(true, true);
        StandardIndexCollector.reverse_transaction(&tx, &location, Some(&undo), &mut updates);

        assert_eq!(updates.address_unspent.len(), 2);
        assert_eq!(updates.address_unspent[0].0.txid, location.txid);
        assert_eq!(updates.address_unspent[0].1, None);
        let restored = updates.address_unspent[1].1.as_ref().expect("restored unspent");
        assert_eq!(restored.satoshis, 100);
        assert_eq!(updates.spent_index, vec![(OutPoint::new([4u8; 32], 1), None)]);
    }

    #[test]
    fn disabled_flags_produce_nothing() {
        let (tx, undo) = spend_tx();
        let location = TxLocationRef::new(&tx, 3, 1);
        let mut updates = IndexDatabaseUpdates::new(false, false);
        StandardIndexCollector.record_transaction(&tx, &location, Some(&undo), &mut updates);
        assert!(updates.is_empty());
    }
}
