mod common;

use std::sync::Arc;

use common::{coinbase, mine, reward, TestNode, OP_TRUE};
use divid_chainstate::coinsdb::StoreCoinsView;
use divid_chainstate::txindex::TxIndex;
use divid_consensus::money::{Amount, COIN};
use divid_consensus::Hash256;
use divid_primitives::outpoint::OutPoint;
use divid_primitives::transaction::{Transaction, TxIn, TxOut, OP_RETURN};

#[test]
fn genesis_becomes_the_first_tip() {
    let mut node = TestNode::regtest();
    assert_eq!(node.state.height(), -1);

    let genesis = node.block_on(None, 0, Vec::new());
    node.state.accept_block(&genesis, None).expect("accept genesis");

    let tip = node.state.tip().expect("tip");
    assert_eq!(tip.hash, genesis.hash());
    assert_eq!(tip.height, 0);
    assert_eq!(tip.money_supply, 50 * COIN);
    assert_eq!(node.state.coins_best_block().expect("best"), Some(genesis.hash()));

    let coins = node
        .state
        .peek_coins(&genesis.transactions[0].txid())
        .expect("peek")
        .expect("genesis outputs are spendable");
    assert_eq!(coins.height, 0);
    assert!(coins.is_coinbase);
}

#[test]
fn accepting_the_same_block_twice_is_harmless() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 3, 0);
    let block = node.block_on(Some(hashes[2]), 0, Vec::new());
    node.state.accept_block(&block, None).expect("first");
    node.state.accept_block(&block, None).expect("second");
    assert_eq!(node.state.height(), 3);
    assert_eq!(node.state.metrics().snapshot().connect_blocks, 4);
}

#[test]
fn hundred_block_chain_unwinds_to_an_empty_coins_set() {
    let mut node = TestNode::regtest();
    let params = node.params.clone();

    let genesis = mine(
        &params,
        [0u8; 32],
        0,
        vec![coinbase(0, 0, vec![TxOut::new(50 * COIN, vec![OP_RETURN])])],
    );
    node.state.accept_block(&genesis, None).expect("genesis");

    // Every block from height 2 re-spends the output of the previous block's coinbase.
    // Each block sweeps the previous coinbase and the previous sweep into
    // one output; the last coinbase is unspendable.
    let mut prev = genesis.hash();
    let mut prev_coinbase: Option<(Hash256, Amount)> = None;
    let mut sweep: Option<(OutPoint, Amount)> = None;
    let mut expected_supply: Amount = 50 * COIN;
    for height in 1..100 {
        let script = if height == 99 { vec![OP_RETURN] } else { vec![OP_TRUE] };
        let mut transactions = vec![coinbase(
            height,
            0,
            vec![TxOut::new(reward(&params, height), script)],
        )];
        if let Some((txid, value)) = prev_coinbase {
            let mut inputs = vec![TxIn::new(OutPoint::new(txid, 0), Vec::new())];
            let mut total = value;
            if let Some((outpoint, swept)) = sweep {
                inputs.push(TxIn::new(outpoint, Vec::new()));
                total += swept;
            }
            let tx = Transaction {
                version: 1,
                vin: inputs,
                vout: vec![TxOut::new(total, vec![OP_TRUE])],
                lock_time: 0,
            };
            sweep = Some((OutPoint::new(tx.txid(), 0), total));
            transactions.push(tx);
        }
        prev_coinbase = Some((transactions[0].txid(), reward(&params, height)));
        let block = mine(&params, prev, height, transactions);
        node.state.accept_block(&block, None).expect("accept");
        expected_supply += reward(&params, height);
        prev = block.hash();
    }

    let tip = node.state.tip().expect("tip");
    assert_eq!(tip.height, 99);
    assert_eq!(tip.money_supply, expected_supply);
    assert!(node.state.peek_coins(&genesis.transactions[0].txid()).expect("peek").is_none());
    node.state.flush().expect("flush");
    let coins_db = StoreCoinsView::new(Arc::clone(&node.store));
    assert_eq!(coins_db.record_count().expect("count"), 1);
    let (last_sweep, swept) = sweep.expect("sweep");
    let record = node
        .state
        .peek_coins(&last_sweep.hash)
        .expect("peek")
        .expect("final sweep is unspent");
    assert_eq!(record.outputs[0].as_ref().map(|out| out.value), Some(swept));

    node.state.invalidate_block(&genesis.hash()).expect("unwind");
    assert_eq!(node.state.height(), -1);
    assert_eq!(node.state.coins_best_block().expect("best"), Some([0u8; 32]));
    assert_eq!(coins_db.record_count().expect("count"), 0);

    let metrics = node.state.metrics().snapshot();
    assert_eq!(metrics.connect_blocks, 100);
    assert_eq!(metrics.disconnect_blocks, 100);
}

#[test]
fn tx_index_points_at_the_stored_block() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 4, 0);
    let entry = node.state.entry(&hashes[3]).expect("entry").clone();
    let txid = coinbase(3, 0, vec![TxOut::new(reward(&node.params, 3), vec![OP_TRUE])]).txid();
    assert!(node.state.peek_coins(&txid).expect("peek").is_some());

    let index = TxIndex::new(Arc::clone(&node.store));
    let location = index.get(&txid).expect("read").expect("indexed");
    assert_eq!(Some(location.block), entry.data_pos);
    assert_eq!(location.index, 0);
}
