mod common;

use common::{coinbase, reward, TestNode, OP_TRUE};
use divid_chainstate::blockindex::{BLOCK_FAILED_CHILD, BLOCK_FAILED_VALID};
use divid_primitives::transaction::TxOut;

fn coinbase_txid(node: &TestNode, height: i32, tag: u8) -> divid_consensus::Hash256 {
    coinbase(
        height,
        tag,
        vec![TxOut::new(reward(&node.params, height), vec![OP_TRUE])],
    )
    .txid()
}

#[test]
fn longer_fork_replaces_the_active_chain() {
    let mut node = TestNode::regtest();
    let main = node.extend(None, 6, 0);
    assert_eq!(node.state.height(), 5);

    // Fork off height 2. Equal work keeps the first-seen tip.
    let fork = node.extend(Some(main[2]), 3, 1);
    assert_eq!(node.state.tip_hash(), Some(main[5]));
    assert!(node.state.graph().is_candidate(node.state.graph().lookup(&main[5]).expect("id")));

    let fork_tail = node.extend(Some(fork[2]), 2, 1);
    assert_eq!(node.state.tip_hash(), Some(fork_tail[1]));
    assert_eq!(node.state.height(), 7);

    for height in 3..=5 {
        assert!(node
            .state
            .peek_coins(&coinbase_txid(&node, height, 0))
            .expect("peek")
            .is_none());
    }
    for height in 3..=7 {
        assert!(node
            .state
            .peek_coins(&coinbase_txid(&node, height, 1))
            .expect("peek")
            .is_some());
    }
    assert!(node
        .state
        .peek_coins(&coinbase_txid(&node, 2, 0))
        .expect("peek")
        .is_some());

    let metrics = node.state.metrics().snapshot();
    assert_eq!(metrics.disconnect_blocks, 3);
}

#[test]
fn equal_work_forks_keep_the_first_seen_tip() {
    let mut node = TestNode::regtest();
    let base = node.extend(None, 2, 0);
    let first = node.extend(Some(base[1]), 5, 1);
    let second = node.extend(Some(base[1]), 5, 2);
    assert_eq!(node.state.tip_hash(), Some(first[4]));

    let graph = node.state.graph();
    let first_tip = graph.get(graph.lookup(&first[4]).expect("id"));
    let second_tip = graph.get(graph.lookup(&second[4]).expect("id"));
    assert_eq!(first_tip.chain_work, second_tip.chain_work);
    assert!(first_tip.sequence_id < second_tip.sequence_id);
    assert_eq!(node.state.metrics().snapshot().disconnect_blocks, 0);

    let extension = node.extend(Some(second[4]), 1, 2);
    assert_eq!(node.state.tip_hash(), Some(extension[0]));
    assert_eq!(node.state.height(), 7);
    let metrics = node.state.metrics().snapshot();
    assert_eq!(metrics.disconnect_blocks, 5);
    assert_eq!(metrics.connect_blocks, 13);
    for height in 2..=6 {
        assert!(node
            .state
            .peek_coins(&coinbase_txid(&node, height, 1))
            .expect("peek")
            .is_none());
        assert!(node
            .state
            .peek_coins(&coinbase_txid(&node, height, 2))
            .expect("peek")
            .is_some());
    }
}

#[test]
fn invalidate_then_reconsider_restores_the_tip() {
    let mut node = TestNode::regtest();
    let main = node.extend(None, 7, 0);

    node.state.invalidate_block(&main[4]).expect("invalidate");
    assert_eq!(node.state.height(), 3);
    assert_eq!(node.state.tip_hash(), Some(main[3]));
    let status = |node: &TestNode, hash| node.state.entry(hash).expect("entry").status;
    assert_ne!(status(&node, &main[4]) & BLOCK_FAILED_VALID, 0);
    assert_ne!(status(&node, &main[6]) & BLOCK_FAILED_CHILD, 0);

    // The invalidated branch is not re-entered by new work elsewhere.
    let side = node.extend(Some(main[3]), 1, 2);
    assert_eq!(node.state.tip_hash(), Some(side[0]));

    node.state.reconsider_block(&main[4]).expect("reconsider");
    assert_eq!(node.state.tip_hash(), Some(main[6]));
    assert_eq!(status(&node, &main[6]) & (BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD), 0);
}

#[test]
fn children_of_an_invalid_block_are_rejected() {
    let mut node = TestNode::regtest();
    let main = node.extend(None, 3, 0);
    node.state.invalidate_block(&main[2]).expect("invalidate");

    let child = node.block_on(Some(main[2]), 0, Vec::new());
    let err = node.state.accept_block(&child, None).expect_err("child of failed block");
    assert!(err.is_consensus());
    assert_eq!(node.state.tip_hash(), Some(main[1]));
}

#[test]
fn orphan_headers_are_reported() {
    let mut node = TestNode::regtest();
    let main = node.extend(None, 2, 0);
    let mut orphan = node.block_on(Some(main[1]), 0, Vec::new());
    orphan.header.prev_block = [7u8; 32];
    common::reseal(&node.params, &mut orphan);
    let err = node.state.accept_block(&orphan, None).expect_err("orphan");
    assert!(matches!(
        err,
        divid_chainstate::ChainStateError::OrphanHeader(prev) if prev == [7u8; 32]
    ));
    assert!(!err.is_fatal());
}
