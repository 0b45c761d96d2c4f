mod common;

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use common::{coinbase, reward, try_open_state, TestNode, OP_TRUE};
use divid_chainstate::blocktree::{BlockTreeFlag, BlockTreeStore};
use divid_chainstate::{ChainStateError, ChainStateOptions, Collaborators, IndexingFlags, StartupOptions};
use divid_consensus::{consensus_params, Hash256, Network};
use divid_primitives::transaction::TxOut;
use divid_storage::memory::MemoryStore;
use divid_storage::WriteBatch;

fn coinbase_txid(node: &TestNode, height: i32) -> Hash256 {
    coinbase(
        height,
        0,
        vec![TxOut::new(reward(&node.params, height), vec![OP_TRUE])],
    )
    .txid()
}

fn has_coinbase(node: &TestNode, height: i32) -> bool {
    node.state
        .peek_coins(&coinbase_txid(node, height))
        .expect("peek")
        .is_some()
}

fn set_tree_best_block(node: &TestNode, hash: &Hash256) {
    let tree = BlockTreeStore::new(Arc::clone(&node.store));
    let mut batch = WriteBatch::new();
    BlockTreeStore::<Arc<MemoryStore>>::put_best_block(&mut batch, hash);
    tree.write_batch(&batch).expect("write best block");
}

#[test]
fn clean_shutdown_resumes_at_the_same_tip() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 5, 0);
    node.state.shutdown().expect("shutdown");
    assert!(node
        .state
        .block_tree()
        .read_flag(BlockTreeFlag::Shutdown)
        .expect("flag"));

    node.restart(&StartupOptions::default());
    assert_eq!(node.state.tip_hash(), Some(hashes[4]));
    assert_eq!(node.state.graph().len(), 5);
    assert!(!node
        .state
        .block_tree()
        .read_flag(BlockTreeFlag::Shutdown)
        .expect("flag"));

    let more = node.extend(Some(hashes[4]), 1, 0);
    assert_eq!(node.state.tip_hash(), Some(more[0]));
}

#[test]
fn restart_after_unwinding_the_whole_chain() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 3, 0);
    node.state.invalidate_block(&hashes[0]).expect("unwind");
    assert_eq!(node.state.height(), -1);
    node.state.shutdown().expect("shutdown");

    node.restart(&StartupOptions::default());
    assert_eq!(node.state.tip_hash(), None);
    assert_eq!(node.state.coins_best_block().expect("best"), None);
    assert_eq!(node.state.block_tree().best_block().expect("best"), None);
    assert!(!has_coinbase(&node, 0));

    // Without a clean shutdown the empty tip goes through reconciliation.
    node.restart(&StartupOptions::default());
    assert_eq!(node.state.tip_hash(), None);

    node.state.reconsider_block(&hashes[0]).expect("reconsider");
    assert_eq!(node.state.tip_hash(), Some(hashes[2]));
    assert!(has_coinbase(&node, 2));
}

#[test]
fn crash_replays_blocks_missing_from_the_coins_database() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 3, 0);
    node.state.flush().expect("flush");
    let later = node.extend(Some(hashes[2]), 3, 0);
    assert_eq!(node.state.block_tree().best_block().expect("best"), Some(later[2]));

    node.restart(&StartupOptions::default());
    assert_eq!(node.state.tip_hash(), Some(later[2]));
    assert_eq!(node.state.coins_best_block().expect("best"), Some(later[2]));
    for height in 0..=5 {
        assert!(has_coinbase(&node, height), "coinbase at height {height}");
    }
}

#[test]
fn crash_rolls_back_coins_ahead_of_the_block_tree() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 6, 0);
    node.state.flush().expect("flush");
    set_tree_best_block(&node, &hashes[3]);

    node.restart(&StartupOptions::default());
    assert_eq!(node.state.tip_hash(), Some(hashes[3]));
    assert!(has_coinbase(&node, 3));
    assert!(!has_coinbase(&node, 4));
    assert!(!has_coinbase(&node, 5));

    node.state.activate_best_chain().expect("activate");
    assert_eq!(node.state.tip_hash(), Some(hashes[5]));
    assert!(has_coinbase(&node, 5));
}

#[test]
fn force_start_skips_reconciliation() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 3, 0);
    node.state.flush().expect("flush");
    let later = node.extend(Some(hashes[2]), 2, 0);

    node.restart(&StartupOptions {
        force_start: true,
        ..StartupOptions::default()
    });
    assert_eq!(node.state.tip_hash(), Some(hashes[2]));
    assert!(!has_coinbase(&node, 3));

    node.state.activate_best_chain().expect("activate");
    assert_eq!(node.state.tip_hash(), Some(later[1]));
}

#[test]
fn unknown_tree_best_block_needs_recovery() {
    let params = consensus_params(Network::Regtest);
    let options = ChainStateOptions {
        indexing: IndexingFlags {
            address_index: true,
            spent_index: true,
            tx_index: true,
        },
        ..ChainStateOptions::default()
    };
    let mut node = TestNode::build(params.clone(), options, Collaborators::standard(&params));
    let hashes = node.extend(None, 3, 0);
    node.state.flush().expect("flush");
    set_tree_best_block(&node, &[9u8; 32]);

    let err = try_open_state(
        &params,
        &node.store,
        node.dir.path(),
        options,
        Collaborators::standard(&params),
        &StartupOptions::default(),
    )
    .err()
    .expect("unusable block tree");
    assert!(matches!(err, ChainStateError::Corruption(_)));

    node.restart(&StartupOptions {
        recover_block_db: true,
        ..StartupOptions::default()
    });
    assert_eq!(node.state.tip_hash(), Some(hashes[2]));
    let indexing = node.state.indexing();
    assert!(!indexing.address_index);
    assert!(!indexing.spent_index);
    assert!(indexing.tx_index);
    assert_eq!(node.state.block_tree().best_block().expect("best"), Some(hashes[2]));
}

#[test]
fn corrupt_undo_data_aborts_the_disconnect() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 4, 0);

    let undo_file = node.dir.path().join("rev00000.dat");
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&undo_file)
        .expect("undo file");
    // Flip the last checksum byte of the newest undo record.
    let last = file.seek(SeekFrom::End(-1)).expect("seek");
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).expect("read");
    file.seek(SeekFrom::Start(last)).expect("seek");
    file.write_all(&[byte[0] ^ 0xff]).expect("corrupt");
    drop(file);

    let err = node.state.invalidate_block(&hashes[3]).expect_err("bad undo");
    assert!(err.is_fatal());
    assert!(node.abort.is_raised());
    assert!(node.abort.try_recv().is_some());
    assert_eq!(node.state.tip_hash(), Some(hashes[3]));
}

#[test]
fn storage_failure_is_fatal() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 2, 0);
    node.store.set_fail_writes(true);

    let block = node.block_on(Some(hashes[1]), 0, Vec::new());
    let err = node.state.accept_block(&block, None).expect_err("writes fail");
    assert!(matches!(err, ChainStateError::Store(_)));
    assert!(node.abort.is_raised());
    assert_eq!(node.state.tip_hash(), Some(hashes[1]));
}
