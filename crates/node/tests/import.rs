use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use divid::config::{Backend, Config};
use divid::import::{import_blocks, ImportSummary};
use divid::run_with_config;
use divid_chainstate::flatfiles::DEFAULT_MAX_FILE_SIZE;
use divid_chainstate::incentives::{IncentivesPolicy, LegacyIncentives};
use divid_chainstate::{
    fatal_channel, ChainState, ChainStateOptions, Collaborators, FlatFileBlockStore, StartupOptions,
};
use divid_consensus::{consensus_params, hash256_to_hex, ConsensusParams, Hash256, Network};
use divid_log::LogConfig;
use divid_pow::check_proof_of_work;
use divid_primitives::block::{Block, BlockHeader, CURRENT_BLOCK_VERSION};
use divid_primitives::encoding::encode;
use divid_primitives::outpoint::OutPoint;
use divid_primitives::transaction::{Transaction, TxIn, TxOut};
use divid_storage::memory::MemoryStore;

fn regtest_config(data_dir: &Path, imports: Vec<PathBuf>) -> Config {
    Config {
        backend: Backend::Fjall,
        data_dir: data_dir.to_path_buf(),
        conf_path: data_dir.join("divid.conf"),
        network: Network::Regtest,
        log: LogConfig::default(),
        chainstate: ChainStateOptions::default(),
        startup: StartupOptions::default(),
        imports,
        status: false,
    }
}

fn mine(params: &ConsensusParams, prev: Hash256, height: i32, reward_bonus: i64) -> Block {
    let reward = LegacyIncentives::new(params.clone())
        .expected_reward(height)
        .total();
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), height.to_le_bytes().to_vec())],
        vout: vec![TxOut::new(reward + reward_bonus, vec![0x51])],
        lock_time: 0,
    };
    let mut block = Block {
        header: BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_600_000_000 + height as u32 * 60,
            bits: 0x207f_ffff,
            nonce: 0,
        },
        transactions: vec![coinbase],
        block_sig: Vec::new(),
    };
    block.header.merkle_root = block.merkle_root();
    while check_proof_of_work(&block.header, params).is_err() {
        block.header.nonce += 1;
    }
    block
}

fn write_block_file(path: &Path, records: &[Vec<u8>]) {
    let mut bytes = Vec::new();
    for record in records {
        bytes.extend_from_slice(&(record.len() as u32).to_le_bytes());
        bytes.extend_from_slice(record);
    }
    fs::write(path, bytes).expect("write block file");
}

#[test]
fn imported_chain_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let params = consensus_params(Network::Regtest);

    let mut chain = Vec::new();
    let mut prev = [0u8; 32];
    for height in 0..6 {
        let block = mine(&params, prev, height, 0);
        prev = block.hash();
        chain.push(block);
    }
    let greedy = mine(&params, prev, 6, 1);
    let orphan = mine(&params, [3u8; 32], 9, 0);

    let mut records: Vec<Vec<u8>> = chain.iter().map(encode).collect();
    records.push(encode(&greedy));
    records.push(encode(&orphan));
    let good_file = dir.path().join("bootstrap.dat");
    write_block_file(&good_file, &records);
    let bad_file = dir.path().join("garbage.dat");
    write_block_file(&bad_file, &[vec![0xff; 16]]);

    let data_dir = dir.path().join("node");
    let status = run_with_config(regtest_config(&data_dir, vec![bad_file, good_file]))
        .expect("first run");
    assert_eq!(status.height, 5);
    assert_eq!(status.best_block, Some(hash256_to_hex(&chain[5].hash())));
    // The greedy block is stored and marked invalid; the orphan is dropped.
    assert_eq!(status.known_blocks, 7);
    assert_eq!(status.metrics.connect_blocks, 6);
    assert!(status.indexes.txindex);

    let status = run_with_config(regtest_config(&data_dir, Vec::new())).expect("second run");
    assert_eq!(status.height, 5);
    assert_eq!(status.best_block, Some(hash256_to_hex(&chain[5].hash())));
    assert_eq!(status.metrics.connect_blocks, 0);
    assert_eq!(status.deployments.len(), params.deployments.len());
}

#[test]
fn data_dir_is_exclusive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let _held = divid::store::lock_data_dir(dir.path()).expect("lock");
    let err = run_with_config(regtest_config(dir.path(), Vec::new())).expect_err("locked");
    assert!(err.contains("already locked"), "{err}");
}

#[test]
fn import_counts_blocks_rejected_while_connecting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let params = consensus_params(Network::Regtest);
    let genesis = mine(&params, [0u8; 32], 0, 0);
    let greedy = mine(&params, genesis.hash(), 1, 1);
    let orphan = mine(&params, [3u8; 32], 9, 0);
    let file = dir.path().join("bootstrap.dat");
    write_block_file(&file, &[encode(&genesis), encode(&greedy), encode(&orphan)]);

    let blocks = FlatFileBlockStore::open(dir.path(), DEFAULT_MAX_FILE_SIZE).expect("block files");
    let (sink, abort) = fatal_channel();
    let mut state = ChainState::new(
        params.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(blocks),
        ChainStateOptions::default(),
        Collaborators::standard(&params),
        sink,
    )
    .expect("chain state");
    state
        .load_block_index(&StartupOptions::default())
        .expect("load");

    let summary = import_blocks(&mut state, &file, &abort).expect("import");
    assert_eq!(
        summary,
        ImportSummary {
            read: 3,
            accepted: 1,
            rejected: 1,
            orphans: 1,
        }
    );
    assert_eq!(state.tip_hash(), Some(genesis.hash()));
}
