mod common;

use std::sync::Arc;

use common::{
    coinbase, mine, reseal, reward, spend, RejectingVerifier, TestNode, GENESIS_TIME, OP_TRUE,
};
use divid_chainstate::incentives::{IncentivesPolicy, LegacyIncentives};
use divid_chainstate::peers::MisbehaviorScores;
use divid_chainstate::{ChainStateError, ChainStateOptions, Collaborators};
use divid_consensus::money::COIN;
use divid_consensus::deployments::{
    Bip9Deployment, ThresholdState, DEPLOYMENT_CHECKLOCKTIMEVERIFY, NO_TIMEOUT, VERSIONBITS_TOP_BITS,
};
use divid_consensus::{consensus_params, ConsensusParams, Network};
use divid_pow::check_proof_of_work;
use divid_primitives::block::Block;
use divid_primitives::outpoint::OutPoint;
use divid_primitives::transaction::{Transaction, TxOut};
use divid_script::verify::SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;

const PEER: u64 = 11;

fn reject_reason(err: ChainStateError) -> &'static str {
    match err {
        ChainStateError::Validation(err) => err.reject_reason,
        other => panic!("expected a consensus rejection, got {other}"),
    }
}

fn node_with_peers(params: ConsensusParams) -> (TestNode, Arc<MisbehaviorScores>) {
    let peers = Arc::new(MisbehaviorScores::new());
    let mut collaborators = Collaborators::standard(&params);
    collaborators.peers = peers.clone();
    (
        TestNode::build(params, ChainStateOptions::default(), collaborators),
        peers,
    )
}

fn coinbase_paying(height: i32, value: i64) -> Transaction {
    coinbase(height, 0, vec![TxOut::new(value, vec![OP_TRUE])])
}

fn coinbase_txid(node: &TestNode, height: i32) -> divid_consensus::Hash256 {
    coinbase_paying(height, reward(&node.params, height)).txid()
}

#[test]
fn duplicate_unspent_transaction_is_rejected() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 3, 0);
    // The height-2 coinbase again, with its outputs still unspent.
    let duplicate = coinbase_paying(2, reward(&node.params, 2));
    let block = mine(&node.params, hashes[2], 3, vec![duplicate]);

    let err = node.state.test_block_validity(&block).expect_err("duplicate txid");
    assert_eq!(reject_reason(err), "bad-txns-BIP30");

    let err = node.state.accept_block(&block, None).expect_err("stored but rejected");
    assert_eq!(reject_reason(err), "bad-txns-BIP30");
    assert_eq!(node.state.tip_hash(), Some(hashes[2]));
    assert!(node.state.entry(&block.hash()).expect("entry").is_failed());
}

#[test]
fn premature_coinbase_spend_is_invalid_without_penalty() {
    let mut params = consensus_params(Network::Regtest);
    params.coinbase_maturity = 10;
    let (mut node, peers) = node_with_peers(params);
    let hashes = node.extend(None, 4, 0);

    let value = reward(&node.params, 1);
    let early = spend(
        OutPoint::new(coinbase_txid(&node, 1), 0),
        vec![TxOut::new(value, vec![OP_TRUE])],
    );
    let block = node.block_on(Some(hashes[3]), 0, vec![early]);
    let err = node.state.test_block_validity(&block).expect_err("premature");
    assert_eq!(reject_reason(err), "bad-txns-premature-spend-of-coinbase");

    let err = node.state.accept_block(&block, Some(PEER)).expect_err("stored but rejected");
    assert_eq!(reject_reason(err), "bad-txns-premature-spend-of-coinbase");
    assert_eq!(node.state.tip_hash(), Some(hashes[3]));
    assert!(node.state.entry(&block.hash()).expect("entry").is_failed());
    assert_eq!(peers.score(PEER), 0);
}

#[test]
fn mature_spend_is_accepted() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 3, 0);
    let value = reward(&node.params, 1);
    let mature = spend(
        OutPoint::new(coinbase_txid(&node, 1), 0),
        vec![TxOut::new(value - COIN, vec![OP_TRUE])],
    );
    // The fee may be claimed by the coinbase.
    let height = 3;
    let block = mine(
        &node.params,
        hashes[2],
        height,
        vec![coinbase_paying(height, reward(&node.params, height) + COIN), mature],
    );
    node.state.accept_block(&block, None).expect("accept");
    assert_eq!(node.state.tip_hash(), Some(block.hash()));
    let entry = node.state.entry(&block.hash()).expect("entry");
    assert_eq!(entry.mint, reward(&node.params, height) + COIN);
    let parent_supply = node.state.entry(&hashes[2]).expect("parent").money_supply;
    assert_eq!(entry.money_supply, parent_supply + reward(&node.params, height));
}

#[test]
fn excessive_reward_is_punished() {
    let (mut node, peers) = node_with_peers(consensus_params(Network::Regtest));
    let hashes = node.extend(None, 3, 0);
    let greedy = coinbase_paying(3, reward(&node.params, 3) + 1);
    let block = mine(&node.params, hashes[2], 3, vec![greedy]);

    let err = node.state.test_block_validity(&block).expect_err("greedy");
    assert_eq!(reject_reason(err), "bad-cb-amount");
    let err = node.state.accept_block(&block, Some(PEER)).expect_err("stored but rejected");
    assert_eq!(reject_reason(err), "bad-cb-amount");
    assert_eq!(node.state.tip_hash(), Some(hashes[2]));
    assert_eq!(peers.score(PEER), 100);
    assert!(peers.should_disconnect(PEER));
}

#[test]
fn spending_missing_or_overspending_inputs_fails() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 3, 0);

    let missing = spend(OutPoint::new([5u8; 32], 0), vec![TxOut::new(1, vec![OP_TRUE])]);
    let block = node.block_on(Some(hashes[2]), 0, vec![missing]);
    let err = node.state.test_block_validity(&block).expect_err("missing");
    assert_eq!(reject_reason(err), "bad-txns-inputs-missingorspent");

    let value = reward(&node.params, 1);
    let overspend = spend(
        OutPoint::new(coinbase_txid(&node, 1), 0),
        vec![TxOut::new(value + 1, vec![OP_TRUE])],
    );
    let block = node.block_on(Some(hashes[2]), 0, vec![overspend]);
    let err = node.state.test_block_validity(&block).expect_err("overspend");
    assert_eq!(reject_reason(err), "bad-txns-in-belowout");
}

#[test]
fn too_many_sigops_are_rejected() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 2, 0);
    let script = vec![0xac; 40_001];
    let heavy = coinbase(2, 0, vec![TxOut::new(reward(&node.params, 2), script)]);
    let block = mine(&node.params, hashes[1], 2, vec![heavy]);
    let err = node.state.test_block_validity(&block).expect_err("sigops");
    assert_eq!(reject_reason(err), "bad-blk-sigops");
}

#[test]
fn header_context_rules() {
    let (mut node, peers) = node_with_peers(consensus_params(Network::Regtest));
    let hashes = node.extend(None, 5, 0);

    let mut stale = node.block_on(Some(hashes[4]), 0, Vec::new());
    stale.header.time = GENESIS_TIME;
    reseal(&node.params, &mut stale);
    let err = node.state.accept_block(&stale, Some(PEER)).expect_err("old");
    assert_eq!(reject_reason(err), "time-too-old");
    assert_eq!(peers.score(PEER), 0);

    let mut wrong_bits = node.block_on(Some(hashes[4]), 0, Vec::new());
    wrong_bits.header.bits = 0x1f7f_ffff;
    reseal(&node.params, &mut wrong_bits);
    let err = node.state.accept_block(&wrong_bits, Some(PEER)).expect_err("bits");
    assert_eq!(reject_reason(err), "bad-diffbits");
    assert_eq!(peers.score(PEER), 100);

    let mut weak = node.block_on(Some(hashes[4]), 0, Vec::new());
    while check_proof_of_work(&weak.header, &node.params).is_ok() {
        weak.header.nonce += 1;
    }
    let err = node.state.accept_block(&weak, Some(PEER + 1)).expect_err("weak");
    assert_eq!(reject_reason(err), "high-hash");
    assert_eq!(peers.score(PEER + 1), 50);
    assert_eq!(node.state.height(), 4);
}

#[test]
fn merkle_mismatch_leaves_the_block_retryable() {
    let mut node = TestNode::regtest();
    let hashes = node.extend(None, 2, 0);
    let good = node.block_on(Some(hashes[1]), 0, Vec::new());
    let mut mutated = good.clone();
    mutated.transactions[0].vout[0].value -= 1;

    let err = node.state.accept_block(&mutated, None).expect_err("mutated");
    assert_eq!(reject_reason(err), "bad-txnmrklroot");
    node.state.accept_block(&good, None).expect("genuine block");
    assert_eq!(node.state.tip_hash(), Some(good.hash()));
}

/// Proof of work ends at height 3 and a superblock falls at height 5.
fn staking_params() -> ConsensusParams {
    let mut params = consensus_params(Network::Regtest);
    params.last_pow_block = 3;
    params.treasury_start_block = 5;
    params.treasury_cycle = 5;
    params.lottery_start_block = 1_000;
    params
}

fn staking_block(node: &TestNode, height: i32, stake_from: i32, extra_outputs: Vec<TxOut>) -> Block {
    let prev = node.tip_hash();
    let policy = LegacyIncentives::new(node.params.clone());
    let staked = reward(&node.params, stake_from);
    let mut outputs = vec![
        TxOut::empty(),
        TxOut::new(staked + policy.expected_reward(height).stake, vec![OP_TRUE]),
    ];
    outputs.extend(extra_outputs);
    let coinstake = spend(OutPoint::new(coinbase_txid(node, stake_from), 0), outputs);
    let block = mine(
        &node.params,
        prev,
        height,
        vec![coinbase(height, 0, vec![TxOut::empty()]), coinstake],
    );
    assert!(block.is_proof_of_stake());
    block
}

#[test]
fn stake_and_work_phases_are_enforced() {
    let mut node = TestNode::with_params(staking_params());
    let hashes = node.extend(None, 4, 0);
    assert_eq!(node.state.height(), 3);

    let late_work = node.block_on(Some(hashes[3]), 0, Vec::new());
    let err = node.state.test_block_validity(&late_work).expect_err("pow after cutoff");
    assert_eq!(reject_reason(err), "PoW-ended");

    let stake = staking_block(&node, 4, 1, Vec::new());
    node.state.accept_block(&stake, None).expect("stake block");
    assert_eq!(node.state.height(), 4);
    assert!(node.state.entry(&stake.hash()).expect("entry").is_proof_of_stake);
}

#[test]
fn superblock_must_pay_treasury_and_charity() {
    let params = staking_params();
    let mut collaborators = Collaborators::standard(&params);
    collaborators.incentives = Arc::new(
        LegacyIncentives::new(params.clone()).with_superblock_payees(vec![0xaa], vec![0xbb]),
    );
    let mut node = TestNode::build(params, ChainStateOptions::default(), collaborators);
    node.extend(None, 4, 0);
    let stake = staking_block(&node, 4, 1, Vec::new());
    node.state.accept_block(&stake, None).expect("stake block");

    let unpaid = staking_block(&node, 5, 2, Vec::new());
    let err = node.state.test_block_validity(&unpaid).expect_err("no treasury");
    assert_eq!(reject_reason(err), "bad-cb-payee");

    let expected = LegacyIncentives::new(node.params.clone()).expected_reward(5);
    let paid = staking_block(
        &node,
        5,
        2,
        vec![
            TxOut::new(expected.treasury, vec![0xaa]),
            TxOut::new(expected.charity, vec![0xbb]),
        ],
    );
    node.state.accept_block(&paid, None).expect("superblock");
    assert_eq!(node.state.tip_hash(), Some(paid.hash()));
}

#[test]
fn failed_script_check_rejects_the_block() {
    let params = consensus_params(Network::Regtest);
    let peers = Arc::new(MisbehaviorScores::new());
    let mut collaborators = Collaborators::standard(&params);
    collaborators.verifier = Arc::new(RejectingVerifier::always());
    collaborators.peers = peers.clone();
    let mut node = TestNode::build(params, ChainStateOptions::default(), collaborators);
    let hashes = node.extend(None, 3, 0);

    let spent = OutPoint::new(coinbase_txid(&node, 1), 0);
    let tx = spend(spent, vec![TxOut::new(reward(&node.params, 1), vec![OP_TRUE])]);
    let block = node.block_on(Some(hashes[2]), 0, vec![tx.clone()]);
    let err = node.state.accept_block(&block, Some(PEER)).expect_err("script failure");
    match err {
        ChainStateError::Validation(err) => {
            assert_eq!(err.reject_reason, "mandatory-script-verify-flag-failed");
            assert_eq!(err.dos, 100);
        }
        other => panic!("expected a consensus rejection, got {other}"),
    }
    assert!(node.state.entry(&block.hash()).expect("entry").is_failed());
    assert_eq!(node.state.tip_hash(), Some(hashes[2]));
    assert_eq!(peers.score(PEER), 100);

    assert!(node.state.peek_coins(&spent.hash).expect("peek").is_some());
    assert!(node.state.peek_coins(&tx.txid()).expect("peek").is_none());
    assert!(node.state.peek_coins(&coinbase_txid(&node, 3)).expect("peek").is_none());
}

#[test]
fn lock_time_flag_follows_its_deployment() {
    let mut params = consensus_params(Network::Regtest);
    params.deployments = vec![Bip9Deployment::new(
        DEPLOYMENT_CHECKLOCKTIMEVERIFY,
        0,
        0,
        NO_TIMEOUT,
        4,
        3,
    )];
    let mut collaborators = Collaborators::standard(&params);
    collaborators.verifier = Arc::new(RejectingVerifier::with_flags(SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY));
    let mut node = TestNode::build(params, ChainStateOptions::default(), collaborators);

    // Started after the first period, locked in by signals in the second.
    for height in 0..11 {
        let prev = (height > 0).then(|| node.tip_hash());
        let mut block = node.block_on(prev, 0, Vec::new());
        if (4..8).contains(&height) {
            block.header.version = VERSIONBITS_TOP_BITS | 1;
            reseal(&node.params, &mut block);
        }
        node.state.accept_block(&block, None).expect("accept");
    }
    assert_eq!(
        node.state.deployment_state(DEPLOYMENT_CHECKLOCKTIMEVERIFY),
        Some(ThresholdState::LockedIn)
    );

    let value = reward(&node.params, 9);
    let before = spend(
        OutPoint::new(coinbase_txid(&node, 9), 0),
        vec![TxOut::new(value, vec![OP_TRUE])],
    );
    let block = node.block_on(Some(node.tip_hash()), 0, vec![before]);
    node.state.accept_block(&block, None).expect("flag not yet enforced");
    assert_eq!(node.state.height(), 11);
    assert_eq!(
        node.state.deployment_state(DEPLOYMENT_CHECKLOCKTIMEVERIFY),
        Some(ThresholdState::Active)
    );

    let value = reward(&node.params, 10);
    let after = spend(
        OutPoint::new(coinbase_txid(&node, 10), 0),
        vec![TxOut::new(value, vec![OP_TRUE])],
    );
    let block = node.block_on(Some(node.tip_hash()), 0, vec![after]);
    let err = node.state.accept_block(&block, None).expect_err("flag enforced");
    assert_eq!(reject_reason(err), "mandatory-script-verify-flag-failed");
    assert_eq!(node.state.height(), 11);
}
