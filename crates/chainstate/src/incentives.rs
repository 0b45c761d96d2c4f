//! Block reward schedule and required-payee checks.

use divid_consensus::money::{Amount, COIN};
use divid_consensus::ConsensusParams;
use divid_primitives::transaction::Transaction;

use crate::blockindex::BlockIndexEntry;

const LOTTERY_REWARD_PER_BLOCK: Amount = 50 * COIN;

/// Expected reward of one block split by recipient.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RewardBreakdown {
    pub stake: Amount,
    pub masternode: Amount,
    pub treasury: Amount,
    pub charity: Amount,
    pub lottery: Amount,
    pub proposals: Amount,
}

impl RewardBreakdown {
    pub fn total(&self) -> Amount {
        self.stake + self.masternode + self.treasury + self.charity + self.lottery + self.proposals
    }
}

pub trait IncentivesPolicy: Send + Sync {
    fn expected_reward(&self, height: i32) -> RewardBreakdown;

    /// Whether `payment_tx` (the coinbase for PoW, the coinstake for PoS)
    /// pays every recipient required at `entry`'s height. `expected` is the
    /// breakdown after deployment adjustments.
    fn has_valid_payees(
        &self,
        payment_tx: &Transaction,
        entry: &BlockIndexEntry,
        expected: &RewardBreakdown,
    ) -> bool;

    fn is_block_value_valid(&self, expected: &RewardBreakdown, mint: Amount, _height: i32) -> bool {
        mint <= expected.total()
    }
}

/// Reward split of the legacy chain: a declining base subsidy, a fixed
/// lottery share once the lottery starts, and treasury and charity shares
/// accumulated into superblocks.
///
/// Payees are only checked for the recipients given scripts.
#[derive(Clone, Debug)]
pub struct LegacyIncentives {
    params: ConsensusParams,
    treasury_script: Option<Vec<u8>>,
    charity_script: Option<Vec<u8>>,
    lottery_winners: Vec<Vec<u8>>,
    masternode_script: Option<Vec<u8>>,
}

impl LegacyIncentives {
    pub fn new(params: ConsensusParams) -> Self {
        Self {
            params,
            treasury_script: None,
            charity_script: None,
            lottery_winners: Vec::new(),
            masternode_script: None,
        }
    }

    pub fn with_superblock_payees(mut self, treasury: Vec<u8>, charity: Vec<u8>) -> Self {
        self.treasury_script = Some(treasury);
        self.charity_script = Some(charity);
        self
    }

    /// Lottery blocks pay half the pot to the first winner and a tenth of
    /// that half to each of the others.
    pub fn with_lottery_winners(mut self, winners: Vec<Vec<u8>>) -> Self {
        self.lottery_winners = winners;
        self
    }

    /// Blocks that are neither treasury nor lottery blocks must pay the
    /// masternode share to `script`.
    pub fn with_masternode_payee(mut self, script: Vec<u8>) -> Self {
        self.masternode_script = Some(script);
        self
    }

    pub fn base_subsidy(&self, height: i32) -> Amount {
        match height {
            0 => 50 * COIN,
            1 => self.params.premine,
            _ => {
                let interval = self.params.subsidy_halving_interval.max(1);
                let steps = i64::from((height / interval - 1).max(0));
                (1_250 - 100 * steps).max(250) * COIN
            }
        }
    }

    fn per_block_split(&self, height: i32) -> RewardBreakdown {
        let subsidy = self.base_subsidy(height);
        if height <= self.params.last_pow_block {
            return RewardBreakdown {
                stake: subsidy,
                ..RewardBreakdown::default()
            };
        }
        let lottery = if height >= self.params.lottery_start_block {
            LOTTERY_REWARD_PER_BLOCK.min(subsidy)
        } else {
            0
        };
        let remaining = subsidy - lottery;
        let share = |percent: i64| remaining * percent / 100;
        RewardBreakdown {
            stake: share(38),
            masternode: share(45),
            treasury: share(16),
            charity: share(1),
            lottery,
            proposals: 0,
        }
    }
}

fn pays_at_least(tx: &Transaction, script: &[u8], amount: Amount) -> bool {
    tx.vout
        .iter()
        .any(|output| output.script_pubkey == script && output.value >= amount)
}

impl IncentivesPolicy for LegacyIncentives {
    fn expected_reward(&self, height: i32) -> RewardBreakdown {
        let mut reward = self.per_block_split(height);
        if self.params.is_treasury_block(height) {
            let cycle = Amount::from(self.params.treasury_cycle);
            reward.treasury *= cycle;
            reward.charity *= cycle;
        } else {
            reward.treasury = 0;
            reward.charity = 0;
        }
        if self.params.is_lottery_block(height) {
            reward.lottery *= Amount::from(self.params.lottery_cycle);
        } else {
            reward.lottery = 0;
        }
        reward
    }

    fn has_valid_payees(
        &self,
        payment_tx: &Transaction,
        entry: &BlockIndexEntry,
        expected: &RewardBreakdown,
    ) -> bool {
        if self.params.is_treasury_block(entry.height) {
            let treasury_paid = self
                .treasury_script
                .as_deref()
                .map_or(true, |script| pays_at_least(payment_tx, script, expected.treasury));
            let charity_paid = self
                .charity_script
                .as_deref()
                .map_or(true, |script| pays_at_least(payment_tx, script, expected.charity));
            return treasury_paid && charity_paid;
        }
        if self.params.is_lottery_block(entry.height) {
            let big = expected.lottery / 2;
            let small = big / 10;
            return self
                .lottery_winners
                .iter()
                .enumerate()
                .all(|(rank, script)| {
                    pays_at_least(payment_tx, script, if rank == 0 { big } else { small })
                });
        }
        match self.masternode_script.as_deref() {
            Some(script) if expected.masternode > 0 => {
                pays_at_least(payment_tx, script, expected.masternode)
            }
            _ => true,
        }
    }
}
