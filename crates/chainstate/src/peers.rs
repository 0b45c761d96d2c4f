//! Misbehaviour reports against the peers that supplied bad data.

use std::collections::HashMap;
use std::sync::Mutex;

use divid_consensus::constants::MAX_DOS_SCORE;

pub type PeerId = u64;

pub trait PeerMisbehaviorSink: Send + Sync {
    fn report(&self, peer: PeerId, penalty: u32, reason: &str);
}

/// Accumulates scores per peer; the network layer polls `should_disconnect`.
#[derive(Default)]
pub struct MisbehaviorScores {
    scores: Mutex<HashMap<PeerId, u32>>,
}

impl MisbehaviorScores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self, peer: PeerId) -> u32 {
        let scores = self.scores.lock().expect("misbehavior lock");
        scores.get(&peer).copied().unwrap_or(0)
    }

    pub fn should_disconnect(&self, peer: PeerId) -> bool {
        self.score(peer) >= MAX_DOS_SCORE
    }

    pub fn forget(&self, peer: PeerId) {
        let mut scores = self.scores.lock().expect("misbehavior lock");
        scores.remove(&peer);
    }
}

impl PeerMisbehaviorSink for MisbehaviorScores {
    fn report(&self, peer: PeerId, penalty: u32, reason: &str) {
        let mut scores = self.scores.lock().expect("misbehavior lock");
        let score = scores.entry(peer).or_insert(0);
        *score = score.saturating_add(penalty);
        divid_log::log_warn!("peer {peer} misbehaving (+{penalty} = {}): {reason}", *score);
    }
}
