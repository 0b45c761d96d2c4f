//! BIP9 threshold state machine.
//!
//! State is a function of the block whose child is being evaluated. Each
//! period's state is decided at the last block of the previous period,
//! i.e. at entries with `(height + 1) % period == 0`, using that entry's
//! median time past and the version bits of the `period` blocks ending at it.

use std::collections::HashMap;
use std::sync::Mutex;

use divid_consensus::deployments::{
    Bip9Deployment, ThresholdState, ALWAYS_ACTIVE, VERSIONBITS_NUM_BITS, VERSIONBITS_TOP_BITS,
};

use crate::blockindex::{BlockIndexGraph, EntryId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeploymentStatus {
    Unknown,
    InProgress,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VersionBitsError {
    BitOutOfRange(u8),
    BitInUse(u8),
    DuplicateName(String),
}

impl std::fmt::Display for VersionBitsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionBitsError::BitOutOfRange(bit) => write!(f, "version bit {bit} out of range"),
            VersionBitsError::BitInUse(bit) => write!(f, "version bit {bit} already assigned"),
            VersionBitsError::DuplicateName(name) => write!(f, "deployment {name} already known"),
        }
    }
}

impl std::error::Error for VersionBitsError {}

/// Blocks signalling within the period that contains the child of `prev`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SignallingStats {
    pub period: u32,
    pub threshold: u32,
    pub elapsed: u32,
    pub count: u32,
    pub possible: bool,
}

/// Known deployments and their memoised boundary states.
#[derive(Default)]
pub struct VersionBitsManager {
    deployments: Vec<Bip9Deployment>,
    bits_in_use: u32,
    cache: Mutex<HashMap<(usize, EntryId), ThresholdState>>,
}

impl VersionBitsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager holding every deployment that can be registered; invalid ones are logged and skipped.
    pub fn from_deployments(deployments: &[Bip9Deployment]) -> Self {
        let mut manager = Self::new();
        for deployment in deployments {
            if let Err(err) = manager.add_deployment(deployment.clone()) {
                divid_log::log_warn!("ignoring deployment {}: {err}", deployment.name);
            }
        }
        manager
    }

    pub fn add_deployment(&mut self, deployment: Bip9Deployment) -> Result<(), VersionBitsError> {
        if deployment.bit >= VERSIONBITS_NUM_BITS {
            return Err(VersionBitsError::BitOutOfRange(deployment.bit));
        }
        if self.bits_in_use & deployment.mask() != 0 {
            return Err(VersionBitsError::BitInUse(deployment.bit));
        }
        if self.position(&deployment.name).is_some() {
            return Err(VersionBitsError::DuplicateName(deployment.name));
        }
        self.bits_in_use |= deployment.mask();
        self.deployments.push(deployment);
        Ok(())
    }

    pub fn deployments(&self) -> &[Bip9Deployment] {
        &self.deployments
    }

    pub fn status(&self, name: &str) -> DeploymentStatus {
        match self.position(name) {
            Some(_) => DeploymentStatus::InProgress,
            None => DeploymentStatus::Unknown,
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.deployments
            .iter()
            .position(|deployment| deployment.name == name)
    }

    /// State of `name` for the child of `prev`; `None` for unknown deployments.
    pub fn state_for(
        &self,
        name: &str,
        graph: &BlockIndexGraph,
        prev: Option<EntryId>,
    ) -> Option<ThresholdState> {
        let index = self.position(name)?;
        Some(self.state_at(index, graph, prev))
    }

    pub fn is_active(&self, name: &str, graph: &BlockIndexGraph, prev: Option<EntryId>) -> bool {
        self.state_for(name, graph, prev) == Some(ThresholdState::Active)
    }

    /// Version for a block built on `prev`: the marker plus every bit still
    /// being voted on.
    pub fn block_version(&self, graph: &BlockIndexGraph, prev: Option<EntryId>) -> i32 {
        let mut version = VERSIONBITS_TOP_BITS as u32;
        for (index, deployment) in self.deployments.iter().enumerate() {
            if matches!(
                self.state_at(index, graph, prev),
                ThresholdState::Started | ThresholdState::LockedIn
            ) {
                version |= deployment.mask();
            }
        }
        version as i32
    }

    pub fn signalling_stats(
        &self,
        name: &str,
        graph: &BlockIndexGraph,
        prev: Option<EntryId>,
    ) -> Option<SignallingStats> {
        let deployment = &self.deployments[self.position(name)?];
        let period = deployment.period.max(1);
        let mut stats = SignallingStats {
            period,
            threshold: deployment.threshold,
            ..SignallingStats::default()
        };
        let Some(prev) = prev else {
            stats.possible = deployment.threshold <= period;
            return Some(stats);
        };
        let height = graph.get(prev).height;
        stats.elapsed = ((height + 1) as u32) % period;
        let mut cursor = Some(prev);
        for _ in 0..stats.elapsed {
            let Some(id) = cursor else {
                break;
            };
            let entry = graph.get(id);
            if deployment.signals(entry.version) {
                stats.count += 1;
            }
            cursor = entry.prev;
        }
        stats.possible = period.saturating_sub(stats.threshold) >= stats.elapsed - stats.count;
        Some(stats)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().expect("versionbits cache lock").clear();
    }

    fn state_at(&self, index: usize, graph: &BlockIndexGraph, prev: Option<EntryId>) -> ThresholdState {
        let deployment = &self.deployments[index];
        if deployment.start_time == ALWAYS_ACTIVE {
            return ThresholdState::Active;
        }
        if !deployment.is_viable() {
            return ThresholdState::Failed;
        }
        let period = deployment.period as i32;

        let mut cache = self.cache.lock().expect("versionbits cache lock");
        let mut cursor = prev.and_then(|id| {
            let height = graph.get(id).height;
            graph.ancestor(id, height - (height + 1) % period)
        });

        let mut pending = Vec::new();
        let mut state = ThresholdState::Defined;
        while let Some(id) = cursor {
            if let Some(cached) = cache.get(&(index, id)) {
                state = *cached;
                break;
            }
            if graph.median_time_past(id) < deployment.start_time {
                cache.insert((index, id), ThresholdState::Defined);
                break;
            }
            pending.push(id);
            cursor = graph.ancestor(id, graph.get(id).height - period);
        }

        while let Some(id) = pending.pop() {
            let median_time = graph.median_time_past(id);
            state = match state {
                ThresholdState::Defined if median_time >= deployment.timeout => ThresholdState::Failed,
                ThresholdState::Defined if median_time >= deployment.start_time => {
                    ThresholdState::Started
                }
                ThresholdState::Started if median_time >= deployment.timeout => ThresholdState::Failed,
                ThresholdState::Started => {
                    if count_signals(graph, deployment, id) >= deployment.threshold {
                        ThresholdState::LockedIn
                    } else {
                        ThresholdState::Started
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                other => other,
            };
            cache.insert((index, id), state);
        }
        state
    }
}

fn count_signals(graph: &BlockIndexGraph, deployment: &Bip9Deployment, last: EntryId) -> u32 {
    let mut count = 0;
    let mut cursor = Some(last);
    for _ in 0..deployment.period {
        let Some(id) = cursor else {
            break;
        };
        let entry = graph.get(id);
        if deployment.signals(entry.version) {
            count += 1;
        }
        cursor = entry.prev;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use divid_consensus::deployments::NO_TIMEOUT;
    use divid_primitives::block::BlockHeader;

    fn chain(graph: &mut BlockIndexGraph, versions: impl Fn(u32) -> i32, len: u32) -> Vec<EntryId> {
        let mut prev = [0u8; 32];
        (0..len)
            .map(|n| {
                let header = BlockHeader {
                    version: versions(n),
                    prev_block: prev,
                    merkle_root: [0u8; 32],
                    time: 1_000 + n * 60,
                    bits: 0x207f_ffff,
                    nonce: n,
                };
                let id = graph.insert_header(&header).expect("insert");
                prev = graph.hash(id);
                id
            })
            .collect()
    }

    #[test]
    fn add_deployment_rejects_bad_bits() {
        let mut manager = VersionBitsManager::new();
        manager
            .add_deployment(Bip9Deployment::new("a", 3, 0, NO_TIMEOUT, 10, 8))
            .expect("add");
        assert_eq!(
            manager.add_deployment(Bip9Deployment::new("b", 3, 0, NO_TIMEOUT, 10, 8)),
            Err(VersionBitsError::BitInUse(3))
        );
        assert_eq!(
            manager.add_deployment(Bip9Deployment::new("c", 29, 0, NO_TIMEOUT, 10, 8)),
            Err(VersionBitsError::BitOutOfRange(29))
        );
        assert_eq!(manager.status("a"), DeploymentStatus::InProgress);
        assert_eq!(manager.status("zzz"), DeploymentStatus::Unknown);
    }

    #[test]
    fn always_active_and_unviable_short_circuit() {
        let mut manager = VersionBitsManager::new();
        manager
            .add_deployment(Bip9Deployment::new("on", 1, ALWAYS_ACTIVE, NO_TIMEOUT, 10, 8))
            .expect("add");
        manager
            .add_deployment(Bip9Deployment::new("bad", 2, 0, NO_TIMEOUT, 5, 8))
            .expect("add");
        let graph = BlockIndexGraph::new();
        assert!(manager.is_active("on", &graph, None));
        assert_eq!(manager.state_for("bad", &graph, None), Some(ThresholdState::Failed));
    }

    #[test]
    fn timeout_fails_started_deployment() {
        let mut graph = BlockIndexGraph::new();
        let ids = chain(&mut graph, |_| 4, 40);
        let mut manager = VersionBitsManager::new();
        // median time of block 19 is 1000 + 14 * 60
        manager
            .add_deployment(Bip9Deployment::new("late", 5, 0, 1_000 + 14 * 60, 10, 8))
            .expect("add");
        assert_eq!(manager.state_for("late", &graph, Some(ids[9])), Some(ThresholdState::Started));
        assert_eq!(manager.state_for("late", &graph, Some(ids[19])), Some(ThresholdState::Failed));
        assert_eq!(manager.state_for("late", &graph, Some(ids[39])), Some(ThresholdState::Failed));
    }

    #[test]
    fn cached_and_uncached_queries_agree() {
        let mut graph = BlockIndexGraph::new();
        let signalling = VERSIONBITS_TOP_BITS | (1 << 4);
        let ids = chain(&mut graph, |n| if n % 10 < 8 { signalling } else { 4 }, 60);
        let deployment = Bip9Deployment::new("dep", 4, 0, NO_TIMEOUT, 10, 8);

        let mut forward = VersionBitsManager::new();
        forward.add_deployment(deployment.clone()).expect("add");
        let forward_states: Vec<_> = ids
            .iter()
            .map(|&id| forward.state_for("dep", &graph, Some(id)))
            .collect();

        let mut backward = VersionBitsManager::new();
        backward.add_deployment(deployment).expect("add");
        let mut backward_states: Vec<_> = ids
            .iter()
            .rev()
            .map(|&id| backward.state_for("dep", &graph, Some(id)))
            .collect();
        backward_states.reverse();
        assert_eq!(forward_states, backward_states);
        assert_eq!(forward_states[9], Some(ThresholdState::Started));
        assert_eq!(forward_states[19], Some(ThresholdState::LockedIn));
        assert_eq!(forward_states[29], Some(ThresholdState::Active));

        forward.clear_cache();
        assert_eq!(forward.state_for("dep", &graph, Some(ids[59])), Some(ThresholdState::Active));
    }

    #[test]
    fn block_version_and_stats() {
        let mut graph = BlockIndexGraph::new();
        let signalling = VERSIONBITS_TOP_BITS | (1 << 6);
        let ids = chain(&mut graph, |n| if n >= 10 && n < 13 { signalling } else { 4 }, 14);
        let mut manager = VersionBitsManager::new();
        manager
            .add_deployment(Bip9Deployment::new("six", 6, 0, NO_TIMEOUT, 10, 8))
            .expect("add");
        assert_eq!(
            manager.block_version(&graph, Some(ids[13])),
            VERSIONBITS_TOP_BITS | (1 << 6)
        );
        let stats = manager
            .signalling_stats("six", &graph, Some(ids[13]))
            .expect("stats");
        assert_eq!((stats.elapsed, stats.count), (4, 3));
        assert!(stats.possible);
    }
    #[test]
    fn period_of_1000_locks_in_at_900_signals() {
        let signalling = VERSIONBITS_TOP_BITS | (1 << 0);
        let deployment = Bip9Deployment::new("csv", 0, 0, NO_TIMEOUT, 1000, 900);

        let mut graph = BlockIndexGraph::new();
        let ids = chain(
            &mut graph,
            |n| if (1000..1900).contains(&n) { signalling } else { 4 },
            3000,
        );
        let mut manager = VersionBitsManager::new();
        manager.add_deployment(deployment.clone()).expect("add");
        assert_eq!(manager.state_for("csv", &graph, Some(ids[998])), Some(ThresholdState::Defined));
        assert_eq!(manager.state_for("csv", &graph, Some(ids[999])), Some(ThresholdState::Started));
        assert_eq!(manager.state_for("csv", &graph, Some(ids[1999])), Some(ThresholdState::LockedIn));
        assert_eq!(manager.state_for("csv", &graph, Some(ids[2999])), Some(ThresholdState::Active));

        let mut short = BlockIndexGraph::new();
        let ids = chain(
            &mut short,
            |n| if (1000..1898).contains(&n) { signalling } else { 4 },
            2000,
        );
        let mut manager = VersionBitsManager::new();
        manager.add_deployment(deployment).expect("add");
        assert_eq!(manager.state_for("csv", &short, Some(ids[1999])), Some(ThresholdState::Started));
        let stats = manager
            .signalling_stats("csv", &short, Some(ids[1998]))
            .expect("stats");
        assert_eq!((stats.elapsed, stats.count), (999, 898));
        assert!(!stats.possible);
    }
}
