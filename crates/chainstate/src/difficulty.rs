use divid_consensus::ConsensusParams;
use divid_pow::{get_next_work_required, HeaderInfo};

use crate::blockindex::{BlockIndexGraph, EntryId};
use crate::state::ChainStateError;

/// Blocks of history the retarget window can look at.
const RETARGET_WINDOW: usize = 25;

pub trait DifficultyAdjuster: Send + Sync {
    /// Compact target the child of `prev` must carry; `None` is the genesis case.
    fn next_work_required(
        &self,
        graph: &BlockIndexGraph,
        prev: Option<EntryId>,
    ) -> Result<u32, ChainStateError>;
}

/// DarkGravityWave for proof of work, exponential smoothing for proof of stake.
pub struct ChainRetarget {
    params: ConsensusParams,
}

impl ChainRetarget {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }
}

impl DifficultyAdjuster for ChainRetarget {
    fn next_work_required(
        &self,
        graph: &BlockIndexGraph,
        prev: Option<EntryId>,
    ) -> Result<u32, ChainStateError> {
        let mut window = Vec::with_capacity(RETARGET_WINDOW);
        let mut cursor = prev;
        while let Some(id) = cursor {
            if window.len() == RETARGET_WINDOW {
                break;
            }
            let entry = graph.get(id);
            window.push(HeaderInfo {
                height: i64::from(entry.height),
                time: entry.block_time(),
                bits: entry.bits,
            });
            cursor = entry.prev;
        }
        window.reverse();
        get_next_work_required(&window, &self.params)
            .map_err(|err| ChainStateError::Corruption(format!("retarget failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use divid_consensus::{consensus_params, Network};
    use divid_primitives::block::BlockHeader;

    #[test]
    fn regtest_keeps_limit_bits() {
        let params = consensus_params(Network::Regtest);
        let retarget = ChainRetarget::new(params);
        let mut graph = BlockIndexGraph::new();
        assert_eq!(retarget.next_work_required(&graph, None).expect("bits"), 0x207f_ffff);

        let mut prev = [0u8; 32];
        let mut last = None;
        for n in 0..30u32 {
            let header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: 1_000 + n * 60,
                bits: 0x207f_ffff,
                nonce: n,
            };
            let id = graph.insert_header(&header).expect("insert");
            prev = graph.hash(id);
            last = Some(id);
        }
        assert_eq!(retarget.next_work_required(&graph, last).expect("bits"), 0x207f_ffff);
    }
}
