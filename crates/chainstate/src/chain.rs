//! The active chain as a height-indexed vector of entry ids.

use divid_consensus::Hash256;

use crate::blockindex::{BlockIndexGraph, EntryId};

#[derive(Clone, Debug, Default)]
pub struct ActiveChain {
    ids: Vec<EntryId>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<EntryId> {
        self.ids.last().copied()
    }

    pub fn genesis(&self) -> Option<EntryId> {
        self.ids.first().copied()
    }

    /// Height of the tip, or -1 for an empty chain.
    pub fn height(&self) -> i32 {
        self.ids.len() as i32 - 1
    }

    pub fn at_height(&self, height: i32) -> Option<EntryId> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.ids.get(height).copied())
    }

    pub fn contains(&self, graph: &BlockIndexGraph, id: EntryId) -> bool {
        self.at_height(graph.get(id).height) == Some(id)
    }

    pub fn next(&self, graph: &BlockIndexGraph, id: EntryId) -> Option<EntryId> {
        if self.contains(graph, id) {
            self.at_height(graph.get(id).height + 1)
        } else {
            None
        }
    }

    /// Makes `tip` the active tip, rewriting only the heights that changed.
    pub fn set_tip(&mut self, graph: &BlockIndexGraph, tip: Option<EntryId>) {
        let Some(tip) = tip else {
            self.ids.clear();
            return;
        };
        let new_len = graph.get(tip).height as usize + 1;
        self.ids.truncate(new_len);
        let kept = self.ids.len();
        self.ids.resize(new_len, tip);
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            let height = graph.get(id).height as usize;
            if height < kept && self.ids[height] == id {
                break;
            }
            self.ids[height] = id;
            cursor = graph.get(id).prev;
        }
    }

    /// Last entry shared between the active chain and the branch ending at `id`.
    pub fn find_fork(&self, graph: &BlockIndexGraph, id: EntryId) -> Option<EntryId> {
        let mut cursor = if graph.get(id).height > self.height() {
            graph.ancestor(id, self.height())
        } else {
            Some(id)
        };
        while let Some(current) = cursor {
            if self.contains(graph, current) {
                return Some(current);
            }
            cursor = graph.get(current).prev;
        }
        None
    }

    /// Exponentially spaced hashes walking back from `from` (or the tip).
    pub fn locator(&self, graph: &BlockIndexGraph, from: Option<EntryId>) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1i32;
        let mut cursor = from.or_else(|| self.tip());
        while let Some(id) = cursor {
            hashes.push(graph.hash(id));
            let height = graph.get(id).height;
            if height == 0 {
                break;
            }
            let target = (height - step).max(0);
            cursor = if self.contains(graph, id) {
                self.at_height(target)
            } else {
                graph.ancestor(id, target)
            };
            if hashes.len() > 10 {
                step *= 2;
            }
        }
        hashes
    }

    pub fn iter(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.ids.iter().copied()
    }
}
