//! Arena of block-index entries keyed by hash, with the candidate-tip set.
//!
//! Entries are never removed. Parents, skip pointers, and every reference
//! held elsewhere in the crate are `EntryId`s into the arena.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};

use divid_consensus::constants::MEDIAN_TIME_SPAN;
use divid_consensus::money::Amount;
use divid_consensus::{hash256_to_hex, Hash256};
use divid_pow::block_proof;
use divid_primitives::block::BlockHeader;
use divid_primitives::encoding::{DecodeError, Decoder, Encoder};
use primitive_types::U256;
use smallvec::SmallVec;

use crate::chain::ActiveChain;
use crate::flatfiles::FileLocation;
use crate::state::ChainStateError;

pub type EntryId = usize;

pub const BLOCK_VALID_UNKNOWN: u32 = 0;
pub const BLOCK_VALID_HEADER: u32 = 1;
pub const BLOCK_VALID_TREE: u32 = 2;
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
pub const BLOCK_VALID_CHAIN: u32 = 4;
pub const BLOCK_VALID_SCRIPTS: u32 = 5;
pub const BLOCK_VALID_MASK: u32 = 7;
pub const BLOCK_HAVE_DATA: u32 = 8;
pub const BLOCK_HAVE_UNDO: u32 = 16;
pub const BLOCK_FAILED_VALID: u32 = 32;
pub const BLOCK_FAILED_CHILD: u32 = 64;
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

const DISK_INDEX_VERSION: u8 = 1;

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height the skip pointer of a block at `height` jumps to.
fn get_skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[derive(Clone, Debug, Default)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub prev: Option<EntryId>,
    pub skip: Option<EntryId>,
    pub height: i32,
    pub chain_work: U256,
    pub status: u32,
    pub tx_count: u32,
    /// Transactions from genesis through this block; 0 while an ancestor lacks data.
    pub chain_tx: u64,
    pub sequence_id: u32,
    pub data_pos: Option<FileLocation>,
    pub undo_pos: Option<FileLocation>,
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub is_proof_of_stake: bool,
    pub money_supply: Amount,
    pub mint: Amount,
}

impl BlockIndexEntry {
    /// False for failed entries regardless of level.
    pub fn is_valid(&self, level: u32) -> bool {
        if self.status & BLOCK_FAILED_MASK != 0 {
            return false;
        }
        self.status & BLOCK_VALID_MASK >= level
    }

    /// Raises the validity level. Returns whether anything changed.
    pub fn raise_validity(&mut self, level: u32) -> bool {
        if self.status & BLOCK_FAILED_MASK != 0 {
            return false;
        }
        if self.status & BLOCK_VALID_MASK < level {
            self.status = (self.status & !BLOCK_VALID_MASK) | level;
            return true;
        }
        false
    }

    pub fn is_failed(&self) -> bool {
        self.status & BLOCK_FAILED_MASK != 0
    }

    pub fn have_data(&self) -> bool {
        self.status & BLOCK_HAVE_DATA != 0
    }

    pub fn have_undo(&self) -> bool {
        self.status & BLOCK_HAVE_UNDO != 0
    }

    pub fn block_time(&self) -> i64 {
        i64::from(self.time)
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: self.prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn to_disk(&self) -> DiskBlockIndex {
        DiskBlockIndex {
            height: self.height,
            status: self.status,
            tx_count: self.tx_count,
            data_pos: self.data_pos,
            undo_pos: self.undo_pos,
            header: self.header(),
            is_proof_of_stake: self.is_proof_of_stake,
            money_supply: self.money_supply,
            mint: self.mint,
        }
    }
}

/// Persisted form of an entry. Work, skip pointers, and chain counts are rebuilt on load.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskBlockIndex {
    pub height: i32,
    pub status: u32,
    pub tx_count: u32,
    pub data_pos: Option<FileLocation>,
    pub undo_pos: Option<FileLocation>,
    pub header: BlockHeader,
    pub is_proof_of_stake: bool,
    pub money_supply: Amount,
    pub mint: Amount,
}

impl DiskBlockIndex {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(160);
        encoder.write_u8(DISK_INDEX_VERSION);
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.status);
        encoder.write_u32_le(self.tx_count);
        for location in [self.data_pos, self.undo_pos] {
            match location {
                Some(location) => {
                    encoder.write_bool(true);
                    encoder.write_bytes(&location.encode());
                }
                None => encoder.write_bool(false),
            }
        }
        encoder.write_i32_le(self.header.version);
        encoder.write_hash_le(&self.header.prev_block);
        encoder.write_hash_le(&self.header.merkle_root);
        encoder.write_u32_le(self.header.time);
        encoder.write_u32_le(self.header.bits);
        encoder.write_u32_le(self.header.nonce);
        encoder.write_bool(self.is_proof_of_stake);
        encoder.write_i64_le(self.money_supply);
        encoder.write_i64_le(self.mint);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != DISK_INDEX_VERSION {
            return Err(DecodeError::InvalidData("unsupported block index version"));
        }
        let height = decoder.read_i32_le()?;
        let status = decoder.read_u32_le()?;
        let tx_count = decoder.read_u32_le()?;
        let mut locations = [None, None];
        for slot in &mut locations {
            if decoder.read_bool()? {
                let raw = decoder.read_fixed::<{ FileLocation::ENCODED_LEN }>()?;
                *slot = Some(
                    FileLocation::decode(&raw)
                        .ok_or(DecodeError::InvalidData("invalid file location"))?,
                );
            }
        }
        let header = BlockHeader {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        };
        let is_proof_of_stake = decoder.read_bool()?;
        let money_supply = decoder.read_i64_le()?;
        let mint = decoder.read_i64_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        let [data_pos, undo_pos] = locations;
        Ok(Self {
            height,
            status,
            tx_count,
            data_pos,
            undo_pos,
            header,
            is_proof_of_stake,
            money_supply,
            mint,
        })
    }
}

/// Sort key of the candidate set; the greatest key is the best tip.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct CandidateKey {
    chain_work: U256,
    sequence_id: u32,
    id: EntryId,
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.chain_work
            .cmp(&other.chain_work)
            .then_with(|| other.sequence_id.cmp(&self.sequence_id))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct BlockIndexGraph {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, EntryId>,
    candidates: BTreeSet<CandidateKey>,
    /// parent -> children that have data while the parent's chain does not.
    unlinked: HashMap<EntryId, SmallVec<[EntryId; 2]>>,
    next_sequence_id: u32,
    best_header: Option<EntryId>,
    best_invalid: Option<EntryId>,
    dirty: BTreeSet<EntryId>,
}

impl BlockIndexGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the graph from persisted entries in any order.
    pub fn from_disk(mut records: Vec<(Hash256, DiskBlockIndex)>) -> Result<Self, ChainStateError> {
        records.sort_by(|a, b| a.1.height.cmp(&b.1.height).then_with(|| a.0.cmp(&b.0)));
        let mut graph = Self::new();
        for (hash, disk) in records {
            let parent = if disk.height == 0 {
                None
            } else {
                let parent = graph.lookup(&disk.header.prev_block).ok_or_else(|| {
                    ChainStateError::Corruption(format!(
                        "block index entry {} has no parent",
                        hash256_to_hex(&hash)
                    ))
                })?;
                if graph.entries[parent].height + 1 != disk.height {
                    return Err(ChainStateError::Corruption(format!(
                        "block index entry {} has inconsistent height",
                        hash256_to_hex(&hash)
                    )));
                }
                Some(parent)
            };
            let id = graph.push_entry(hash, &disk.header, parent);
            let entry = &mut graph.entries[id];
            entry.status = disk.status;
            entry.tx_count = disk.tx_count;
            entry.data_pos = disk.data_pos;
            entry.undo_pos = disk.undo_pos;
            entry.is_proof_of_stake = disk.is_proof_of_stake;
            entry.money_supply = disk.money_supply;
            entry.mint = disk.mint;

            if graph.entries[id].have_data() {
                match parent {
                    Some(parent) if graph.entries[parent].chain_tx == 0 => {
                        graph.link_unlinked(parent, id);
                    }
                    _ => {
                        let base = parent.map_or(0, |parent| graph.entries[parent].chain_tx);
                        graph.entries[id].chain_tx = base + u64::from(disk.tx_count);
                        graph.entries[id].sequence_id = graph.take_sequence_id();
                    }
                }
            }
            graph.add_candidate(id);
            if graph.entries[id].is_failed() {
                graph.note_invalid(id);
            }
            graph.note_header(id);
        }
        graph.dirty.clear();
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Panics on ids that did not come from this graph.
    pub fn get(&self, id: EntryId) -> &BlockIndexEntry {
        &self.entries[id]
    }

    /// Mutable access; the entry is queued for the next index write.
    pub fn get_mut(&mut self, id: EntryId) -> &mut BlockIndexEntry {
        self.dirty.insert(id);
        &mut self.entries[id]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<EntryId> {
        self.by_hash.get(hash).copied()
    }

    pub fn hash(&self, id: EntryId) -> Hash256 {
        self.entries[id].hash
    }

    pub fn ids(&self) -> impl Iterator<Item = EntryId> {
        0..self.entries.len()
    }

    pub fn best_header(&self) -> Option<EntryId> {
        self.best_header
    }

    pub fn best_invalid(&self) -> Option<EntryId> {
        self.best_invalid
    }

    /// Finds or creates the entry for `header`. Fails with `OrphanHeader` when
    /// the parent is unknown; a zero `prev_block` makes a root.
    pub fn insert_header(&mut self, header: &BlockHeader) -> Result<EntryId, ChainStateError> {
        let hash = header.hash();
        if let Some(id) = self.lookup(&hash) {
            return Ok(id);
        }
        let parent = if header.prev_block == [0u8; 32] {
            None
        } else {
            Some(
                self.lookup(&header.prev_block)
                    .ok_or(ChainStateError::OrphanHeader(header.prev_block))?,
            )
        };
        let id = self.push_entry(hash, header, parent);
        self.entries[id].raise_validity(BLOCK_VALID_TREE);
        self.note_header(id);
        Ok(id)
    }

    fn push_entry(&mut self, hash: Hash256, header: &BlockHeader, parent: Option<EntryId>) -> EntryId {
        let (height, parent_work) = match parent {
            Some(parent) => (self.entries[parent].height + 1, self.entries[parent].chain_work),
            None => (0, U256::zero()),
        };
        let skip = parent.and_then(|parent| self.ancestor(parent, get_skip_height(height)));
        let id = self.entries.len();
        self.entries.push(BlockIndexEntry {
            hash,
            prev: parent,
            skip,
            height,
            chain_work: parent_work.saturating_add(block_proof(header.bits)),
            status: BLOCK_VALID_UNKNOWN,
            tx_count: 0,
            chain_tx: 0,
            sequence_id: 0,
            data_pos: None,
            undo_pos: None,
            version: header.version,
            prev_hash: header.prev_block,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            is_proof_of_stake: false,
            money_supply: 0,
            mint: 0,
        });
        self.by_hash.insert(hash, id);
        self.dirty.insert(id);
        id
    }

    fn note_header(&mut self, id: EntryId) {
        if !self.entries[id].is_valid(BLOCK_VALID_TREE) {
            return;
        }
        let better = match self.best_header {
            Some(best) => self.entries[id].chain_work > self.entries[best].chain_work,
            None => true,
        };
        if better {
            self.best_header = Some(id);
        }
    }

    /// Records `id` as the best invalid chain if it has more work than the current one.
    pub fn note_invalid(&mut self, id: EntryId) -> bool {
        let better = match self.best_invalid {
            Some(best) => self.entries[id].chain_work > self.entries[best].chain_work,
            None => true,
        };
        if better {
            self.best_invalid = Some(id);
        }
        better
    }

    fn take_sequence_id(&mut self) -> u32 {
        let id = self.next_sequence_id;
        self.next_sequence_id = self.next_sequence_id.wrapping_add(1);
        id
    }

    fn link_unlinked(&mut self, parent: EntryId, child: EntryId) {
        let children = self.unlinked.entry(parent).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    pub fn is_unlinked(&self, parent: EntryId, child: EntryId) -> bool {
        self.unlinked
            .get(&parent)
            .is_some_and(|children| children.contains(&child))
    }

    /// Ancestor of `id` at `height`, following skip pointers where they help.
    pub fn ancestor(&self, id: EntryId, height: i32) -> Option<EntryId> {
        let start = &self.entries[id];
        if height > start.height || height < 0 {
            return None;
        }
        let mut walk = id;
        let mut height_walk = start.height;
        while height_walk > height {
            let entry = &self.entries[walk];
            let height_skip = get_skip_height(height_walk);
            let height_skip_prev = get_skip_height(height_walk - 1);
            match entry.skip {
                Some(skip)
                    if height_skip == height
                        || (height_skip > height
                            && !(height_skip_prev < height_skip - 2
                                && height_skip_prev >= height)) =>
                {
                    walk = skip;
                    height_walk = height_skip;
                }
                _ => {
                    walk = entry.prev?;
                    height_walk -= 1;
                }
            }
        }
        Some(walk)
    }

    /// Deepest entry that is an ancestor of both. `None` when they share no root.
    pub fn last_common_ancestor(&self, a: EntryId, b: EntryId) -> Option<EntryId> {
        let height = self.entries[a].height.min(self.entries[b].height);
        let mut a = self.ancestor(a, height)?;
        let mut b = self.ancestor(b, height)?;
        while a != b {
            a = self.entries[a].prev?;
            b = self.entries[b].prev?;
        }
        Some(a)
    }

    pub fn is_ancestor(&self, ancestor: EntryId, descendant: EntryId) -> bool {
        self.ancestor(descendant, self.entries[ancestor].height) == Some(ancestor)
    }

    pub fn median_time_past(&self, id: EntryId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(self.entries[current].block_time());
            cursor = self.entries[current].prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Marks block data present and chains transaction counts into any
    /// descendants that were waiting on it.
    pub fn received_block_transactions(
        &mut self,
        id: EntryId,
        tx_count: u32,
        location: FileLocation,
        is_proof_of_stake: bool,
        active_tip: Option<EntryId>,
    ) {
        {
            let entry = self.get_mut(id);
            entry.tx_count = tx_count;
            entry.chain_tx = 0;
            entry.data_pos = Some(location);
            entry.status |= BLOCK_HAVE_DATA;
            entry.is_proof_of_stake = is_proof_of_stake;
            entry.raise_validity(BLOCK_VALID_TRANSACTIONS);
        }

        let parent = self.entries[id].prev;
        let parent_linked = parent.map_or(true, |parent| self.entries[parent].chain_tx != 0);
        if !parent_linked {
            if let Some(parent) = parent {
                if self.entries[parent].is_valid(BLOCK_VALID_TREE) {
                    self.link_unlinked(parent, id);
                }
            }
            return;
        }

        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let base = self.entries[current]
                .prev
                .map_or(0, |parent| self.entries[parent].chain_tx);
            let sequence_id = self.take_sequence_id();
            {
                let entry = self.get_mut(current);
                entry.chain_tx = base + u64::from(entry.tx_count);
                entry.sequence_id = sequence_id;
            }
            let qualifies = match active_tip {
                Some(tip) => self.candidate_key(current) >= self.candidate_key(tip),
                None => true,
            };
            if qualifies {
                self.add_candidate(current);
            }
            if let Some(children) = self.unlinked.remove(&current) {
                queue.extend(children);
            }
        }
    }

    fn candidate_key(&self, id: EntryId) -> CandidateKey {
        let entry = &self.entries[id];
        CandidateKey {
            chain_work: entry.chain_work,
            sequence_id: entry.sequence_id,
            id,
        }
    }

    /// Inserts `id` when it is transaction-valid and chained back to a root.
    pub fn add_candidate(&mut self, id: EntryId) -> bool {
        let entry = &self.entries[id];
        if !entry.is_valid(BLOCK_VALID_TRANSACTIONS) || entry.chain_tx == 0 {
            return false;
        }
        self.candidates.insert(self.candidate_key(id))
    }

    pub fn remove_candidate(&mut self, id: EntryId) -> bool {
        self.candidates.remove(&self.candidate_key(id))
    }

    pub fn is_candidate(&self, id: EntryId) -> bool {
        self.candidates.contains(&self.candidate_key(id))
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Candidates from best to worst.
    pub fn candidates(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.candidates.iter().rev().map(|key| key.id)
    }

    pub fn best_candidate(&self) -> Option<EntryId> {
        self.candidates.last().map(|key| key.id)
    }

    /// Drops every candidate worse than `tip`; the tip itself stays.
    pub fn prune_candidates(&mut self, tip: EntryId) {
        let key = self.candidate_key(tip);
        self.candidates = self.candidates.split_off(&key);
    }

    /// Best candidate whose path back to `chain` is free of failures and
    /// missing data. Candidates that fail the walk are dropped along the way.
    pub fn find_most_work_chain(&mut self, chain: &ActiveChain) -> Option<EntryId> {
        'search: loop {
            let best = self.best_candidate()?;
            let mut test = Some(best);
            while let Some(current) = test {
                if chain.contains(self, current) {
                    break;
                }
                let failed = self.entries[current].is_failed();
                let missing_data = !self.entries[current].have_data();
                if failed || missing_data {
                    if failed {
                        self.note_invalid(best);
                    }
                    let mut walk = best;
                    while walk != current {
                        if failed {
                            self.get_mut(walk).status |= BLOCK_FAILED_CHILD;
                        } else if let Some(parent) = self.entries[walk].prev {
                            self.link_unlinked(parent, walk);
                        }
                        self.remove_candidate(walk);
                        match self.entries[walk].prev {
                            Some(parent) => walk = parent,
                            None => break,
                        }
                    }
                    self.remove_candidate(current);
                    continue 'search;
                }
                test = self.entries[current].prev;
            }
            return Some(best);
        }
    }

    /// Flags `id` as failed, flags its active-chain and candidate descendants
    /// as failed children, and drops all of them from the candidate set.
    pub fn mark_invalid(&mut self, id: EntryId, chain: &ActiveChain) {
        self.get_mut(id).status |= BLOCK_FAILED_VALID;
        self.remove_candidate(id);
        self.note_invalid(id);

        let height = self.entries[id].height;
        let mut descendants = Vec::new();
        if chain.contains(self, id) {
            descendants.extend(((height + 1)..=chain.height()).filter_map(|h| chain.at_height(h)));
        }
        descendants.extend(
            self.candidates
                .iter()
                .map(|key| key.id)
                .filter(|&candidate| candidate != id && self.ancestor(candidate, height) == Some(id)),
        );
        for descendant in descendants {
            self.get_mut(descendant).status |= BLOCK_FAILED_CHILD;
            self.remove_candidate(descendant);
        }
    }

    /// Clears failure flags on `id`, its descendants, and its ancestors, and
    /// re-admits descendants that are at least as good as `active_tip`.
    pub fn reconsider(&mut self, id: EntryId, active_tip: Option<EntryId>) {
        let height = self.entries[id].height;
        for other in 0..self.entries.len() {
            if !self.entries[other].is_failed() || self.ancestor(other, height) != Some(id) {
                continue;
            }
            self.get_mut(other).status &= !BLOCK_FAILED_MASK;
            let qualifies = match active_tip {
                Some(tip) => self.candidate_key(other) >= self.candidate_key(tip),
                None => true,
            };
            if qualifies {
                self.add_candidate(other);
            }
            if self.best_invalid == Some(other) {
                self.best_invalid = None;
            }
        }

        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if self.entries[current].is_failed() {
                self.get_mut(current).status &= !BLOCK_FAILED_MASK;
            }
            cursor = self.entries[current].prev;
        }
    }

    pub fn mark_dirty(&mut self, id: EntryId) {
        self.dirty.insert(id);
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Drains the entries modified since the last call.
    pub fn take_dirty(&mut self) -> Vec<EntryId> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }
}
