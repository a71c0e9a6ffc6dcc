//! Block index arena and the active chain
//!
//! Every known header gets one [`BlockIndexEntry`] stored in a contiguous
//! arena and addressed by a [`BlockId`]. Parent and skip links are ids, so
//! the tree never holds owning pointers. The active chain is a height-indexed
//! vector of ids from genesis to tip.

use crate::constants::MEDIAN_TIME_SPAN;
use crate::pow::block_proof;
use crate::types::*;
use primitive_types::U256;
use std::collections::{BTreeMap, HashMap};

/// Stable handle of a block index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Validity and storage status bits
pub mod status {
    pub const VALID_UNKNOWN: u32 = 0;
    /// Parsed, version ok, hash satisfies claimed PoW, timestamp not in future
    pub const VALID_HEADER: u32 = 1;
    /// All parent headers found, difficulty matches, timestamp >= MTP
    pub const VALID_TREE: u32 = 2;
    /// Block body passed context-free and contextual checks
    pub const VALID_TRANSACTIONS: u32 = 3;
    /// Outputs do not overspend inputs, no double spends, coinbase amount ok
    pub const VALID_CHAIN: u32 = 4;
    /// Scripts and signatures ok
    pub const VALID_SCRIPTS: u32 = 5;
    pub const VALID_MASK: u32 = 7;

    pub const HAVE_DATA: u32 = 8;
    pub const HAVE_UNDO: u32 = 16;
    pub const HAVE_MASK: u32 = HAVE_DATA | HAVE_UNDO;

    pub const FAILED_VALID: u32 = 32;
    pub const FAILED_CHILD: u32 = 64;
    pub const FAILED_MASK: u32 = FAILED_VALID | FAILED_CHILD;
}

/// One known header and what we know about its block
#[derive(Debug, Clone)]
pub struct BlockIndexEntry {
    pub hash: Hash,
    pub prev: Option<BlockId>,
    pub skip: Option<BlockId>,
    pub height: i32,
    pub chain_work: U256,
    pub status: u32,
    pub file: u32,
    pub data_pos: u32,
    pub undo_pos: u32,
    /// Transactions in this block, zero until the body is received
    pub tx_count: u32,
    /// Transactions in this block and all ancestors, zero unless every
    /// ancestor body is known
    pub chain_tx: u64,
    /// First-seen order among blocks with data; zero for loaded blocks
    pub sequence_id: i32,
    pub version: i32,
    pub merkle_root: Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub proof_of_stake: bool,
    pub money_supply: Amount,
}

impl BlockIndexEntry {
    pub fn header(&self, prev_hash: Hash) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block_hash: prev_hash,
            merkle_root: self.merkle_root,
            timestamp: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn block_time(&self) -> i64 {
        self.time as i64
    }

    /// Valid up to `up_to` and not failed
    pub fn is_valid(&self, up_to: u32) -> bool {
        if self.status & status::FAILED_MASK != 0 {
            return false;
        }
        self.status & status::VALID_MASK >= up_to
    }

    /// Raise the validity level; false if failed or already at that level
    pub fn raise_validity(&mut self, up_to: u32) -> bool {
        if self.status & status::FAILED_MASK != 0 {
            return false;
        }
        if self.status & status::VALID_MASK < up_to {
            self.status = (self.status & !status::VALID_MASK) | up_to;
            return true;
        }
        false
    }

    pub fn have_data(&self) -> bool {
        self.status & status::HAVE_DATA != 0
    }
}

fn invert_lowest_one(n: i32) -> i32 {
    n & (n - 1)
}

/// Height the skip pointer of a block at `height` jumps to
fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    if height & 1 != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Arena of block index entries with a hash lookup
#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash, BlockId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, hash: &Hash) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn get(&self, id: BlockId) -> &BlockIndexEntry {
        &self.entries[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut BlockIndexEntry {
        &mut self.entries[id.0 as usize]
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.entries.len() as u32).map(BlockId)
    }

    pub fn prev_hash(&self, id: BlockId) -> Hash {
        self.get(id).prev.map(|p| self.get(p).hash).unwrap_or([0u8; 32])
    }

    pub fn header(&self, id: BlockId) -> BlockHeader {
        self.get(id).header(self.prev_hash(id))
    }

    /// AddToBlockIndex: add `header` as a tree-valid entry, or return the
    /// existing id. The parent, if any, must already be indexed.
    pub fn insert_header(&mut self, header: &BlockHeader, proof_of_stake: bool) -> BlockId {
        let hash = header.hash();
        if let Some(id) = self.lookup(&hash) {
            return id;
        }
        let prev = self.lookup(&header.prev_block_hash);
        let (height, parent_work, parent_supply) = match prev {
            Some(p) => {
                let parent = self.get(p);
                (parent.height + 1, parent.chain_work, parent.money_supply)
            }
            None => (0, U256::zero(), 0),
        };
        let skip = prev.and_then(|p| self.ancestor(p, skip_height(height)));
        let id = BlockId(self.entries.len() as u32);
        self.entries.push(BlockIndexEntry {
            hash,
            prev,
            skip,
            height,
            chain_work: parent_work.saturating_add(block_proof(header.bits)),
            status: status::VALID_TREE,
            file: 0,
            data_pos: 0,
            undo_pos: 0,
            tx_count: 0,
            chain_tx: 0,
            sequence_id: 0,
            version: header.version,
            merkle_root: header.merkle_root,
            time: header.timestamp,
            bits: header.bits,
            nonce: header.nonce,
            proof_of_stake,
            money_supply: parent_supply,
        });
        self.by_hash.insert(hash, id);
        id
    }

    /// Insert a fully described entry while loading from disk
    ///
    /// Links, skip pointer and chain work are recomputed from the parent.
    pub fn insert_loaded(&mut self, mut entry: BlockIndexEntry, prev_hash: &Hash) -> BlockId {
        if let Some(id) = self.lookup(&entry.hash) {
            return id;
        }
        entry.prev = self.lookup(prev_hash);
        let parent_work = entry.prev.map(|p| self.get(p).chain_work).unwrap_or_else(U256::zero);
        entry.skip = entry.prev.and_then(|p| self.ancestor(p, skip_height(entry.height)));
        entry.chain_work = parent_work.saturating_add(block_proof(entry.bits));
        let id = BlockId(self.entries.len() as u32);
        self.by_hash.insert(entry.hash, id);
        self.entries.push(entry);
        id
    }

    /// Ancestor of `id` at `height`, in O(log n) via skip pointers
    pub fn ancestor(&self, id: BlockId, height: i32) -> Option<BlockId> {
        let mut walk = id;
        let mut walk_height = self.get(walk).height;
        if height > walk_height || height < 0 {
            return None;
        }
        while walk_height > height {
            let entry = self.get(walk);
            let h_skip = skip_height(walk_height);
            let h_skip_prev = skip_height(walk_height - 1);
            match entry.skip {
                Some(skip)
                    if h_skip == height
                        || (h_skip > height && !(h_skip_prev < h_skip - 2 && h_skip_prev >= height)) =>
                {
                    walk = skip;
                    walk_height = h_skip;
                }
                _ => {
                    walk = entry.prev?;
                    walk_height -= 1;
                }
            }
        }
        Some(walk)
    }

    /// Median timestamp of the last MEDIAN_TIME_SPAN blocks ending at `id`
    pub fn median_time_past(&self, id: BlockId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut walk = Some(id);
        while let Some(current) = walk {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let entry = self.get(current);
            times.push(entry.block_time());
            walk = entry.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// True if `descendant` has `ancestor` on its path to genesis
    pub fn is_ancestor(&self, ancestor: BlockId, descendant: BlockId) -> bool {
        let height = self.get(ancestor).height;
        self.ancestor(descendant, height) == Some(ancestor)
    }

    /// Last common block of the paths to `a` and `b`
    pub fn last_common_ancestor(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        let (mut a, mut b) = (a, b);
        let (ha, hb) = (self.get(a).height, self.get(b).height);
        if ha > hb {
            a = self.ancestor(a, hb)?;
        } else if hb > ha {
            b = self.ancestor(b, ha)?;
        }
        while a != b {
            a = self.get(a).prev?;
            b = self.get(b).prev?;
        }
        Some(a)
    }
}

/// The currently selected path from genesis to tip
#[derive(Debug, Default, Clone)]
pub struct ActiveChain {
    chain: Vec<BlockId>,
    heights: HashMap<BlockId, i32>,
}

impl ActiveChain {
    pub fn tip(&self) -> Option<BlockId> {
        self.chain.last().copied()
    }

    pub fn genesis(&self) -> Option<BlockId> {
        self.chain.first().copied()
    }

    /// Height of the tip, -1 when empty
    pub fn height(&self) -> i32 {
        self.chain.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<BlockId> {
        if height < 0 {
            return None;
        }
        self.chain.get(height as usize).copied()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.heights.contains_key(&id)
    }

    /// Successor of `id` on the active chain
    pub fn next(&self, id: BlockId) -> Option<BlockId> {
        let height = *self.heights.get(&id)?;
        self.at(height + 1)
    }

    /// Make `tip` the active tip, rewriting only the changed suffix
    pub fn set_tip(&mut self, index: &BlockIndex, tip: Option<BlockId>) {
        let Some(tip) = tip else {
            self.chain.clear();
            self.heights.clear();
            return;
        };
        let new_len = index.get(tip).height as usize + 1;
        for removed in self.chain.drain(new_len.min(self.chain.len())..) {
            self.heights.remove(&removed);
        }
        self.chain.resize(new_len, tip);
        let mut walk = Some(tip);
        while let Some(id) = walk {
            let height = index.get(id).height;
            if self.heights.get(&id) == Some(&height) {
                break;
            }
            if let Some(old) = self.chain.get(height as usize).copied() {
                if self.heights.get(&old) == Some(&height) {
                    self.heights.remove(&old);
                }
            }
            self.chain[height as usize] = id;
            self.heights.insert(id, height);
            walk = index.get(id).prev;
        }
    }

    /// Last block of the active chain that is an ancestor of `id`
    pub fn find_fork(&self, index: &BlockIndex, id: BlockId) -> Option<BlockId> {
        let mut walk = if index.get(id).height > self.height() {
            index.ancestor(id, self.height())
        } else {
            Some(id)
        };
        while let Some(current) = walk {
            if self.contains(current) {
                return Some(current);
            }
            walk = index.get(current).prev;
        }
        None
    }

    /// Block locator: dense for the last ten blocks, then exponentially
    /// sparser back to genesis
    pub fn locator(&self, index: &BlockIndex, from: Option<BlockId>) -> Vec<Hash> {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1;
        let mut walk = from.or_else(|| self.tip());
        while let Some(id) = walk {
            let entry = index.get(id);
            hashes.push(entry.hash);
            if entry.height == 0 {
                break;
            }
            let height = (entry.height - step).max(0);
            walk = if self.contains(id) {
                self.at(height)
            } else {
                index.ancestor(id, height)
            };
            if hashes.len() > 10 {
                step *= 2;
            }
        }
        hashes
    }
}

/// IsSuperMajority: at least `required` of the `window` blocks ending at
/// `start` have version ≥ `min_version`
pub fn is_super_majority(
    index: &BlockIndex,
    min_version: i32,
    start: Option<BlockId>,
    required: usize,
    window: usize,
) -> bool {
    let mut found = 0;
    let mut walk = start;
    for _ in 0..window {
        let Some(id) = walk else {
            break;
        };
        if found >= required {
            break;
        }
        let entry = index.get(id);
        if entry.version >= min_version {
            found += 1;
        }
        walk = entry.prev;
    }
    found >= required
}

/// Version-bits top bits; no deployments are tracked
pub const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;

pub fn compute_block_version(_index: &BlockIndex, _prev: Option<BlockId>) -> i32 {
    VERSIONBITS_TOP_BITS
}

/// Highest checkpoint whose block is already indexed
pub fn last_checkpoint(index: &BlockIndex, checkpoints: &BTreeMap<i32, Hash>) -> Option<BlockId> {
    checkpoints.values().rev().find_map(|hash| index.lookup(hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_chain(index: &mut BlockIndex, parent: Hash, len: usize, time_start: u32, salt: u32) -> Vec<BlockId> {
        let mut prev = parent;
        let mut ids = Vec::new();
        for i in 0..len {
            let header = BlockHeader {
                version: 1 + (i as i32 % 3),
                prev_block_hash: prev,
                merkle_root: [0; 32],
                timestamp: time_start + i as u32 * 60,
                bits: 0x207fffff,
                nonce: salt,
            };
            let id = index.insert_header(&header, false);
            prev = index.get(id).hash;
            ids.push(id);
        }
        ids
    }

    #[test]
    fn test_insert_header_links_and_work() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0; 32], 3, 1000, 0);
        assert_eq!(index.get(ids[2]).height, 2);
        assert_eq!(index.get(ids[2]).prev, Some(ids[1]));
        assert!(index.get(ids[2]).chain_work > index.get(ids[1]).chain_work);
        assert_eq!(index.get(ids[0]).status & status::VALID_MASK, status::VALID_TREE);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0; 32], 1, 1000, 0);
        let header = index.header(ids[0]);
        assert_eq!(index.insert_header(&header, false), ids[0]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_ancestor_matches_linear_walk() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0; 32], 300, 1000, 0);
        let tip = *ids.last().unwrap();
        for height in [0, 1, 2, 63, 64, 127, 128, 200, 299] {
            assert_eq!(index.ancestor(tip, height), Some(ids[height as usize]));
        }
        assert_eq!(index.ancestor(tip, 300), None);
    }

    #[test]
    fn test_median_time_past() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0; 32], 20, 1000, 0);
        // Last eleven times are 1000 + 60*9 ..= 1000 + 60*19
        assert_eq!(index.median_time_past(ids[19]), 1000 + 60 * 14);
        assert_eq!(index.median_time_past(ids[0]), 1000);
    }

    #[test]
    fn test_set_tip_and_find_fork() {
        let mut index = BlockIndex::new();
        let main = build_chain(&mut index, [0; 32], 10, 1000, 0);
        let fork_base = index.get(main[4]).hash;
        let side = build_chain(&mut index, fork_base, 3, 5000, 1);

        let mut active = ActiveChain::default();
        active.set_tip(&index, Some(main[9]));
        assert_eq!(active.height(), 9);
        assert!(active.contains(main[5]));
        assert_eq!(active.find_fork(&index, side[2]), Some(main[4]));

        active.set_tip(&index, Some(side[2]));
        assert_eq!(active.height(), 7);
        assert!(!active.contains(main[5]));
        assert!(active.contains(side[0]));
        assert_eq!(active.next(main[4]), Some(side[0]));
        assert_eq!(index.last_common_ancestor(main[9], side[2]), Some(main[4]));
        assert!(index.is_ancestor(main[4], side[2]));
        assert!(!index.is_ancestor(main[5], side[2]));
    }

    #[test]
    fn test_locator_ends_at_genesis() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0; 32], 50, 1000, 0);
        let mut active = ActiveChain::default();
        active.set_tip(&index, ids.last().copied());
        let locator = active.locator(&index, None);
        assert_eq!(locator.first(), Some(&index.get(ids[49]).hash));
        assert_eq!(locator.last(), Some(&index.get(ids[0]).hash));
        assert!(locator.len() < 25);
    }

    #[test]
    fn test_super_majority_counts_window() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0; 32], 9, 1000, 0);
        // Versions cycle 1,2,3: three of the last nine are version 3
        assert!(is_super_majority(&index, 3, Some(ids[8]), 3, 9));
        assert!(!is_super_majority(&index, 3, Some(ids[8]), 4, 9));
        assert!(is_super_majority(&index, 2, Some(ids[8]), 6, 9));
    }

    #[test]
    fn test_block_version_sets_top_bits() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0; 32], 2, 1000, 0);
        let version = compute_block_version(&index, Some(ids[1]));
        assert_eq!(version & VERSIONBITS_TOP_BITS, VERSIONBITS_TOP_BITS);
        assert_eq!(compute_block_version(&index, None), version);
    }

    #[test]
    fn test_raise_validity_respects_failure() {
        let mut index = BlockIndex::new();
        let ids = build_chain(&mut index, [0; 32], 1, 1000, 0);
        let entry = index.get_mut(ids[0]);
        assert!(entry.raise_validity(status::VALID_TRANSACTIONS));
        assert!(!entry.raise_validity(status::VALID_TREE));
        entry.status |= status::FAILED_VALID;
        assert!(!entry.raise_validity(status::VALID_SCRIPTS));
        assert!(!entry.is_valid(status::VALID_TREE));
    }
}
