//! Transaction memory pool
//!
//! Holds validated unconfirmed transactions with in-pool ancestor and
//! descendant statistics, a rolling minimum fee that rises when the pool is
//! trimmed and decays afterwards, fee/priority deltas set by operators, and
//! a separate pool of orphan transactions waiting for their parents.

use crate::constants::*;
use crate::locktime::LockPoints;
use crate::policy::FeeRate;
use crate::types::*;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::mem::size_of;
use std::sync::Arc;

/// Why an entry left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Expiry,
    SizeLimit,
    Reorg,
    Block,
    Conflict,
}

/// In-pool chain limits, sizes in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AncestorLimits {
    pub ancestor_count: u64,
    pub ancestor_size: u64,
    pub descendant_count: u64,
    pub descendant_size: u64,
}

impl Default for AncestorLimits {
    fn default() -> Self {
        Self {
            ancestor_count: DEFAULT_ANCESTOR_LIMIT,
            ancestor_size: DEFAULT_ANCESTOR_SIZE_LIMIT * 1000,
            descendant_count: DEFAULT_DESCENDANT_LIMIT,
            descendant_size: DEFAULT_DESCENDANT_SIZE_LIMIT * 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Arc<Transaction>,
    pub txid: Hash,
    pub fee: Amount,
    pub size: usize,
    /// Size with scriptSig and fixed input overhead discounted, for priority
    pub mod_size: usize,
    pub usage: usize,
    pub time: i64,
    pub entry_priority: f64,
    pub entry_height: u32,
    pub in_chain_input_value: Amount,
    pub spends_coinbase: bool,
    pub sig_op_count: u32,
    pub fee_delta: Amount,
    pub lock_points: LockPoints,

    pub count_with_descendants: u64,
    pub size_with_descendants: u64,
    pub fees_with_descendants: Amount,
    pub count_with_ancestors: u64,
    pub size_with_ancestors: u64,
    pub fees_with_ancestors: Amount,
    pub sigops_with_ancestors: u32,

    parents: HashSet<Hash>,
    children: HashSet<Hash>,
    sequence: u64,
}

impl MempoolEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx: Arc<Transaction>,
        fee: Amount,
        time: i64,
        entry_priority: f64,
        entry_height: u32,
        in_chain_input_value: Amount,
        spends_coinbase: bool,
        sig_op_count: u32,
        lock_points: LockPoints,
    ) -> Self {
        let size = tx.serialized_size();
        let mut mod_size = size;
        for input in &tx.inputs {
            let offset = 41 + input.script_sig.len().min(110);
            if mod_size > offset {
                mod_size -= offset;
            }
        }
        let usage = size_of::<Transaction>()
            + tx.inputs.iter().map(|i| size_of::<TransactionInput>() + i.script_sig.capacity()).sum::<usize>()
            + tx.outputs.iter().map(|o| size_of::<TransactionOutput>() + o.script_pubkey.capacity()).sum::<usize>();
        Self {
            txid: tx.txid(),
            tx,
            fee,
            size,
            mod_size,
            usage,
            time,
            entry_priority,
            entry_height,
            in_chain_input_value,
            spends_coinbase,
            sig_op_count,
            fee_delta: 0,
            lock_points,
            count_with_descendants: 1,
            size_with_descendants: size as u64,
            fees_with_descendants: fee,
            count_with_ancestors: 1,
            size_with_ancestors: size as u64,
            fees_with_ancestors: fee,
            sigops_with_ancestors: sig_op_count,
            parents: HashSet::new(),
            children: HashSet::new(),
            sequence: 0,
        }
    }

    pub fn modified_fee(&self) -> Amount {
        self.fee + self.fee_delta
    }

    /// Priority as of `height`, aging confirmed inputs
    pub fn priority(&self, height: u32) -> f64 {
        if self.mod_size == 0 {
            return self.entry_priority;
        }
        let aged = height.saturating_sub(self.entry_height) as f64 * self.in_chain_input_value as f64;
        self.entry_priority + aged / self.mod_size as f64
    }

    /// (fee, size) of the better of the entry alone and its package
    fn descendant_score(&self) -> (f64, f64) {
        let own = (self.modified_fee() as f64, self.size as f64);
        let package = (self.fees_with_descendants as f64, self.size_with_descendants as f64);
        if package.0 * own.1 > own.0 * package.1 {
            package
        } else {
            own
        }
    }
}

/// Position of an entry in the descendant-score index
///
/// Ordered by fee rate of the better of entry and package; on a tie the
/// newer entry ranks lower. The lowest key is evicted first.
#[derive(Debug, Clone, Copy)]
struct DescendantScore {
    fee: f64,
    size: f64,
    sequence: u64,
    txid: Hash,
}

impl DescendantScore {
    fn of(entry: &MempoolEntry) -> Self {
        let (fee, size) = entry.descendant_score();
        Self { fee, size, sequence: entry.sequence, txid: entry.txid }
    }
}

impl Ord for DescendantScore {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.fee * other.size;
        let rhs = other.fee * self.size;
        lhs.partial_cmp(&rhs)
            .filter(|ordering| ordering.is_ne())
            .unwrap_or_else(|| other.sequence.cmp(&self.sequence))
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for DescendantScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DescendantScore {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for DescendantScore {}

const ENTRY_OVERHEAD: usize = size_of::<MempoolEntry>() + 6 * size_of::<usize>();
const SPEND_OVERHEAD: usize = size_of::<OutPoint>() + size_of::<Hash>() + 2 * size_of::<usize>();

pub struct TxMempool {
    entries: HashMap<Hash, MempoolEntry>,
    by_descendant_score: BTreeSet<DescendantScore>,
    spends: HashMap<OutPoint, Hash>,
    deltas: HashMap<Hash, (f64, Amount)>,
    total_tx_size: usize,
    inner_usage: usize,
    next_sequence: u64,
    min_reasonable_relay_fee: FeeRate,
    rolling_minimum_fee_rate: f64,
    last_rolling_fee_update: i64,
    block_since_last_rolling_fee_bump: bool,
    transactions_updated: u64,
}

impl TxMempool {
    pub fn new(min_reasonable_relay_fee: FeeRate) -> Self {
        Self {
            entries: HashMap::new(),
            by_descendant_score: BTreeSet::new(),
            spends: HashMap::new(),
            deltas: HashMap::new(),
            total_tx_size: 0,
            inner_usage: 0,
            next_sequence: 0,
            min_reasonable_relay_fee,
            rolling_minimum_fee_rate: 0.0,
            last_rolling_fee_update: 0,
            block_since_last_rolling_fee_bump: false,
            transactions_updated: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_tx_size(&self) -> usize {
        self.total_tx_size
    }

    pub fn transactions_updated(&self) -> u64 {
        self.transactions_updated
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.inner_usage + self.entries.len() * ENTRY_OVERHEAD + self.spends.len() * SPEND_OVERHEAD
    }

    pub fn exists(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn lookup(&self, txid: &Hash) -> Option<&Transaction> {
        self.entries.get(txid).map(|entry| entry.tx.as_ref())
    }

    /// Pool transaction spending `outpoint`
    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash> {
        self.spends.get(outpoint).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    /// Mutate an entry's statistics, keeping it in place in the score index
    fn update_entry(&mut self, txid: &Hash, update: impl FnOnce(&mut MempoolEntry)) {
        if let Some(entry) = self.entries.get_mut(txid) {
            self.by_descendant_score.remove(&DescendantScore::of(entry));
            update(entry);
            self.by_descendant_score.insert(DescendantScore::of(entry));
        }
    }

    /// Ancestors `tx` would have if added, enforcing `limits`
    ///
    /// Fails with a human-readable reason when a limit would be exceeded.
    pub fn calculate_ancestors(
        &self,
        tx: &Transaction,
        size: usize,
        limits: &AncestorLimits,
    ) -> Result<HashSet<Hash>, String> {
        let parents: HashSet<Hash> = tx
            .inputs
            .iter()
            .map(|input| input.prevout.hash)
            .filter(|hash| self.entries.contains_key(hash))
            .collect();
        if parents.len() as u64 + 1 > limits.ancestor_count {
            return Err(format!("too many unconfirmed parents [limit: {}]", limits.ancestor_count));
        }
        self.walk_ancestors(parents, size as u64, limits)
    }

    fn walk_ancestors(
        &self,
        parents: HashSet<Hash>,
        size: u64,
        limits: &AncestorLimits,
    ) -> Result<HashSet<Hash>, String> {
        let mut ancestors = HashSet::new();
        let mut total_size = size;
        let mut queue: VecDeque<Hash> = parents.into_iter().collect();
        while let Some(txid) = queue.pop_front() {
            if !ancestors.insert(txid) {
                continue;
            }
            let Some(entry) = self.entries.get(&txid) else {
                continue;
            };
            total_size += entry.size as u64;
            if entry.size_with_descendants + size > limits.descendant_size {
                return Err(format!(
                    "exceeds descendant size limit for tx {} [limit: {}]",
                    hash_to_hex(&txid),
                    limits.descendant_size
                ));
            }
            if entry.count_with_descendants + 1 > limits.descendant_count {
                return Err(format!(
                    "too many descendants for tx {} [limit: {}]",
                    hash_to_hex(&txid),
                    limits.descendant_count
                ));
            }
            if total_size > limits.ancestor_size {
                return Err(format!("exceeds ancestor size limit [limit: {}]", limits.ancestor_size));
            }
            if ancestors.len() as u64 + 1 > limits.ancestor_count {
                return Err(format!("too many unconfirmed ancestors [limit: {}]", limits.ancestor_count));
            }
            queue.extend(entry.parents.iter().copied());
        }
        Ok(ancestors)
    }

    fn ancestors_of(&self, txid: &Hash) -> HashSet<Hash> {
        let mut ancestors = HashSet::new();
        let mut queue: VecDeque<Hash> = match self.entries.get(txid) {
            Some(entry) => entry.parents.iter().copied().collect(),
            None => return ancestors,
        };
        while let Some(next) = queue.pop_front() {
            if ancestors.insert(next) {
                if let Some(entry) = self.entries.get(&next) {
                    queue.extend(entry.parents.iter().copied());
                }
            }
        }
        ancestors
    }

    /// `txid` and all its in-pool descendants
    pub fn calculate_descendants(&self, txid: &Hash, descendants: &mut HashSet<Hash>) {
        let mut queue = VecDeque::from([*txid]);
        while let Some(next) = queue.pop_front() {
            if !descendants.insert(next) {
                continue;
            }
            if let Some(entry) = self.entries.get(&next) {
                queue.extend(entry.children.iter().copied());
            }
        }
    }

    /// Insert an entry whose ancestors were computed by
    /// [`calculate_ancestors`](Self::calculate_ancestors)
    pub fn add_unchecked(&mut self, mut entry: MempoolEntry, ancestors: &HashSet<Hash>) {
        let txid = entry.txid;
        if let Some((_, fee_delta)) = self.deltas.get(&txid) {
            entry.fee_delta = *fee_delta;
            entry.fees_with_descendants += *fee_delta;
        }
        entry.sequence = self.next_sequence;
        self.next_sequence += 1;

        for input in &entry.tx.inputs {
            self.spends.insert(input.prevout, txid);
            if let Some(parent) = self.entries.get_mut(&input.prevout.hash) {
                entry.parents.insert(parent.txid);
                parent.children.insert(txid);
            }
        }

        let modified_fee = entry.modified_fee();
        let mut fees = modified_fee;
        let mut size = entry.size as u64;
        let mut sigops = entry.sig_op_count;
        let entry_size = entry.size as u64;
        for ancestor in ancestors {
            self.update_entry(ancestor, |a| {
                a.count_with_descendants += 1;
                a.size_with_descendants += entry_size;
                a.fees_with_descendants += modified_fee;
                fees += a.modified_fee();
                size += a.size as u64;
                sigops += a.sig_op_count;
            });
        }
        entry.count_with_ancestors = ancestors.len() as u64 + 1;
        entry.size_with_ancestors = size;
        entry.fees_with_ancestors = fees;
        entry.sigops_with_ancestors = sigops;

        self.total_tx_size += entry.size;
        self.inner_usage += entry.usage;
        self.transactions_updated += 1;
        tracing::debug!(target: "mempool", txid = %hash_to_hex(&txid), size = entry.size, fee = entry.fee, "added to pool");
        self.by_descendant_score.insert(DescendantScore::of(&entry));
        self.entries.insert(txid, entry);
    }

    /// Remove a set closed under descendants, or a set whose remaining
    /// descendants should keep their place (block inclusion)
    fn remove_staged(&mut self, stage: &HashSet<Hash>, update_descendants: bool, reason: RemovalReason) {
        for txid in stage {
            let Some(entry) = self.entries.get(txid) else {
                continue;
            };
            let (size, fee, sigops) = (entry.size as u64, entry.modified_fee(), entry.sig_op_count);
            let ancestors = self.ancestors_of(txid);
            let mut descendants = HashSet::new();
            if update_descendants {
                self.calculate_descendants(txid, &mut descendants);
                descendants.remove(txid);
            }
            for ancestor in ancestors.iter().filter(|a| !stage.contains(*a)) {
                self.update_entry(ancestor, |a| {
                    a.count_with_descendants -= 1;
                    a.size_with_descendants -= size;
                    a.fees_with_descendants -= fee;
                });
            }
            for descendant in descendants.iter().filter(|d| !stage.contains(*d)) {
                if let Some(d) = self.entries.get_mut(descendant) {
                    d.count_with_ancestors -= 1;
                    d.size_with_ancestors -= size;
                    d.fees_with_ancestors -= fee;
                    d.sigops_with_ancestors -= sigops;
                }
            }
        }
        for txid in stage {
            let Some(entry) = self.entries.remove(txid) else {
                continue;
            };
            self.by_descendant_score.remove(&DescendantScore::of(&entry));
            for input in &entry.tx.inputs {
                self.spends.remove(&input.prevout);
            }
            for parent in &entry.parents {
                if let Some(p) = self.entries.get_mut(parent) {
                    p.children.remove(txid);
                }
            }
            for child in &entry.children {
                if let Some(c) = self.entries.get_mut(child) {
                    c.parents.remove(txid);
                }
            }
            self.total_tx_size -= entry.size;
            self.inner_usage -= entry.usage;
            self.transactions_updated += 1;
            tracing::debug!(target: "mempool", txid = %hash_to_hex(txid), ?reason, "removed from pool");
        }
    }

    /// Remove `tx` (or, if absent, whatever spends its outputs) together
    /// with all descendants
    pub fn remove_recursive(&mut self, tx: &Transaction, reason: RemovalReason) {
        let txid = tx.txid();
        let mut stage = HashSet::new();
        if self.entries.contains_key(&txid) {
            self.calculate_descendants(&txid, &mut stage);
        } else {
            for index in 0..tx.outputs.len() as u32 {
                if let Some(spender) = self.spender(&OutPoint::new(txid, index)) {
                    self.calculate_descendants(&spender, &mut stage);
                }
            }
        }
        self.remove_staged(&stage, false, reason);
    }

    /// Evict pool transactions that spend the same outputs as `tx`
    pub fn remove_conflicts(&mut self, tx: &Transaction) {
        let txid = tx.txid();
        let conflicts: Vec<Hash> = tx
            .inputs
            .iter()
            .filter_map(|input| self.spender(&input.prevout))
            .filter(|spender| *spender != txid)
            .collect();
        for conflict in conflicts {
            if let Some(entry) = self.entries.get(&conflict) {
                let conflict_tx = Arc::clone(&entry.tx);
                tracing::debug!(
                    target: "mempool",
                    txid = %hash_to_hex(&conflict),
                    conflicts_with = %hash_to_hex(&txid),
                    "removing conflicting transaction"
                );
                self.remove_recursive(&conflict_tx, RemovalReason::Conflict);
            }
        }
    }

    /// Drop the transactions of a connected block and their conflicts
    pub fn remove_for_block(&mut self, transactions: &[Transaction], now: i64) {
        for tx in transactions {
            let txid = tx.txid();
            if self.entries.contains_key(&txid) {
                let stage = HashSet::from([txid]);
                self.remove_staged(&stage, true, RemovalReason::Block);
            }
            self.remove_conflicts(tx);
            self.deltas.remove(&txid);
        }
        self.last_rolling_fee_update = now;
        self.block_since_last_rolling_fee_bump = true;
    }

    /// Remove every entry `invalid` flags, with its descendants, after the
    /// chain tip moved backwards
    pub fn remove_for_reorg<F>(&mut self, mut invalid: F)
    where
        F: FnMut(&TxMempool, &MempoolEntry) -> bool,
    {
        let to_remove: Vec<Arc<Transaction>> = self
            .entries
            .values()
            .filter(|entry| invalid(self, entry))
            .map(|entry| Arc::clone(&entry.tx))
            .collect();
        for tx in to_remove {
            self.remove_recursive(&tx, RemovalReason::Reorg);
        }
    }

    /// Remove entries older than `cutoff`, with their descendants
    pub fn expire(&mut self, cutoff: i64) -> usize {
        let old: Vec<Hash> = self
            .entries
            .values()
            .filter(|entry| entry.time < cutoff)
            .map(|entry| entry.txid)
            .collect();
        let mut stage = HashSet::new();
        for txid in &old {
            self.calculate_descendants(txid, &mut stage);
        }
        self.remove_staged(&stage, false, RemovalReason::Expiry);
        stage.len()
    }

    fn track_package_removed(&mut self, rate: &FeeRate) {
        if rate.sat_per_k as f64 > self.rolling_minimum_fee_rate {
            self.rolling_minimum_fee_rate = rate.sat_per_k as f64;
            self.block_since_last_rolling_fee_bump = false;
        }
    }

    /// Evict lowest descendant-score packages until usage fits `size_limit`
    ///
    /// Returns outpoints spent by evicted transactions whose parents are
    /// not in the pool, so callers can drop them from the coin cache.
    pub fn trim_to_size(&mut self, size_limit: usize) -> Vec<OutPoint> {
        let mut txn_removed = 0usize;
        let mut max_fee_rate_removed = FeeRate::new(0);
        let mut no_spends_remaining = Vec::new();
        while !self.entries.is_empty() && self.dynamic_memory_usage() > size_limit {
            let Some(worst) = self.by_descendant_score.first().and_then(|key| self.entries.get(&key.txid)) else {
                break;
            };
            let (worst_txid, package_fees, package_size) =
                (worst.txid, worst.fees_with_descendants, worst.size_with_descendants);
            let mut removed = FeeRate::from_fee(package_fees, package_size as usize);
            removed.sat_per_k += self.min_reasonable_relay_fee.sat_per_k;
            self.track_package_removed(&removed);
            if removed.sat_per_k > max_fee_rate_removed.sat_per_k {
                max_fee_rate_removed = removed;
            }

            let mut stage = HashSet::new();
            self.calculate_descendants(&worst_txid, &mut stage);
            txn_removed += stage.len();
            let txs: Vec<Arc<Transaction>> = stage
                .iter()
                .filter_map(|txid| self.entries.get(txid).map(|e| Arc::clone(&e.tx)))
                .collect();
            self.remove_staged(&stage, false, RemovalReason::SizeLimit);
            for tx in txs {
                for input in &tx.inputs {
                    if !self.entries.contains_key(&input.prevout.hash) {
                        no_spends_remaining.push(input.prevout);
                    }
                }
            }
        }
        if max_fee_rate_removed.sat_per_k > 0 {
            tracing::debug!(
                target: "mempool",
                txn_removed,
                max_fee_rate = max_fee_rate_removed.sat_per_k,
                "removed transactions to fit size limit"
            );
        }
        no_spends_remaining
    }

    /// Rolling minimum fee rate for entry into a pool of `size_limit` bytes
    ///
    /// After a trim the floor decays with a 12 hour half-life, four times
    /// faster below a quarter of the limit and twice as fast below half.
    /// It snaps to zero once below half the minimum relay fee.
    pub fn get_min_fee(&mut self, size_limit: usize, now: i64) -> FeeRate {
        if !self.block_since_last_rolling_fee_bump || self.rolling_minimum_fee_rate == 0.0 {
            return FeeRate::new(self.rolling_minimum_fee_rate as Amount);
        }
        if now > self.last_rolling_fee_update + 10 {
            let mut halflife = ROLLING_FEE_HALFLIFE as f64;
            let usage = self.dynamic_memory_usage();
            if usage < size_limit / 4 {
                halflife /= 4.0;
            } else if usage < size_limit / 2 {
                halflife /= 2.0;
            }
            let elapsed = (now - self.last_rolling_fee_update) as f64;
            self.rolling_minimum_fee_rate /= 2f64.powf(elapsed / halflife);
            self.last_rolling_fee_update = now;
            if self.rolling_minimum_fee_rate < self.min_reasonable_relay_fee.sat_per_k as f64 / 2.0 {
                self.rolling_minimum_fee_rate = 0.0;
                return FeeRate::new(0);
            }
        }
        let rolling = FeeRate::new(self.rolling_minimum_fee_rate as Amount);
        if rolling.sat_per_k > self.min_reasonable_relay_fee.sat_per_k {
            rolling
        } else {
            self.min_reasonable_relay_fee
        }
    }

    /// Adjust the priority and fee a transaction is judged by
    pub fn prioritise_transaction(&mut self, txid: &Hash, priority_delta: f64, fee_delta: Amount) {
        let delta = self.deltas.entry(*txid).or_insert((0.0, 0));
        delta.0 += priority_delta;
        delta.1 += fee_delta;

        if self.entries.contains_key(txid) {
            let ancestors = self.ancestors_of(txid);
            let mut descendants = HashSet::new();
            self.calculate_descendants(txid, &mut descendants);
            descendants.remove(txid);
            self.update_entry(txid, |entry| {
                entry.fee_delta += fee_delta;
                entry.fees_with_descendants += fee_delta;
                entry.fees_with_ancestors += fee_delta;
            });
            for ancestor in &ancestors {
                self.update_entry(ancestor, |a| a.fees_with_descendants += fee_delta);
            }
            for descendant in &descendants {
                if let Some(d) = self.entries.get_mut(descendant) {
                    d.fees_with_ancestors += fee_delta;
                }
            }
        }
        tracing::info!(
            target: "mempool",
            txid = %hash_to_hex(txid),
            priority_delta,
            fee_delta,
            "prioritised transaction"
        );
    }

    /// Deltas set for `txid`: (priority, fee)
    pub fn apply_deltas(&self, txid: &Hash) -> (f64, Amount) {
        self.deltas.get(txid).copied().unwrap_or((0.0, 0))
    }
}

/// Seconds between sweeps of expired orphans
const ORPHAN_TX_EXPIRE_INTERVAL: i64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct OrphanTx {
    pub tx: Arc<Transaction>,
    pub from_peer: u64,
    pub expires: i64,
}

/// Transactions whose inputs are not yet known
#[derive(Debug, Default)]
pub struct OrphanPool {
    orphans: HashMap<Hash, OrphanTx>,
    by_prev: HashMap<OutPoint, HashSet<Hash>>,
    next_sweep: i64,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.orphans.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&OrphanTx> {
        self.orphans.get(txid)
    }

    /// Store an orphan; oversized or duplicate transactions are ignored
    pub fn add(&mut self, tx: Arc<Transaction>, from_peer: u64, now: i64) -> bool {
        let txid = tx.txid();
        if self.orphans.contains_key(&txid) {
            return false;
        }
        let size = tx.serialized_size();
        if size > MAX_ORPHAN_TX_SIZE {
            tracing::debug!(target: "mempool", txid = %hash_to_hex(&txid), size, "ignoring large orphan tx");
            return false;
        }
        for input in &tx.inputs {
            self.by_prev.entry(input.prevout).or_default().insert(txid);
        }
        self.orphans.insert(txid, OrphanTx { tx, from_peer, expires: now + ORPHAN_TX_EXPIRE_TIME });
        tracing::debug!(target: "mempool", txid = %hash_to_hex(&txid), total = self.orphans.len(), "stored orphan tx");
        true
    }

    pub fn erase(&mut self, txid: &Hash) -> bool {
        let Some(orphan) = self.orphans.remove(txid) else {
            return false;
        };
        for input in &orphan.tx.inputs {
            if let Some(set) = self.by_prev.get_mut(&input.prevout) {
                set.remove(txid);
                if set.is_empty() {
                    self.by_prev.remove(&input.prevout);
                }
            }
        }
        true
    }

    pub fn erase_for_peer(&mut self, peer: u64) -> usize {
        let ids: Vec<Hash> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| orphan.from_peer == peer)
            .map(|(txid, _)| *txid)
            .collect();
        ids.iter().filter(|txid| self.erase(txid)).count()
    }

    /// Orphans that spend an output of `txid`
    pub fn children_of(&self, txid: &Hash, outputs: usize) -> Vec<Hash> {
        let mut children: Vec<Hash> = (0..outputs as u32)
            .filter_map(|index| self.by_prev.get(&OutPoint::new(*txid, index)))
            .flat_map(|set| set.iter().copied())
            .collect();
        children.sort_unstable();
        children.dedup();
        children
    }

    /// Drop orphans conflicting with or included in a connected block
    pub fn erase_for_block(&mut self, block: &Block) -> usize {
        let mut erase = HashSet::new();
        for tx in &block.transactions {
            for input in &tx.inputs {
                if let Some(set) = self.by_prev.get(&input.prevout) {
                    erase.extend(set.iter().copied());
                }
            }
        }
        erase.iter().filter(|txid| self.erase(txid)).count()
    }

    /// Expire old orphans, then evict random ones down to `max`
    pub fn limit<R: Rng>(&mut self, max: usize, now: i64, rng: &mut R) -> usize {
        let mut evicted = 0;
        if self.next_sweep <= now {
            let expired: Vec<Hash> = self
                .orphans
                .iter()
                .filter(|(_, orphan)| orphan.expires <= now)
                .map(|(txid, _)| *txid)
                .collect();
            let erased = expired.iter().filter(|txid| self.erase(txid)).count();
            let min_expiry = self.orphans.values().map(|o| o.expires).min().unwrap_or(now + ORPHAN_TX_EXPIRE_TIME);
            self.next_sweep = min_expiry + ORPHAN_TX_EXPIRE_INTERVAL;
            if erased > 0 {
                tracing::debug!(target: "mempool", erased, "erased expired orphan txs");
            }
        }
        while self.orphans.len() > max {
            let pick = rng.gen_range(0..self.orphans.len());
            let Some(txid) = self.orphans.keys().nth(pick).copied() else {
                break;
            };
            self.erase(&txid);
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(target: "mempool", evicted, "orphan pool overflow");
        }
        evicted
    }
}
