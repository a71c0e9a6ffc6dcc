//! Chain state manager: block acceptance, best-chain activation,
//! reorganization, invalidation and flushing
//!
//! Three locks guard the state, always taken in this order:
//! 1. `chain`: block index, active chain, coin tip, candidate set
//! 2. `mempool`: transaction pool, orphans, relay limiter
//! 3. `files`: block and undo file bookkeeping
//!
//! The mempool and file locks are only ever taken while the chain lock is
//! held, or on their own.

use crate::admission::{accept_to_memory_pool, AdmissionContext, AdmissionOptions, AdmissionOutcome, RelayLimiter};
use crate::block::{
    check_block, check_index_against_checkpoint, connect_block, contextual_check_block,
    contextual_check_block_header, disconnect_block, BlockCheckContext, CheckedBlocks, ConnectContext,
};
use crate::blockfile::{BlockFiles, DiskPos};
use crate::chain::{status, ActiveChain, BlockId, BlockIndex, BlockIndexEntry};
use crate::clock::Clock;
use crate::coins::{CoinsView, CoinsViewCache, CoinsViewDb, CoinsViewMempool};
use crate::config::{ChainParams, ValidationConfig};
use crate::constants::*;
use crate::error::{reject, ConsensusError, Rejection, Result, ValidationResult};
use crate::flush::{FlushMode, FlushTimer};
use crate::locktime::{calculate_sequence_locks, evaluate_sequence_locks, is_final_tx, test_lock_point_validity, LockPoints};
use crate::mempool::{OrphanPool, RemovalReason, TxMempool};
use crate::notify::ValidationSignals;
use crate::policy::FeeRate;
use crate::pow::check_proof_of_work;
use crate::script::ScriptVerifier;
use crate::service::ServiceTransactionProvider;
use crate::storage::{BlockTreeDb, KeyValueStore};
use crate::types::*;
use crate::undo::DisconnectResult;
use parking_lot::Mutex;
use primitive_types::U256;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ordering of tip candidates: more work first, then earlier arrival, then
/// lower handle. The best candidate is the greatest key.
pub type CandidateKey = (U256, Reverse<i32>, Reverse<BlockId>);

fn candidate_key(index: &BlockIndex, id: BlockId) -> CandidateKey {
    let entry = index.get(id);
    (entry.chain_work, Reverse(entry.sequence_id), Reverse(id))
}

fn log2_work(work: U256) -> f64 {
    let bits = work.bits();
    if bits <= 64 {
        return (work.low_u64() as f64).log2();
    }
    ((work >> (bits - 64)).low_u64() as f64).log2() + (bits - 64) as f64
}

/// CheckFinalTx: 𝒯𝒳 × flags → {true, false}
///
/// Final in a block at tip height + 1, timed by the tip's median time past
/// when LOCKTIME_MEDIAN_TIME_PAST is set and by `adjusted_time` otherwise.
pub fn check_final_tx(
    index: &BlockIndex,
    active: &ActiveChain,
    tx: &Transaction,
    flags: u32,
    adjusted_time: i64,
) -> bool {
    let height = active.height() + 1;
    let block_time = match active.tip() {
        Some(tip) if flags & LOCKTIME_MEDIAN_TIME_PAST != 0 => index.median_time_past(tip),
        _ => adjusted_time,
    };
    is_final_tx(tx, height, block_time)
}

/// CheckSequenceLocks: 𝒯𝒳 × 𝒰𝒮 × flags → {true, false}
///
/// BIP68 locks of `tx` against a block at tip height + 1. Inputs found only
/// in the pool count as confirmed in that block. Unless `use_existing`,
/// `lock_points` is refilled, with `max_input_block` set to the tip's
/// ancestor at the highest confirmed input height.
pub fn check_sequence_locks(
    index: &BlockIndex,
    active: &ActiveChain,
    view: &impl CoinsView,
    tx: &Transaction,
    flags: u32,
    lock_points: &mut LockPoints,
    use_existing: bool,
) -> bool {
    let Some(tip) = active.tip() else {
        return false;
    };
    let height = index.get(tip).height + 1;

    let pair = if use_existing {
        (lock_points.height, lock_points.time)
    } else {
        let mut prev_heights = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let Some(coin) = view.get_coin(&input.prevout) else {
                tracing::error!(
                    target: "mempool",
                    txid = %hash_to_hex(&tx.txid()),
                    "missing input while checking sequence locks"
                );
                return false;
            };
            prev_heights.push(if coin.height == MEMPOOL_HEIGHT {
                height
            } else {
                coin.height as i32
            });
        }
        let mtp_at = |h: i32| index.ancestor(tip, h).map_or(0, |a| index.median_time_past(a));
        let pair = calculate_sequence_locks(tx, flags, &mut prev_heights, mtp_at);
        lock_points.height = pair.0;
        lock_points.time = pair.1;
        let max_input_height = prev_heights.iter().copied().filter(|h| *h != height).max().unwrap_or(0);
        lock_points.max_input_block = index.ancestor(tip, max_input_height);
        pair
    };
    evaluate_sequence_locks(height, index.median_time_past(tip), pair)
}

/// Everything behind the chain lock
pub struct ChainState<S> {
    index: BlockIndex,
    active: ActiveChain,
    coins_tip: CoinsViewCache<CoinsViewDb<Arc<S>>>,
    block_tree: BlockTreeDb<Arc<S>>,
    candidates: BTreeSet<CandidateKey>,
    /// Blocks with data whose parent's data is missing, keyed by parent
    unlinked: HashMap<BlockId, Vec<BlockId>>,
    dirty_index: BTreeSet<BlockId>,
    next_sequence_id: i32,
    best_invalid: Option<BlockId>,
    best_header: Option<BlockId>,
    checked: CheckedBlocks,
    flush_timer: FlushTimer,
}

impl<S: KeyValueStore> ChainState<S> {
    fn new(store: Arc<S>) -> Self {
        Self {
            index: BlockIndex::new(),
            active: ActiveChain::default(),
            coins_tip: CoinsViewCache::new(CoinsViewDb::new(Arc::clone(&store))),
            block_tree: BlockTreeDb::new(store),
            candidates: BTreeSet::new(),
            unlinked: HashMap::new(),
            dirty_index: BTreeSet::new(),
            next_sequence_id: 1,
            best_invalid: None,
            best_header: None,
            checked: CheckedBlocks::new(),
            flush_timer: FlushTimer::default(),
        }
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn active(&self) -> &ActiveChain {
        &self.active
    }

    pub fn coins_tip(&self) -> &CoinsViewCache<CoinsViewDb<Arc<S>>> {
        &self.coins_tip
    }

    pub fn is_candidate(&self, id: BlockId) -> bool {
        self.candidates.contains(&candidate_key(&self.index, id))
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn best_invalid(&self) -> Option<BlockId> {
        self.best_invalid
    }

    pub fn best_header(&self) -> Option<BlockId> {
        self.best_header
    }

    /// Children waiting on `parent`'s data
    pub fn unlinked_children(&self, parent: BlockId) -> &[BlockId] {
        self.unlinked.get(&parent).map_or(&[], Vec::as_slice)
    }

    fn mark_dirty(&mut self, id: BlockId) {
        self.dirty_index.insert(id);
    }

    fn remove_candidate(&mut self, id: BlockId) {
        let key = candidate_key(&self.index, id);
        self.candidates.remove(&key);
    }

    fn worse_than_tip(&self, id: BlockId) -> bool {
        match self.active.tip() {
            Some(tip) => candidate_key(&self.index, id) < candidate_key(&self.index, tip),
            None => false,
        }
    }

    /// Drop candidates that are worse than the current tip
    fn prune_block_index_candidates(&mut self) {
        if let Some(tip) = self.active.tip() {
            let tip_key = candidate_key(&self.index, tip);
            self.candidates = self.candidates.split_off(&tip_key);
        }
    }

    fn invalid_chain_found(&mut self, id: BlockId) {
        let work = self.index.get(id).chain_work;
        if self.best_invalid.map_or(true, |best| work > self.index.get(best).chain_work) {
            self.best_invalid = Some(id);
        }
        let entry = self.index.get(id);
        tracing::warn!(
            target: "chain",
            invalid = %hash_to_hex(&entry.hash),
            height = entry.height,
            log2_work = log2_work(entry.chain_work),
            "invalid chain found"
        );
        if let Some(tip) = self.active.tip() {
            let tip_entry = self.index.get(tip);
            tracing::warn!(
                target: "chain",
                best = %hash_to_hex(&tip_entry.hash),
                height = tip_entry.height,
                log2_work = log2_work(tip_entry.chain_work),
                "current best chain"
            );
        }
    }

    /// Every block descending from `id` becomes failed-child and leaves
    /// the candidate set
    fn mark_descendants_failed(&mut self, id: BlockId) {
        let height = self.index.get(id).height;
        let descendants: Vec<BlockId> = self
            .index
            .ids()
            .filter(|&other| self.index.get(other).height > height && self.index.is_ancestor(id, other))
            .collect();
        for other in descendants {
            self.remove_candidate(other);
            self.index.get_mut(other).status |= status::FAILED_CHILD;
            self.mark_dirty(other);
        }
    }

    fn invalid_block_found(&mut self, id: BlockId, rejection: &Rejection) {
        if rejection.corruption_possible {
            return;
        }
        self.remove_candidate(id);
        self.index.get_mut(id).status |= status::FAILED_VALID;
        self.mark_dirty(id);
        self.mark_descendants_failed(id);
        self.invalid_chain_found(id);
    }

    /// ReceivedBlockTransactions: record that `block`'s data is stored at
    /// `pos` and link it, and any waiting descendants, into the candidates
    fn received_block_transactions(&mut self, block: &Block, id: BlockId, pos: DiskPos) {
        let entry = self.index.get_mut(id);
        entry.tx_count = block.transactions.len() as u32;
        entry.chain_tx = 0;
        entry.file = pos.file;
        entry.data_pos = pos.pos;
        entry.undo_pos = 0;
        entry.status |= status::HAVE_DATA;
        entry.raise_validity(status::VALID_TRANSACTIONS);
        let prev = entry.prev;
        self.mark_dirty(id);

        let linked = prev.map_or(true, |p| self.index.get(p).chain_tx > 0);
        if linked {
            let mut queue = VecDeque::from([id]);
            while let Some(current) = queue.pop_front() {
                let prev_chain_tx = self.index.get(current).prev.map_or(0, |p| self.index.get(p).chain_tx);
                let sequence_id = self.next_sequence_id;
                self.next_sequence_id += 1;
                let entry = self.index.get_mut(current);
                entry.chain_tx = prev_chain_tx + entry.tx_count as u64;
                entry.sequence_id = sequence_id;
                if !self.worse_than_tip(current) {
                    let key = candidate_key(&self.index, current);
                    self.candidates.insert(key);
                }
                if let Some(children) = self.unlinked.remove(&current) {
                    queue.extend(children);
                }
            }
        } else if let Some(p) = prev {
            if self.index.get(p).is_valid(status::VALID_TREE) {
                self.unlinked.entry(p).or_default().push(id);
            }
        }
    }

    /// FindMostWorkChain: best candidate whose path to the active chain is
    /// fully stored and not failed
    ///
    /// Candidates with a failed ancestor are marked failed-child; those
    /// with a missing ancestor are parked as unlinked. Both leave the set.
    fn find_most_work_chain(&mut self) -> Option<BlockId> {
        loop {
            let &(_, _, Reverse(candidate)) = self.candidates.iter().next_back()?;

            let mut walk = Some(candidate);
            let mut broken = None;
            while let Some(test) = walk {
                if self.active.contains(test) {
                    break;
                }
                let entry = self.index.get(test);
                let failed = entry.status & status::FAILED_MASK != 0;
                if failed || !entry.have_data() {
                    broken = Some((test, failed));
                    break;
                }
                walk = entry.prev;
            }

            let Some((test, failed)) = broken else {
                return Some(candidate);
            };
            let mut fail = candidate;
            while fail != test {
                self.remove_candidate(fail);
                let prev = self.index.get(fail).prev;
                if failed {
                    self.index.get_mut(fail).status |= status::FAILED_CHILD;
                    self.mark_dirty(fail);
                } else if let Some(p) = prev {
                    self.unlinked.entry(p).or_default().push(fail);
                }
                match prev {
                    Some(p) => fail = p,
                    None => break,
                }
            }
            self.remove_candidate(test);
        }
    }
}

/// Everything behind the mempool lock
pub struct MempoolState {
    pub pool: TxMempool,
    pub orphans: OrphanPool,
    pub limiter: RelayLimiter,
}

/// Owner of the validated chain and the transaction pool
pub struct ChainstateManager<S: KeyValueStore> {
    params: ChainParams,
    config: ValidationConfig,
    clock: Arc<dyn Clock>,
    verifier: Arc<dyn ScriptVerifier>,
    service: Option<Arc<dyn ServiceTransactionProvider>>,
    signals: ValidationSignals,
    chain: Mutex<ChainState<S>>,
    mempool: Mutex<MempoolState>,
    files: Mutex<BlockFiles>,
    workers: Option<rayon::ThreadPool>,
    shutdown: AtomicBool,
    warnings: Mutex<String>,
}

impl<S: KeyValueStore + 'static> ChainstateManager<S> {
    pub fn new(
        params: ChainParams,
        config: ValidationConfig,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        verifier: Arc<dyn ScriptVerifier>,
    ) -> Result<Self> {
        config.validate()?;
        let files = BlockFiles::new(config.blocks_dir(), params.magic, config.min_disk_space)?;
        let workers = if config.script_check_threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.script_check_threads)
                .thread_name(|i| format!("scriptcheck-{}", i))
                .build()
                .map_err(|e| ConsensusError::Config(format!("script check pool: {}", e)))?;
            Some(pool)
        } else {
            None
        };
        let min_relay_fee = FeeRate::new(config.min_relay_tx_fee);
        let mempool = MempoolState {
            pool: TxMempool::new(min_relay_fee),
            orphans: OrphanPool::new(),
            limiter: RelayLimiter::new(&config, clock.now()),
        };
        Ok(Self {
            params,
            config,
            clock,
            verifier,
            service: None,
            signals: ValidationSignals::new(),
            chain: Mutex::new(ChainState::new(store)),
            mempool: Mutex::new(mempool),
            files: Mutex::new(files),
            workers,
            shutdown: AtomicBool::new(false),
            warnings: Mutex::new(String::new()),
        })
    }

    /// Resolve service transaction references through `provider`
    pub fn with_service_provider(mut self, provider: Arc<dyn ServiceTransactionProvider>) -> Self {
        self.service = Some(provider);
        self
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn signals(&self) -> &ValidationSignals {
        &self.signals
    }

    pub fn with_chain<R>(&self, f: impl FnOnce(&ChainState<S>) -> R) -> R {
        let chain = self.chain.lock();
        f(&chain)
    }

    pub fn with_mempool<R>(&self, f: impl FnOnce(&MempoolState) -> R) -> R {
        let mempool = self.mempool.lock();
        f(&mempool)
    }

    pub fn tip_hash(&self) -> Option<Hash> {
        let chain = self.chain.lock();
        chain.active.tip().map(|tip| chain.index.get(tip).hash)
    }

    /// Height of the tip, -1 before genesis is connected
    pub fn height(&self) -> i32 {
        self.chain.lock().active.height()
    }

    pub fn block_status(&self, hash: &Hash) -> Option<u32> {
        let chain = self.chain.lock();
        chain.index.lookup(hash).map(|id| chain.index.get(id).status)
    }

    /// Unspent coin as seen by the chain tip
    pub fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.chain.lock().coins_tip.access_coin(outpoint)
    }

    pub fn mempool_contains(&self, txid: &Hash) -> bool {
        self.mempool.lock().pool.exists(txid)
    }

    pub fn locator(&self) -> Vec<Hash> {
        let chain = self.chain.lock();
        chain.active.locator(&chain.index, None)
    }

    pub fn warnings(&self) -> String {
        self.warnings.lock().clone()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// AbortNode: log, record the warning, request shutdown
    pub fn abort_node(&self, message: &str) -> ConsensusError {
        tracing::error!(target: "validation", "*** {}", message);
        *self.warnings.lock() = message.to_string();
        self.shutdown.store(true, Ordering::SeqCst);
        ConsensusError::Fatal(message.to_string())
    }

    fn abort_io(&self, message: String) -> Rejection {
        self.abort_node(&message);
        Rejection::io(message)
    }

    /// LoadBlockIndex: restore the index, file bookkeeping and tip from
    /// the database, storing and connecting genesis on a fresh node
    pub fn load_block_index(&self) -> Result<()> {
        let mut guard = self.chain.lock();
        let chain = &mut *guard;

        let entries = chain.block_tree.load_entries()?;
        for (entry, prev_hash) in entries {
            chain.index.insert_loaded(entry, &prev_hash);
        }
        let mut ids: Vec<BlockId> = chain.index.ids().collect();
        ids.sort_by_key(|id| chain.index.get(*id).height);
        for id in ids {
            let entry = chain.index.get(id);
            let (prev, tx_count) = (entry.prev, entry.tx_count as u64);
            let chain_tx = match prev {
                _ if tx_count == 0 => 0,
                None => tx_count,
                Some(p) => {
                    let prev_chain_tx = chain.index.get(p).chain_tx;
                    if prev_chain_tx > 0 {
                        prev_chain_tx + tx_count
                    } else {
                        chain.unlinked.entry(p).or_default().push(id);
                        0
                    }
                }
            };
            chain.index.get_mut(id).chain_tx = chain_tx;

            let entry = chain.index.get(id);
            if entry.is_valid(status::VALID_TRANSACTIONS) && (chain_tx > 0 || prev.is_none()) {
                let key = candidate_key(&chain.index, id);
                chain.candidates.insert(key);
            }
            let work = entry.chain_work;
            if entry.status & status::FAILED_MASK != 0
                && chain.best_invalid.map_or(true, |b| work > chain.index.get(b).chain_work)
            {
                chain.best_invalid = Some(id);
            }
            if entry.is_valid(status::VALID_TREE)
                && chain.best_header.map_or(true, |b| work > chain.index.get(b).chain_work)
            {
                chain.best_header = Some(id);
            }
        }

        let last_file = chain.block_tree.read_last_block_file()?.unwrap_or(0);
        let mut infos = Vec::with_capacity(last_file as usize + 1);
        for file in 0..=last_file {
            infos.push(chain.block_tree.read_block_file_info(file)?.unwrap_or_default());
        }
        self.files.lock().load(infos, last_file);

        let best = chain.coins_tip.best_block();
        if best != [0; 32] {
            let tip = chain.index.lookup(&best).ok_or_else(|| {
                ConsensusError::Corrupt(format!("coin database best block {} not in block index", hash_to_hex(&best)))
            })?;
            chain.active.set_tip(&chain.index, Some(tip));
            chain.prune_block_index_candidates();
        }
        tracing::info!(
            target: "chain",
            entries = chain.index.len(),
            height = chain.active.height(),
            last_file,
            "loaded block index"
        );

        let genesis_hash = self.params.genesis_hash();
        if chain.index.lookup(&genesis_hash).is_none() {
            let genesis = self.params.genesis.clone();
            let id = chain.index.insert_header(&genesis.header, false);
            chain.mark_dirty(id);
            chain.best_header = Some(id);
            let mut files = self.files.lock();
            let pos = files
                .write_block(&genesis, 0)
                .map_err(|e| self.abort_node(&format!("Failed to write genesis block: {}", e)))?;
            chain.received_block_transactions(&genesis, id, pos);
            self.flush_locked(chain, &mut files, FlushMode::Always)?;
            tracing::info!(target: "chain", genesis = %hash_to_hex(&genesis_hash), "initialized block index");
        }

        self.activate_best_chain_locked(chain, None)?;
        Ok(())
    }

    /// AcceptBlockHeader: index `header` after its context checks
    pub fn accept_block_header(&self, header: &BlockHeader, proof_of_stake: bool) -> ValidationResult<BlockId> {
        let mut chain = self.chain.lock();
        self.accept_header_locked(&mut chain, header, proof_of_stake)
    }

    fn accept_header_locked(
        &self,
        chain: &mut ChainState<S>,
        header: &BlockHeader,
        proof_of_stake: bool,
    ) -> ValidationResult<BlockId> {
        let hash = header.hash();
        if let Some(id) = chain.index.lookup(&hash) {
            if chain.index.get(id).status & status::FAILED_MASK != 0 {
                return Err(Rejection::invalid(reject::DUPLICATE, "duplicate").with_debug("block is marked invalid"));
            }
            return Ok(id);
        }

        if hash != self.params.genesis_hash() {
            if !proof_of_stake && !check_proof_of_work(&hash, header.bits, &self.params.pow_limit()) {
                return Err(Rejection::dos(50, reject::INVALID, "high-hash").with_debug("proof of work failed"));
            }
            let prev = chain
                .index
                .lookup(&header.prev_block_hash)
                .ok_or_else(|| Rejection::dos(10, 0, "bad-prevblk").with_debug("prev block not found"))?;
            if chain.index.get(prev).status & status::FAILED_MASK != 0 {
                return Err(Rejection::dos(100, reject::INVALID, "bad-prevblk").with_debug("prev block invalid"));
            }
            check_index_against_checkpoint(&chain.index, prev, &self.params, self.config.checkpoints_enabled)?;
            contextual_check_block_header(header, proof_of_stake, &chain.index, prev, &self.params, self.clock.now())?;
        }

        let id = chain.index.insert_header(header, proof_of_stake);
        chain.mark_dirty(id);
        let work = chain.index.get(id).chain_work;
        if chain.best_header.map_or(true, |b| work > chain.index.get(b).chain_work) {
            chain.best_header = Some(id);
        }
        Ok(id)
    }

    /// AcceptBlock: index the header, check the block in context and store
    /// it. Unrequested blocks are stored only when they add work and are not
    /// too far ahead of the tip.
    fn accept_block(&self, chain: &mut ChainState<S>, block: &Block, requested: bool) -> ValidationResult<()> {
        let id = self.accept_header_locked(chain, &block.header, block.is_proof_of_stake())?;
        let entry = chain.index.get(id);
        if entry.have_data() {
            return Ok(());
        }
        let (height, prev, work) = (entry.height, entry.prev, entry.chain_work);
        let has_more_work = chain.active.tip().map_or(true, |tip| work > chain.index.get(tip).chain_work);
        let too_far_ahead = height > chain.active.height() + MIN_BLOCKS_TO_KEEP;
        if !requested && (!has_more_work || too_far_ahead) {
            tracing::debug!(target: "validation", block = %hash_to_hex(&entry.hash), "not storing unrequested block");
            return Ok(());
        }

        let ctx = BlockCheckContext { params: &self.params, service: self.service.as_deref() };
        let checked = check_block(block, &ctx, &mut chain.checked, true, true)
            .and_then(|_| contextual_check_block(block, &chain.index, prev, &self.params));
        if let Err(rejection) = checked {
            if rejection.is_invalid() && !rejection.corruption_possible {
                chain.index.get_mut(id).status |= status::FAILED_VALID;
                chain.mark_dirty(id);
            }
            return Err(rejection);
        }

        let pos = self
            .files
            .lock()
            .write_block(block, height as u32)
            .map_err(|e| self.abort_io(format!("Failed to write block: {}", e)))?;
        chain.received_block_transactions(block, id, pos);
        Ok(())
    }

    /// ProcessNewBlock: check, store and try to make `block` part of the
    /// best chain
    ///
    /// Fails when the block is rejected on its own or when connecting it
    /// showed it invalid; in the latter case the chain has already moved
    /// to the best remaining candidate.
    pub fn process_new_block(&self, block: &Block, force_processing: bool) -> ValidationResult<()> {
        let mut guard = self.chain.lock();
        let chain = &mut *guard;
        let ctx = BlockCheckContext { params: &self.params, service: self.service.as_deref() };
        if let Err(rejection) = check_block(block, &ctx, &mut chain.checked, true, true) {
            tracing::debug!(target: "validation", reason = %rejection.message(), "check_block failed");
            return Err(rejection);
        }
        self.accept_block(chain, block, force_processing)?;
        self.activate_best_chain_locked(chain, Some(block))
    }

    /// ActivateBestChain: move the tip to the most-work valid candidate
    pub fn activate_best_chain(&self) -> ValidationResult<()> {
        let mut chain = self.chain.lock();
        self.activate_best_chain_locked(&mut chain, None)
    }

    fn activate_best_chain_locked(&self, chain: &mut ChainState<S>, block: Option<&Block>) -> ValidationResult<()> {
        let mut mempool = self.mempool.lock();
        let mut files = self.files.lock();
        let block_hash = block.map(Block::hash);
        let mut block_rejection = None;

        loop {
            if self.shutdown_requested() {
                break;
            }
            let Some(most_work) = chain.find_most_work_chain() else {
                break;
            };
            if chain.active.tip() == Some(most_work) {
                break;
            }
            if let Some((failed, rejection)) =
                self.activate_best_chain_step(chain, &mut mempool, &mut files, most_work, block)?
            {
                if Some(chain.index.get(failed).hash) == block_hash {
                    block_rejection = Some(rejection);
                }
            }
        }

        self.flush_locked(chain, &mut files, FlushMode::Periodic)
            .map_err(|e| Rejection::io(e.to_string()))?;
        match block_rejection {
            Some(rejection) => Err(rejection),
            None => Ok(()),
        }
    }

    /// One step towards `most_work`: disconnect to the fork, then connect
    /// forward in batches of up to 32 blocks. Returns early once the tip
    /// has more work than before, or with the block that failed to connect.
    fn activate_best_chain_step(
        &self,
        chain: &mut ChainState<S>,
        mempool: &mut MempoolState,
        files: &mut BlockFiles,
        most_work: BlockId,
        block: Option<&Block>,
    ) -> ValidationResult<Option<(BlockId, Rejection)>> {
        let old_tip = chain.active.tip();
        let fork = chain.active.find_fork(&chain.index, most_work);

        let mut disconnected = false;
        while chain.active.tip().is_some() && chain.active.tip() != fork {
            self.disconnect_tip(chain, mempool, files)?;
            disconnected = true;
        }

        let target_height = chain.index.get(most_work).height;
        let mut height = fork.map_or(-1, |f| chain.index.get(f).height);
        let mut failed = None;
        'outer: while height != target_height {
            let batch_top = (height + 32).min(target_height);
            let mut to_connect = Vec::new();
            let mut walk = chain.index.ancestor(most_work, batch_top);
            while let Some(id) = walk {
                if chain.index.get(id).height <= height {
                    break;
                }
                to_connect.push(id);
                walk = chain.index.get(id).prev;
            }
            to_connect.reverse();
            height = batch_top;

            for id in to_connect {
                let provided = block.filter(|b| b.hash() == chain.index.get(id).hash);
                match self.connect_tip(chain, mempool, files, id, provided) {
                    Ok(()) => {
                        chain.prune_block_index_candidates();
                        let improved = match (old_tip, chain.active.tip()) {
                            (None, _) => true,
                            (Some(old), Some(tip)) => {
                                chain.index.get(tip).chain_work > chain.index.get(old).chain_work
                            }
                            (Some(_), None) => false,
                        };
                        if improved {
                            break 'outer;
                        }
                    }
                    Err(rejection) if rejection.is_invalid() && !rejection.corruption_possible => {
                        chain.invalid_chain_found(most_work);
                        failed = Some((id, rejection));
                        break 'outer;
                    }
                    Err(rejection) => return Err(rejection),
                }
            }
        }

        if disconnected {
            self.remove_for_reorg(chain, mempool);
            self.limit_mempool(chain, mempool);
        }
        Ok(failed)
    }

    /// ConnectTip: connect the block `id` on top of the active chain
    fn connect_tip(
        &self,
        chain: &mut ChainState<S>,
        mempool: &mut MempoolState,
        files: &mut BlockFiles,
        id: BlockId,
        block: Option<&Block>,
    ) -> ValidationResult<()> {
        let entry = chain.index.get(id);
        let read;
        let block = match block {
            Some(block) => block,
            None => {
                let pos = DiskPos { file: entry.file, pos: entry.data_pos };
                read = files
                    .read_block(pos, &entry.hash)
                    .map_err(|e| self.abort_io(format!("Failed to read block: {}", e)))?;
                &read
            }
        };

        let ctx = ConnectContext {
            params: &self.params,
            verifier: self.verifier.as_ref(),
            workers: self.workers.as_ref(),
        };
        let mut view = CoinsViewCache::new(&mut chain.coins_tip);
        let undo = match connect_block(block, id, &mut chain.index, &mut view, &ctx) {
            Ok(undo) => undo,
            Err(rejection) => {
                drop(view);
                if rejection.is_invalid() {
                    chain.invalid_block_found(id, &rejection);
                }
                tracing::error!(
                    target: "validation",
                    block = %hash_to_hex(&block.hash()),
                    reason = %rejection.message(),
                    "connect_tip failed"
                );
                return Err(rejection);
            }
        };
        view.flush().map_err(|e| self.abort_io(format!("Failed to update coin view: {}", e)))?;

        let entry = chain.index.get(id);
        if let Some(prev) = entry.prev {
            if entry.status & status::HAVE_UNDO == 0 {
                let prev_hash = chain.index.get(prev).hash;
                let pos = files
                    .write_undo(&undo, entry.file, &prev_hash)
                    .map_err(|e| self.abort_io(format!("Failed to write undo data: {}", e)))?;
                let entry = chain.index.get_mut(id);
                entry.undo_pos = pos.pos;
                entry.status |= status::HAVE_UNDO;
            }
        }
        chain.index.get_mut(id).raise_validity(status::VALID_SCRIPTS);
        chain.mark_dirty(id);

        self.flush_locked(chain, files, FlushMode::IfNeeded)
            .map_err(|e| Rejection::io(e.to_string()))?;

        let mut conflicted = Vec::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            for input in &tx.inputs {
                if let Some(spender) = mempool.pool.spender(&input.prevout).filter(|s| *s != txid) {
                    if let Some(entry) = mempool.pool.get(&spender) {
                        conflicted.push(Arc::clone(&entry.tx));
                    }
                }
            }
        }
        mempool.pool.remove_for_block(&block.transactions, self.clock.now());
        mempool.orphans.erase_for_block(block);

        chain.active.set_tip(&chain.index, Some(id));
        let entry = chain.index.get(id);
        tracing::info!(
            target: "chain",
            best = %hash_to_hex(&entry.hash),
            height = entry.height,
            log2_work = log2_work(entry.chain_work),
            tx = entry.chain_tx,
            cache_mib = chain.coins_tip.dynamic_memory_usage() as f64 / (1 << 20) as f64,
            "update tip"
        );
        self.signals.block_connected(block, id, &conflicted);
        Ok(())
    }

    /// DisconnectTip: undo the tip block and offer its transactions back to
    /// the pool
    fn disconnect_tip(
        &self,
        chain: &mut ChainState<S>,
        mempool: &mut MempoolState,
        files: &mut BlockFiles,
    ) -> ValidationResult<()> {
        let tip = chain.active.tip().ok_or_else(|| Rejection::internal("disconnect_tip: no tip"))?;
        let entry = chain.index.get(tip);
        let prev = entry
            .prev
            .ok_or_else(|| Rejection::internal("disconnect_tip: cannot disconnect genesis"))?;
        let hash = entry.hash;
        let data_pos = DiskPos { file: entry.file, pos: entry.data_pos };
        let undo_pos = DiskPos { file: entry.file, pos: entry.undo_pos };
        let prev_hash = chain.index.get(prev).hash;

        let block = files
            .read_block(data_pos, &hash)
            .map_err(|e| self.abort_io(format!("Failed to read block: {}", e)))?;
        let undo = files
            .read_undo(undo_pos, &prev_hash)
            .map_err(|e| self.abort_io(format!("Failed to read undo data: {}", e)))?;

        {
            let mut view = CoinsViewCache::new(&mut chain.coins_tip);
            if disconnect_block(&block, &chain.index, tip, &undo, &mut view) == DisconnectResult::Failed {
                return Err(Rejection::internal(format!("disconnect_block {} failed", hash_to_hex(&hash))));
            }
            view.flush().map_err(|e| self.abort_io(format!("Failed to update coin view: {}", e)))?;
        }
        self.flush_locked(chain, files, FlushMode::IfNeeded)
            .map_err(|e| Rejection::io(e.to_string()))?;

        chain.active.set_tip(&chain.index, Some(prev));
        let options = AdmissionOptions { limit_free: false, override_size_limit: true, reject_absurd_fee: false };
        for tx in &block.transactions {
            if tx.is_coinbase() || tx.is_coinstake() {
                continue;
            }
            let tx = Arc::new(tx.clone());
            if !self.admit(chain, mempool, Arc::clone(&tx), options).accepted {
                mempool.pool.remove_recursive(&tx, RemovalReason::Reorg);
            }
        }
        tracing::info!(
            target: "chain",
            disconnected = %hash_to_hex(&hash),
            height = chain.active.height(),
            "disconnected tip"
        );
        self.signals.block_disconnected(&block);
        Ok(())
    }

    /// Drop pool entries that are no longer final, no longer satisfy their
    /// sequence locks, or spend a coinbase that is now immature
    fn remove_for_reorg(&self, chain: &ChainState<S>, mempool: &mut MempoolState) {
        let Some(tip) = chain.active.tip() else {
            return;
        };
        let tip_height = chain.index.get(tip).height;
        let now = self.clock.now();
        let (index, active, coins) = (&chain.index, &chain.active, &chain.coins_tip);
        mempool.pool.remove_for_reorg(|pool, entry| {
            let tx = &entry.tx;
            let mut lock_points = entry.lock_points;
            let valid_lock_points = test_lock_point_validity(&lock_points, active);
            let view = CoinsViewMempool::new(coins, pool);
            if !check_final_tx(index, active, tx, STANDARD_LOCKTIME_VERIFY_FLAGS, now)
                || !check_sequence_locks(
                    index,
                    active,
                    &view,
                    tx,
                    STANDARD_LOCKTIME_VERIFY_FLAGS,
                    &mut lock_points,
                    valid_lock_points,
                )
            {
                return true;
            }
            if entry.spends_coinbase {
                for input in &tx.inputs {
                    if pool.exists(&input.prevout.hash) {
                        continue;
                    }
                    match coins.access_coin(&input.prevout) {
                        None => return true,
                        Some(coin)
                            if coin.is_coinbase
                                && tip_height > MATURITY_ENFORCEMENT_HEIGHT
                                && tip_height + 1 - (coin.height as i32) < COINBASE_MATURITY =>
                        {
                            return true
                        }
                        Some(_) => {}
                    }
                }
            }
            false
        });
    }

    /// Expire old entries and trim the pool to its byte ceiling
    fn limit_mempool(&self, chain: &mut ChainState<S>, mempool: &mut MempoolState) {
        let expired = mempool.pool.expire(self.clock.now() - self.config.mempool_expiry_seconds());
        if expired > 0 {
            tracing::debug!(target: "mempool", expired, "expired transactions from the memory pool");
        }
        for outpoint in mempool.pool.trim_to_size(self.config.max_mempool_bytes()) {
            chain.coins_tip.uncache(&outpoint);
        }
    }

    pub fn limit_mempool_size(&self) {
        let mut chain = self.chain.lock();
        let mut mempool = self.mempool.lock();
        self.limit_mempool(&mut chain, &mut mempool);
    }

    fn admit(
        &self,
        chain: &mut ChainState<S>,
        mempool: &mut MempoolState,
        tx: Arc<Transaction>,
        options: AdmissionOptions,
    ) -> AdmissionOutcome {
        let mut ctx = AdmissionContext {
            coins_tip: &mut chain.coins_tip,
            index: &chain.index,
            active: &chain.active,
            pool: &mut mempool.pool,
            limiter: &mut mempool.limiter,
            config: &self.config,
            verifier: self.verifier.as_ref(),
            now: self.clock.now(),
        };
        let outcome = accept_to_memory_pool(&mut ctx, Arc::clone(&tx), options);
        if outcome.accepted {
            self.signals.transaction_admitted(&tx);
        }
        outcome
    }

    /// AcceptToMemoryPool with the chain and mempool locks taken
    pub fn accept_to_memory_pool(&self, tx: Transaction, options: AdmissionOptions) -> AdmissionOutcome {
        let mut chain = self.chain.lock();
        let mut mempool = self.mempool.lock();
        self.admit(&mut chain, &mut mempool, Arc::new(tx), options)
    }

    /// Admit a relayed transaction, then any orphans it unblocks
    ///
    /// A transaction with unknown inputs is kept as an orphan of
    /// `from_peer`. Orphans that become admissible are admitted in turn;
    /// those rejected outright are dropped.
    pub fn process_transaction(&self, tx: Transaction, from_peer: u64) -> AdmissionOutcome {
        let tx = Arc::new(tx);
        let mut guard = self.chain.lock();
        let chain = &mut *guard;
        let mut mempool = self.mempool.lock();
        let options = AdmissionOptions::default();
        let now = self.clock.now();

        let outcome = self.admit(chain, &mut mempool, Arc::clone(&tx), options);
        if outcome.accepted {
            let mut work = VecDeque::from([Arc::clone(&tx)]);
            while let Some(parent) = work.pop_front() {
                for child in mempool.orphans.children_of(&parent.txid(), parent.outputs.len()) {
                    let Some(orphan) = mempool.orphans.get(&child).map(|o| Arc::clone(&o.tx)) else {
                        continue;
                    };
                    let child_outcome = self.admit(chain, &mut mempool, Arc::clone(&orphan), options);
                    if child_outcome.accepted {
                        tracing::debug!(target: "mempool", txid = %hash_to_hex(&child), "accepted orphan tx");
                        mempool.orphans.erase(&child);
                        work.push_back(orphan);
                    } else if !child_outcome.missing_inputs {
                        tracing::debug!(target: "mempool", txid = %hash_to_hex(&child), "removed invalid orphan tx");
                        mempool.orphans.erase(&child);
                    }
                }
            }
        } else if outcome.missing_inputs {
            mempool.orphans.add(Arc::clone(&tx), from_peer, now);
            let evicted = mempool
                .orphans
                .limit(self.config.max_orphan_transactions, now, &mut rand::thread_rng());
            if evicted > 0 {
                tracing::debug!(target: "mempool", evicted, "mapOrphan overflow");
            }
        }
        outcome
    }

    /// Adjust the priority and fee `txid` is judged by in the pool
    pub fn prioritise_transaction(&self, txid: &Hash, priority_delta: f64, fee_delta: Amount) {
        self.mempool.lock().pool.prioritise_transaction(txid, priority_delta, fee_delta);
    }

    /// `tx` is final in the next block
    pub fn check_final_tx(&self, tx: &Transaction, flags: u32) -> bool {
        let chain = self.chain.lock();
        check_final_tx(&chain.index, &chain.active, tx, flags, self.clock.now())
    }

    /// `tx` satisfies its sequence locks in the next block, counting pool
    /// outputs as confirmed there
    pub fn check_sequence_locks(&self, tx: &Transaction, flags: u32) -> bool {
        let chain = self.chain.lock();
        let mempool = self.mempool.lock();
        let view = CoinsViewMempool::new(&chain.coins_tip, &mempool.pool);
        let mut lock_points = LockPoints::default();
        check_sequence_locks(&chain.index, &chain.active, &view, tx, flags, &mut lock_points, false)
    }

    /// InvalidateBlock: mark `hash` failed, rewind the active chain below
    /// it, then activate the best remaining chain
    pub fn invalidate_block(&self, hash: &Hash) -> Result<()> {
        let mut guard = self.chain.lock();
        let chain = &mut *guard;
        let id = chain
            .index
            .lookup(hash)
            .ok_or_else(|| ConsensusError::UnknownBlock(hash_to_hex(hash)))?;

        chain.index.get_mut(id).status |= status::FAILED_VALID;
        chain.mark_dirty(id);
        chain.remove_candidate(id);
        chain.mark_descendants_failed(id);

        {
            let mut mempool = self.mempool.lock();
            let mut files = self.files.lock();
            while chain.active.contains(id) {
                let Some(tip) = chain.active.tip() else {
                    break;
                };
                chain.remove_candidate(tip);
                chain.index.get_mut(tip).status |= status::FAILED_CHILD;
                chain.mark_dirty(tip);
                self.disconnect_tip(chain, &mut mempool, &mut files)?;
            }
            self.limit_mempool(chain, &mut mempool);

            let ids: Vec<BlockId> = chain.index.ids().collect();
            for other in ids {
                let entry = chain.index.get(other);
                if entry.is_valid(status::VALID_TRANSACTIONS) && entry.chain_tx > 0 && !chain.worse_than_tip(other) {
                    let key = candidate_key(&chain.index, other);
                    chain.candidates.insert(key);
                }
            }
            chain.invalid_chain_found(id);
            self.remove_for_reorg(chain, &mut mempool);
        }

        self.activate_best_chain_locked(chain, None)?;
        Ok(())
    }

    /// ReconsiderBlock: clear failure marks from `hash`, its descendants and
    /// its ancestors, then activate the best chain
    pub fn reconsider_block(&self, hash: &Hash) -> Result<()> {
        let mut guard = self.chain.lock();
        let chain = &mut *guard;
        let id = chain
            .index
            .lookup(hash)
            .ok_or_else(|| ConsensusError::UnknownBlock(hash_to_hex(hash)))?;

        let ids: Vec<BlockId> = chain.index.ids().collect();
        for other in ids {
            if chain.index.get(other).status & status::FAILED_MASK == 0 {
                continue;
            }
            if !chain.index.is_ancestor(id, other) {
                continue;
            }
            chain.index.get_mut(other).status &= !status::FAILED_MASK;
            chain.mark_dirty(other);
            let entry = chain.index.get(other);
            let above_tip = match chain.active.tip() {
                Some(tip) => candidate_key(&chain.index, tip) < candidate_key(&chain.index, other),
                None => true,
            };
            if entry.is_valid(status::VALID_TRANSACTIONS) && entry.chain_tx > 0 && above_tip {
                let key = candidate_key(&chain.index, other);
                chain.candidates.insert(key);
            }
            if chain.best_invalid == Some(other) {
                chain.best_invalid = None;
            }
        }

        let mut walk = chain.index.get(id).prev;
        while let Some(current) = walk {
            if chain.index.get(current).status & status::FAILED_MASK != 0 {
                chain.index.get_mut(current).status &= !status::FAILED_MASK;
                chain.mark_dirty(current);
            }
            walk = chain.index.get(current).prev;
        }

        self.activate_best_chain_locked(chain, None)?;
        Ok(())
    }

    /// FlushStateToDisk with the chain and file locks taken
    pub fn flush_state_to_disk(&self, mode: FlushMode) -> Result<()> {
        let mut chain = self.chain.lock();
        let mut files = self.files.lock();
        self.flush_locked(&mut chain, &mut files, mode)
    }

    /// FlushStateToDisk: sync block files and write the dirty index when a
    /// write is due, flush the coin cache on a full flush, and announce the
    /// best chain on a full flush or hourly
    fn flush_locked(&self, chain: &mut ChainState<S>, files: &mut BlockFiles, mode: FlushMode) -> Result<()> {
        let now = self.clock.now_micros();
        let cache_usage = chain.coins_tip.dynamic_memory_usage();
        let decision = chain.flush_timer.decide(mode, now, cache_usage, self.config.coin_cache_bytes);

        if decision.write {
            if !files.check_disk_space(0) {
                return Err(self.abort_node("Disk space is low!"));
            }
            files
                .flush(false)
                .map_err(|e| self.abort_node(&format!("Failed to flush block files: {}", e)))?;
            let infos = files.dirty_infos();
            let entries: Vec<(&BlockIndexEntry, Hash)> = chain
                .dirty_index
                .iter()
                .map(|id| (chain.index.get(*id), chain.index.prev_hash(*id)))
                .collect();
            chain
                .block_tree
                .write_batch_sync(&infos, files.last_file(), &entries)
                .map_err(|e| self.abort_node(&format!("Failed to write to block index database: {}", e)))?;
            tracing::debug!(target: "flush", files = infos.len(), entries = entries.len(), "wrote block index");
            files.clear_dirty();
            chain.dirty_index.clear();
            chain.flush_timer.last_write = now;
        }

        if decision.full {
            let needed = 128u64 * 2 * 2 * chain.coins_tip.cache_size() as u64;
            if !files.check_disk_space(needed) {
                return Err(self.abort_node("Disk space is low!"));
            }
            let coins = chain.coins_tip.cache_size();
            chain
                .coins_tip
                .flush()
                .map_err(|e| self.abort_node(&format!("Failed to write to coin database: {}", e)))?;
            tracing::debug!(target: "flush", coins, cache_usage, "flushed coin cache");
            chain.flush_timer.last_flush = now;
        }

        if decision.announce {
            let locator = chain.active.locator(&chain.index, None);
            self.signals.best_chain_changed(&locator);
            chain.flush_timer.last_set_chain = now;
        }
        Ok(())
    }
}
