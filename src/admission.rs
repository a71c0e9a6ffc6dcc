//! Mempool admission
//!
//! [`accept_to_memory_pool`] runs a transaction through the ordered policy
//! and consensus gates in front of the pool. Every gate rejects without
//! touching the pool; the only mutation before insertion is coins pulled
//! into the tip cache, which are dropped again on failure.

use crate::block::ScriptCheck;
use crate::chain::{ActiveChain, BlockIndex};
use crate::chainstate::{check_final_tx, check_sequence_locks};
use crate::coins::{CoinsView, CoinsViewCache, CoinsViewMempool, EmptyCoinsView};
use crate::config::ValidationConfig;
use crate::constants::*;
use crate::error::{reject, Rejection, RejectionKind, ValidationResult};
use crate::locktime::LockPoints;
use crate::mempool::{AncestorLimits, MempoolEntry, TxMempool};
use crate::policy::{
    allow_free, are_inputs_standard, is_standard_tx, FeeRate, MANDATORY_SCRIPT_VERIFY_FLAGS,
    STANDARD_NOT_MANDATORY_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS,
};
use crate::script::ScriptVerifier;
use crate::transaction::{check_transaction, check_tx_inputs, legacy_sig_op_count, p2sh_sig_op_count, SpendContext};
use crate::types::*;
use std::sync::Arc;

/// Relay fee controller and free-transaction rate limiter
///
/// The relay floor `fee_cutoff` (base units per byte) follows pool
/// congestion and relaxes with a one day time constant; the free quota
/// `free_limit` (kB per minute) moves the other way. Free transactions are
/// counted in a ten minute exponentially decaying window.
#[derive(Debug, Clone)]
pub struct RelayLimiter {
    fee_cutoff: f64,
    free_limit: f64,
    last_time: i64,
    free_count: f64,
    last_free_time: i64,
    min_relay_fee: FeeRate,
}

impl RelayLimiter {
    pub fn new(config: &ValidationConfig, now: i64) -> Self {
        Self {
            fee_cutoff: config.min_limiter_tx_fee,
            free_limit: config.limit_free_relay,
            last_time: now,
            free_count: 0.0,
            last_free_time: 0,
            min_relay_fee: FeeRate::new(config.min_relay_tx_fee),
        }
    }

    /// Current relay floor
    pub fn min_relay_fee(&self) -> FeeRate {
        self.min_relay_fee
    }

    pub fn fee_cutoff(&self) -> f64 {
        self.fee_cutoff
    }

    pub fn free_limit(&self) -> f64 {
        self.free_limit
    }

    /// Decayed byte count of recently admitted free transactions
    pub fn free_count(&self) -> f64 {
        self.free_count
    }

    /// Recompute the relay floor for a pool holding `pool_bytes`
    ///
    /// Below one block of transactions the floor drifts back to the
    /// configured minimum; between one and three blocks it is pushed up
    /// linearly towards the maximum; beyond that it is pinned there and the
    /// free quota is cut to its minimum.
    pub fn update(&mut self, pool_bytes: u64, now: i64, config: &ValidationConfig) -> FeeRate {
        let init_cutoff = config.min_limiter_tx_fee;
        let max_cutoff = config.max_limiter_tx_fee;
        let limit = config.limit_free_relay;

        let decay = (1.0 - 1.0 / SECONDS_PER_DAY as f64).powf((now - self.last_time) as f64);
        self.last_time = now;
        self.free_limit /= decay;
        self.fee_cutoff *= decay;

        let block = MAX_BLOCK_SIZE as u64;
        if pool_bytes < block {
            self.fee_cutoff = self.fee_cutoff.max(init_cutoff);
            self.free_limit = self.free_limit.min(limit);
        } else if pool_bytes < block * MAX_BLOCK_SIZE_MULTIPLIER {
            let excess = (pool_bytes - block) as f64 / (block * 2) as f64;
            self.fee_cutoff = self.fee_cutoff.max(init_cutoff + (max_cutoff - init_cutoff) * excess);
            self.free_limit = self.free_limit.min(limit - (limit - DEFAULT_MIN_LIMITFREERELAY) * excess);
            if self.free_limit < DEFAULT_MIN_LIMITFREERELAY {
                self.free_limit = DEFAULT_MIN_LIMITFREERELAY;
            }
        } else {
            self.fee_cutoff = max_cutoff;
            self.free_limit = DEFAULT_MIN_LIMITFREERELAY;
        }

        self.min_relay_fee = FeeRate::new((self.fee_cutoff * 1000.0) as Amount);
        tracing::debug!(
            target: "mempool",
            pool_bytes,
            fee_cutoff = self.fee_cutoff,
            free_limit = self.free_limit,
            "relay limiter updated"
        );
        self.min_relay_fee
    }

    /// Account `size` bytes of free relay; false once the quota is used up
    pub fn consume_free(&mut self, size: usize, now: i64) -> bool {
        self.free_count *= (1.0 - 1.0 / 600.0f64).powf((now - self.last_free_time) as f64);
        self.last_free_time = now;
        if self.free_count >= self.free_limit * 10.0 * 1000.0 {
            return false;
        }
        tracing::debug!(target: "mempool", free_count = self.free_count, added = size, "rate limit free relay");
        self.free_count += size as f64;
        true
    }
}

/// How an admission attempt ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionOutcome {
    pub accepted: bool,
    /// Some input is unknown; the transaction may be an orphan
    pub missing_inputs: bool,
    pub rejection: Option<Rejection>,
}

impl AdmissionOutcome {
    fn accepted() -> Self {
        Self { accepted: true, ..Self::default() }
    }

    fn missing_inputs() -> Self {
        Self { missing_inputs: true, ..Self::default() }
    }

    fn rejected(rejection: Rejection) -> Self {
        Self { rejection: Some(rejection), ..Self::default() }
    }
}

/// Caller switches for one admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionOptions {
    /// Rate limit transactions paying less than the relay floor
    pub limit_free: bool,
    /// Skip expiry and trimming after insertion (used when re-adding
    /// transactions of disconnected blocks)
    pub override_size_limit: bool,
    pub reject_absurd_fee: bool,
}

impl Default for AdmissionOptions {
    fn default() -> Self {
        Self { limit_free: true, override_size_limit: false, reject_absurd_fee: false }
    }
}

/// Everything admission reads or updates, borrowed from the chainstate
/// with the chain and mempool locks held
pub struct AdmissionContext<'a, B: CoinsView> {
    pub coins_tip: &'a mut CoinsViewCache<B>,
    pub index: &'a BlockIndex,
    pub active: &'a ActiveChain,
    pub pool: &'a mut TxMempool,
    pub limiter: &'a mut RelayLimiter,
    pub config: &'a ValidationConfig,
    pub verifier: &'a dyn ScriptVerifier,
    /// Network-adjusted time in seconds
    pub now: i64,
}

pub fn ancestor_limits(config: &ValidationConfig) -> AncestorLimits {
    AncestorLimits {
        ancestor_count: config.ancestor_limit,
        ancestor_size: config.ancestor_size_limit_kb * 1000,
        descendant_count: config.descendant_limit,
        descendant_size: config.descendant_size_limit_kb * 1000,
    }
}

/// AcceptToMemoryPool: 𝒯𝒳 × 𝒰𝒮 × 𝒫 → {accepted, missing-inputs, rejected}
///
/// Gates, in order:
/// 1. CheckTransaction
/// 2. No coinbase or coinstake
/// 3. IsStandardTx (when standardness is required)
/// 4. Final at tip+1
/// 5. Not already in the pool, no input spent by a pool transaction
/// 6. All inputs known in tip ∪ pool, otherwise missing-inputs
/// 7. BIP68 sequence locks at tip+1
/// 8. AreInputsStandard
/// 9. Sigop limits
/// 10. Fee floor: rolling pool minimum, then priority; the relay floor is
///     then updated from pool congestion
/// 11. Free relay rate limit
/// 12. Absurd fee (optional)
/// 13. Ancestor and descendant limits
/// 14. Scripts under standard, then mandatory flags
/// 15. Insert, expire, trim; fail if the transaction itself was trimmed
pub fn accept_to_memory_pool<B: CoinsView>(
    ctx: &mut AdmissionContext<'_, B>,
    tx: Arc<Transaction>,
    options: AdmissionOptions,
) -> AdmissionOutcome {
    let mut coins_to_uncache = Vec::new();
    let result = accept_worker(ctx, &tx, options, &mut coins_to_uncache);
    match result {
        Ok(()) => AdmissionOutcome::accepted(),
        Err(rejection) if rejection.kind == RejectionKind::MissingInputs => AdmissionOutcome::missing_inputs(),
        Err(rejection) => {
            for outpoint in &coins_to_uncache {
                ctx.coins_tip.uncache(outpoint);
            }
            tracing::debug!(
                target: "mempool",
                txid = %hash_to_hex(&tx.txid()),
                reason = %rejection.message(),
                "transaction rejected"
            );
            AdmissionOutcome::rejected(rejection)
        }
    }
}

fn accept_worker<B: CoinsView>(
    ctx: &mut AdmissionContext<'_, B>,
    tx: &Arc<Transaction>,
    options: AdmissionOptions,
    coins_to_uncache: &mut Vec<OutPoint>,
) -> ValidationResult<()> {
    let txid = tx.txid();
    let config = ctx.config;

    // 1. Structure
    check_transaction(tx)?;

    // 2. Only in blocks
    if tx.is_coinbase() || tx.is_coinstake() {
        return Err(Rejection::dos(100, reject::INVALID, "coinbase"));
    }

    // 3. Standard form
    if config.require_standard {
        let relay_fee = ctx.limiter.min_relay_fee();
        is_standard_tx(tx, &relay_fee).map_err(|reason| Rejection::policy(reject::NONSTANDARD, reason))?;
    }

    // 4. Final in the next block
    if !check_final_tx(ctx.index, ctx.active, tx, STANDARD_LOCKTIME_VERIFY_FLAGS, ctx.now) {
        return Err(Rejection::policy(reject::NONSTANDARD, "non-final"));
    }

    // 5. Duplicates and conflicts
    if ctx.pool.exists(&txid) {
        return Err(Rejection::policy(reject::ALREADY_KNOWN, "txn-already-in-mempool"));
    }
    if let Some(spender) = tx.inputs.iter().find_map(|input| ctx.pool.spender(&input.prevout)) {
        return Err(Rejection::policy(reject::CONFLICT, "txn-mempool-conflict")
            .with_debug(format!("inputs spent by {}", hash_to_hex(&spender))));
    }

    // 6. Inputs, copied into a detached view so the pool is free to change
    for input in &tx.inputs {
        if !ctx.coins_tip.have_coin_in_cache(&input.prevout) {
            coins_to_uncache.push(input.prevout);
        }
    }
    let mut view = CoinsViewCache::new(EmptyCoinsView);
    {
        let backed = CoinsViewMempool::new(&*ctx.coins_tip, &*ctx.pool);
        for input in &tx.inputs {
            let coin = backed.get_coin(&input.prevout).ok_or_else(Rejection::missing_inputs)?;
            view.add_coin(input.prevout, coin, true);
        }
    }

    // 7. BIP68 at tip+1
    let mut lock_points = LockPoints::default();
    if !check_sequence_locks(ctx.index, ctx.active, &view, tx, STANDARD_LOCKTIME_VERIFY_FLAGS, &mut lock_points, false) {
        return Err(Rejection::policy(reject::NONSTANDARD, "non-BIP68-final"));
    }

    // 8. Standard inputs
    if config.require_standard && !are_inputs_standard(tx, &view) {
        return Err(Rejection::policy(reject::NONSTANDARD, "bad-txns-nonstandard-inputs"));
    }

    let tip_height = ctx.active.height();
    let tip_supply = ctx.active.tip().map(|tip| ctx.index.get(tip).money_supply).unwrap_or(0);
    let sig_op_count = legacy_sig_op_count(tx) + p2sh_sig_op_count(tx, &view);

    let spend_ctx = SpendContext {
        spend_height: tip_height + 1,
        tip_height,
        money_supply: tip_supply,
        stake_min_age: 0,
    };
    let fee = check_tx_inputs(tx, &view, &spend_ctx)?;
    let (_, fee_delta) = ctx.pool.apply_deltas(&txid);
    let modified_fee = fee + fee_delta;

    let (priority, in_chain_input_value) = view.priority(tx, tip_height.max(0) as u32);
    let spends_coinbase = tx
        .inputs
        .iter()
        .any(|input| view.access_coin(&input.prevout).map(|coin| coin.is_coinbase).unwrap_or(false));
    let entry = MempoolEntry::new(
        Arc::clone(tx),
        fee,
        ctx.now,
        priority,
        tip_height.max(0) as u32,
        in_chain_input_value,
        spends_coinbase,
        sig_op_count,
        lock_points,
    );
    let size = entry.size;

    // 9. Sigops
    if sig_op_count > MAX_STANDARD_TX_SIGOPS
        || (config.bytes_per_sigop > 0 && sig_op_count as usize > size / config.bytes_per_sigop as usize)
    {
        return Err(Rejection::policy(reject::NONSTANDARD, "bad-txns-too-many-sigops")
            .with_debug(sig_op_count.to_string()));
    }

    // 10. Fee floor
    let pool_min_fee = ctx.pool.get_min_fee(config.max_mempool_bytes(), ctx.now).get_fee(size);
    if pool_min_fee > 0 && modified_fee < pool_min_fee {
        return Err(Rejection::resource(reject::INSUFFICIENTFEE, "mempool min fee not met")
            .with_debug(format!("{} < {}", modified_fee, pool_min_fee)));
    }
    if config.relay_priority
        && modified_fee < ctx.limiter.min_relay_fee().get_fee(size)
        && !allow_free(entry.priority(tip_height.max(0) as u32 + 1))
    {
        return Err(Rejection::resource(reject::INSUFFICIENTFEE, "insufficient priority"));
    }
    let relay_fee = ctx.limiter.update(ctx.pool.total_tx_size() as u64, ctx.now, config);

    // 11. Free relay
    if options.limit_free && modified_fee < relay_fee.get_fee(size) && !ctx.limiter.consume_free(size, ctx.now) {
        return Err(Rejection::resource(reject::INSUFFICIENTFEE, "rate limited free transaction"));
    }

    // 12. Absurd fee
    if options.reject_absurd_fee {
        let ceiling = match tx.version {
            1 => Some(relay_fee.get_fee(size).saturating_mul(ABSURD_FEE_MULTIPLIER)),
            2 => Some(ABSURD_FEE_V2),
            _ => None,
        };
        if let Some(ceiling) = ceiling.filter(|&ceiling| fee > ceiling) {
            return Err(Rejection::policy(reject::HIGHFEE, "absurdly-high-fee")
                .with_debug(format!("{} > {}", fee, ceiling)));
        }
    }

    // 13. In-pool chain limits
    let ancestors = ctx
        .pool
        .calculate_ancestors(tx, size, &ancestor_limits(config))
        .map_err(|reason| Rejection::policy(reject::NONSTANDARD, "too-long-mempool-chain").with_debug(reason))?;

    // 14. Scripts
    check_input_scripts(tx, &view, STANDARD_SCRIPT_VERIFY_FLAGS, ctx.verifier)?;
    if let Err(rejection) = check_input_scripts(tx, &view, MANDATORY_SCRIPT_VERIFY_FLAGS, ctx.verifier) {
        tracing::error!(
            target: "mempool",
            txid = %hash_to_hex(&txid),
            reason = %rejection.message(),
            "BUG! standard script checks passed but mandatory checks failed"
        );
        return Err(Rejection::internal("mandatory-script-verify-flag-failed after standard pass")
            .with_debug(rejection.reason));
    }

    // 15. Insert and enforce the pool ceiling
    ctx.pool.add_unchecked(entry, &ancestors);
    if !options.override_size_limit {
        let expired = ctx.pool.expire(ctx.now - config.mempool_expiry_seconds());
        if expired > 0 {
            tracing::debug!(target: "mempool", expired, "expired transactions");
        }
        for outpoint in ctx.pool.trim_to_size(config.max_mempool_bytes()) {
            ctx.coins_tip.uncache(&outpoint);
        }
        if !ctx.pool.exists(&txid) {
            return Err(Rejection::resource(reject::INSUFFICIENTFEE, "mempool full"));
        }
    }

    tracing::debug!(
        target: "mempool",
        txid = %hash_to_hex(&txid),
        size,
        fee,
        pool_size = ctx.pool.size(),
        "accepted to mempool"
    );
    Ok(())
}

/// CheckInputs for admission: every input script under `flags`
///
/// A failure that disappears once the policy-only flags are dropped is a
/// non-standard spend and is not scored; anything else is a consensus
/// failure.
pub fn check_input_scripts(
    tx: &Transaction,
    view: &impl CoinsView,
    flags: u32,
    verifier: &dyn ScriptVerifier,
) -> ValidationResult<()> {
    for (input_index, input) in tx.inputs.iter().enumerate() {
        let coin = view
            .get_coin(&input.prevout)
            .ok_or_else(|| Rejection::internal("check_input_scripts: input coin vanished"))?;
        let mut check = ScriptCheck {
            tx,
            input_index,
            script_pubkey: coin.output.script_pubkey,
            amount: coin.output.value,
            flags,
        };
        if let Err(error) = check.run(verifier) {
            if flags & STANDARD_NOT_MANDATORY_VERIFY_FLAGS != 0 {
                check.flags = flags & !STANDARD_NOT_MANDATORY_VERIFY_FLAGS;
                if check.run(verifier).is_ok() {
                    return Err(Rejection::policy(
                        reject::NONSTANDARD,
                        format!("non-mandatory-script-verify-flag ({})", error),
                    ));
                }
            }
            return Err(Rejection::dos(
                100,
                reject::INVALID,
                format!("mandatory-script-verify-flag-failed ({})", error),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockIndex;
    use crate::config::ChainParams;
    use crate::script::Interpreter;

    const NOW: i64 = 1_700_000_000;

    fn limiter() -> (RelayLimiter, ValidationConfig) {
        let config = ValidationConfig::default();
        (RelayLimiter::new(&config, NOW), config)
    }

    #[test]
    fn test_limiter_floor_at_minimum_when_pool_small() {
        let (mut limiter, config) = limiter();
        let rate = limiter.update(1000, NOW, &config);
        assert_eq!(rate, FeeRate::new(1000));
        assert_eq!(limiter.free_limit(), config.limit_free_relay);
    }

    #[test]
    fn test_limiter_scales_between_one_and_three_blocks() {
        let (mut limiter, config) = limiter();
        // Two blocks of transactions: halfway between the bounds
        let rate = limiter.update(2 * MAX_BLOCK_SIZE as u64, NOW, &config);
        assert!((limiter.fee_cutoff() - 2.0).abs() < 1e-9);
        assert_eq!(rate, FeeRate::new(2000));
        assert!((limiter.free_limit() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_limiter_pinned_when_congested() {
        let (mut limiter, config) = limiter();
        limiter.update(10 * MAX_BLOCK_SIZE as u64, NOW, &config);
        assert_eq!(limiter.fee_cutoff(), config.max_limiter_tx_fee);
        assert_eq!(limiter.free_limit(), DEFAULT_MIN_LIMITFREERELAY);
    }

    #[test]
    fn test_limiter_cutoff_decays_after_congestion() {
        let (mut limiter, config) = limiter();
        limiter.update(10 * MAX_BLOCK_SIZE as u64, NOW, &config);
        // Half a day later with a medium pool the decayed cutoff still wins
        limiter.update(MAX_BLOCK_SIZE as u64 + 1, NOW + SECONDS_PER_DAY / 2, &config);
        let expected = 3.0 * (1.0 - 1.0 / SECONDS_PER_DAY as f64).powf((SECONDS_PER_DAY / 2) as f64);
        assert!((limiter.fee_cutoff() - expected).abs() < 1e-9);
        assert!(limiter.fee_cutoff() < 3.0);
        // Much later it is back at the configured floor
        limiter.update(0, NOW + 30 * SECONDS_PER_DAY, &config);
        assert_eq!(limiter.fee_cutoff(), config.min_limiter_tx_fee);
    }

    #[test]
    fn test_free_limiter_quota_and_decay() {
        let (mut limiter, config) = limiter();
        limiter.update(10 * MAX_BLOCK_SIZE as u64, NOW, &config);
        // Quota of 1 kB/min becomes 10 000 bytes in the window
        assert!(limiter.consume_free(9_000, NOW));
        assert!(limiter.consume_free(2_000, NOW));
        assert!(!limiter.consume_free(100, NOW));
        // Ten minutes later about a third is left
        assert!(limiter.consume_free(100, NOW + 600));
        assert!(limiter.free_count() < 11_000.0 / 2.0);
    }

    struct Fixture {
        index: BlockIndex,
        active: ActiveChain,
        coins: CoinsViewCache<EmptyCoinsView>,
        pool: TxMempool,
        limiter: RelayLimiter,
        config: ValidationConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let params = ChainParams::regtest();
            let mut index = BlockIndex::new();
            let genesis = index.insert_header(&params.genesis.header, false);
            let mut active = ActiveChain::default();
            active.set_tip(&index, Some(genesis));
            let config = ValidationConfig { require_standard: false, ..ValidationConfig::default() };
            Self {
                index,
                active,
                coins: CoinsViewCache::new(EmptyCoinsView),
                pool: TxMempool::new(FeeRate::new(config.min_relay_tx_fee)),
                limiter: RelayLimiter::new(&config, NOW),
                config,
            }
        }

        fn accept(&mut self, tx: Transaction) -> AdmissionOutcome {
            let mut ctx = AdmissionContext {
                coins_tip: &mut self.coins,
                index: &self.index,
                active: &self.active,
                pool: &mut self.pool,
                limiter: &mut self.limiter,
                config: &self.config,
                verifier: &Interpreter,
                now: NOW,
            };
            accept_to_memory_pool(&mut ctx, Arc::new(tx), AdmissionOptions::default())
        }
    }

    fn funding(value: Amount) -> (OutPoint, Coin) {
        let coin = Coin::new(TransactionOutput { value, script_pubkey: vec![0x51] }, 0, false, 0);
        (OutPoint::new([0xaa; 32], 0), coin)
    }

    fn spend(prevout: OutPoint, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            inputs: vec![TransactionInput { prevout, script_sig: vec![], sequence: SEQUENCE_FINAL }],
            outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
            lock_time: 0,
            service_reference_hash: None,
        }
    }

    #[test]
    fn test_accepts_paying_transaction() {
        let mut fixture = Fixture::new();
        let (prevout, coin) = funding(10 * COIN);
        fixture.coins.add_coin(prevout, coin, false);
        let tx = spend(prevout, 10 * COIN - 10_000);
        let outcome = fixture.accept(tx.clone());
        assert!(outcome.accepted, "{:?}", outcome.rejection);
        assert!(fixture.pool.exists(&tx.txid()));
    }

    #[test]
    fn test_missing_inputs_is_not_a_rejection() {
        let mut fixture = Fixture::new();
        let outcome = fixture.accept(spend(OutPoint::new([5; 32], 0), COIN));
        assert!(!outcome.accepted);
        assert!(outcome.missing_inputs);
        assert!(outcome.rejection.is_none());
        assert!(fixture.pool.is_empty());
    }

    #[test]
    fn test_double_spend_of_pool_input_conflicts() {
        let mut fixture = Fixture::new();
        let (prevout, coin) = funding(10 * COIN);
        fixture.coins.add_coin(prevout, coin, false);
        assert!(fixture.accept(spend(prevout, 10 * COIN - 10_000)).accepted);
        let outcome = fixture.accept(spend(prevout, 10 * COIN - 20_000));
        let rejection = outcome.rejection.unwrap();
        assert_eq!(rejection.reason, "txn-mempool-conflict");
        assert_eq!(rejection.code, reject::CONFLICT);
        assert_eq!(fixture.pool.size(), 1);
    }

    #[test]
    fn test_duplicate_is_already_known() {
        let mut fixture = Fixture::new();
        let (prevout, coin) = funding(10 * COIN);
        fixture.coins.add_coin(prevout, coin, false);
        let tx = spend(prevout, 10 * COIN - 10_000);
        assert!(fixture.accept(tx.clone()).accepted);
        assert_eq!(fixture.accept(tx).rejection.unwrap().code, reject::ALREADY_KNOWN);
    }

    #[test]
    fn test_spending_pool_output_is_accepted() {
        let mut fixture = Fixture::new();
        let (prevout, coin) = funding(10 * COIN);
        fixture.coins.add_coin(prevout, coin, false);
        let parent = spend(prevout, 10 * COIN - 10_000);
        assert!(fixture.accept(parent.clone()).accepted);
        let child = spend(OutPoint::new(parent.txid(), 0), 10 * COIN - 20_000);
        let outcome = fixture.accept(child);
        assert!(outcome.accepted, "{:?}", outcome.rejection);
        assert_eq!(fixture.pool.size(), 2);
    }

    #[test]
    fn test_coinbase_rejected_with_score() {
        let mut fixture = Fixture::new();
        let mut tx = spend(OutPoint::null(), COIN);
        tx.inputs[0].script_sig = vec![0x51, 0x51];
        let rejection = fixture.accept(tx).rejection.unwrap();
        assert_eq!(rejection.reason, "coinbase");
        assert_eq!(rejection.dos, 100);
    }

    #[test]
    fn test_failed_script_uncaches_pulled_coins() {
        let mut fixture = Fixture::new();
        let (prevout, mut coin) = funding(10 * COIN);
        coin.output.script_pubkey = vec![0x00];
        // Coin lives in a base cache, not in the tip's own map
        let mut base = CoinsViewCache::new(EmptyCoinsView);
        base.add_coin(prevout, coin, false);
        let mut tip = CoinsViewCache::new(&mut base);
        let mut limiter = fixture.limiter.clone();
        let mut ctx = AdmissionContext {
            coins_tip: &mut tip,
            index: &fixture.index,
            active: &fixture.active,
            pool: &mut fixture.pool,
            limiter: &mut limiter,
            config: &fixture.config,
            verifier: &Interpreter,
            now: NOW,
        };
        let outcome = accept_to_memory_pool(&mut ctx, Arc::new(spend(prevout, COIN)), AdmissionOptions::default());
        let rejection = outcome.rejection.unwrap();
        assert!(rejection.reason.starts_with("mandatory-script-verify-flag-failed"));
        assert!(!tip.have_coin_in_cache(&prevout));
    }

    #[test]
    fn test_absurd_fee_v2_threshold() {
        let mut fixture = Fixture::new();
        let (prevout, coin) = funding(1000 * COIN);
        fixture.coins.add_coin(prevout, coin, false);
        let mut tx = spend(prevout, COIN);
        tx.version = 2;
        let mut ctx = AdmissionContext {
            coins_tip: &mut fixture.coins,
            index: &fixture.index,
            active: &fixture.active,
            pool: &mut fixture.pool,
            limiter: &mut fixture.limiter,
            config: &fixture.config,
            verifier: &Interpreter,
            now: NOW,
        };
        let options = AdmissionOptions { reject_absurd_fee: true, ..AdmissionOptions::default() };
        let rejection = accept_to_memory_pool(&mut ctx, Arc::new(tx), options).rejection.unwrap();
        assert_eq!(rejection.reason, "absurdly-high-fee");
        assert_eq!(rejection.code, reject::HIGHFEE);
    }

    #[test]
    fn test_free_transaction_over_quota_leaves_pool_unchanged() {
        let mut fixture = Fixture::new();
        fixture.config.relay_priority = false;
        fixture.config.limit_free_relay = 0.0;
        let (paid_prevout, coin) = funding(10 * COIN);
        fixture.coins.add_coin(paid_prevout, coin.clone(), false);
        assert!(fixture.accept(spend(paid_prevout, 10 * COIN - 10_000)).accepted);
        let (size, bytes) = (fixture.pool.size(), fixture.pool.total_tx_size());

        let free_prevout = OutPoint::new([0xbb; 32], 0);
        fixture.coins.add_coin(free_prevout, coin, false);
        let free = spend(free_prevout, 10 * COIN);
        let outcome = fixture.accept(free.clone());
        let rejection = outcome.rejection.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(rejection.reason, "rate limited free transaction");
        assert_eq!(rejection.code, reject::INSUFFICIENTFEE);
        assert_eq!(rejection.dos, 0);
        assert!(!fixture.pool.exists(&free.txid()));
        assert_eq!(fixture.pool.size(), size);
        assert_eq!(fixture.pool.total_tx_size(), bytes);
    }

    #[test]
    fn test_low_priority_free_transaction_refused() {
        let mut fixture = Fixture::new();
        fixture.config.relay_priority = true;
        let (prevout, coin) = funding(COIN);
        fixture.coins.add_coin(prevout, coin, false);
        let rejection = fixture.accept(spend(prevout, COIN)).rejection.unwrap();
        assert_eq!(rejection.reason, "insufficient priority");
        assert_eq!(rejection.code, reject::INSUFFICIENTFEE);
        assert!(fixture.pool.is_empty());
    }

    #[test]
    fn test_absurd_fee_ceiling_only_for_known_versions() {
        let mut fixture = Fixture::new();
        let (prevout, coin) = funding(1000 * COIN);
        fixture.coins.add_coin(prevout, coin, false);
        let mut tx = spend(prevout, COIN);
        tx.version = 3;
        let mut ctx = AdmissionContext {
            coins_tip: &mut fixture.coins,
            index: &fixture.index,
            active: &fixture.active,
            pool: &mut fixture.pool,
            limiter: &mut fixture.limiter,
            config: &fixture.config,
            verifier: &Interpreter,
            now: NOW,
        };
        let options = AdmissionOptions { reject_absurd_fee: true, ..AdmissionOptions::default() };
        let outcome = accept_to_memory_pool(&mut ctx, Arc::new(tx), options);
        assert!(outcome.accepted, "{:?}", outcome.rejection);
    }
}
