//! Block validation: context-free, contextual and connection checks
//!
//! A block climbs the validity ladder in [`crate::chain::status`]:
//! [`check_block`] and [`contextual_check_block`] take it to
//! `VALID_TRANSACTIONS`, [`connect_block`] to `VALID_SCRIPTS`.
//! [`disconnect_block`] reverses a connection from its undo record.

use crate::chain::{is_super_majority, last_checkpoint, BlockId, BlockIndex};
use crate::coins::{is_unspendable, CoinsView, CoinsViewCache};
use crate::config::ChainParams;
use crate::constants::*;
use crate::economic::proof_of_work_reward;
use crate::error::{reject, Rejection, ValidationResult};
use crate::locktime::{is_final_tx, sequence_locks};
use crate::merkle::block_merkle_root;
use crate::policy::MANDATORY_SCRIPT_VERIFY_FLAGS;
use crate::pow::{check_proof_of_work, get_next_target_required};
use crate::script::{
    push_int, solver, verify_digest_signature, ScriptError, ScriptVerifier, TransactionSignatureChecker,
    TxOutType, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, SCRIPT_VERIFY_DERSIG,
};
use crate::service::{process_service_reference, ServiceTransactionProvider};
use crate::transaction::{check_transaction, check_tx_inputs, have_inputs, legacy_sig_op_count, p2sh_sig_op_count, SpendContext};
use crate::types::*;
use crate::undo::{apply_tx_in_undo, BlockUndo, DisconnectResult, TxUndo};
use rayon::prelude::*;
use std::collections::HashSet;

/// Hashes of blocks that already passed [`check_block`]
///
/// Kept beside the block rather than on it, so a block value stays plain
/// data.
#[derive(Debug, Default)]
pub struct CheckedBlocks {
    hashes: HashSet<Hash>,
}

impl CheckedBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Collaborators of the context-free block check
#[derive(Clone, Copy)]
pub struct BlockCheckContext<'a> {
    pub params: &'a ChainParams,
    pub service: Option<&'a dyn ServiceTransactionProvider>,
}

/// Block signature: empty for proof of work; for proof of stake a signature
/// of the block hash by the key the coinstake pays to
pub fn check_block_signature(block: &Block) -> bool {
    if block.is_proof_of_work() {
        return block.signature.is_empty();
    }
    let Some(output) = block.transactions.get(1).and_then(|tx| tx.outputs.get(1)) else {
        return false;
    };
    let (kind, solutions) = solver(&output.script_pubkey);
    match (kind, solutions.first()) {
        (TxOutType::PubKey, Some(pubkey)) => {
            !block.signature.is_empty() && verify_digest_signature(pubkey, &block.signature, &block.hash())
        }
        _ => false,
    }
}

/// CheckBlock: ℬ → {valid, invalid}
///
/// Context-free checks, in order:
/// 1. Proof of work of PoW blocks (`high-hash`)
/// 2. Merkle root and CVE-2012-2459 duplication (corruption possible)
/// 3. Transaction count and serialized size
/// 4. One coinbase, first; an optional coinstake, second only
/// 5. PoS coinbase pays a single empty output
/// 6. Every transaction well formed; service references resolved;
///    no transaction timestamped after the block
/// 7. Legacy sigops within MAX_BLOCK_SIGOPS
/// 8. Block signature
///
/// A block that passes with both PoW and merkle checks is remembered in
/// `checked`, and a repeated call returns at once.
pub fn check_block(
    block: &Block,
    ctx: &BlockCheckContext<'_>,
    checked: &mut CheckedBlocks,
    check_pow: bool,
    check_merkle_root: bool,
) -> ValidationResult<()> {
    let hash = block.hash();
    if checked.contains(&hash) {
        return Ok(());
    }

    // 1. Proof of work
    if block.is_proof_of_work()
        && check_pow
        && !check_proof_of_work(&hash, block.header.bits, &ctx.params.pow_limit())
    {
        return Err(Rejection::dos(50, reject::INVALID, "high-hash").with_debug("proof of work failed"));
    }

    // 2. Merkle root
    if check_merkle_root {
        let (root, mutated) = block_merkle_root(block);
        if block.header.merkle_root != root {
            return Err(Rejection::dos(100, reject::INVALID, "bad-txnmrklroot")
                .with_debug("hashMerkleRoot mismatch")
                .with_corruption_possible());
        }
        if mutated {
            return Err(Rejection::dos(100, reject::INVALID, "bad-txns-duplicate")
                .with_debug("duplicate transaction")
                .with_corruption_possible());
        }
    }

    // 3. Size limits
    if block.transactions.is_empty()
        || block.transactions.len() > MAX_BLOCK_SIZE
        || block.serialized_size() > MAX_BLOCK_SIZE
    {
        return Err(Rejection::dos(100, reject::INVALID, "bad-blk-length").with_debug("size limits failed"));
    }

    // 4. Coinbase and coinstake positions
    if !block.transactions[0].is_coinbase() {
        return Err(Rejection::dos(100, reject::INVALID, "bad-cb-missing").with_debug("first tx is not coinbase"));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(Rejection::dos(100, reject::INVALID, "bad-cb-multiple").with_debug("more than one coinbase"));
    }
    if block.transactions.iter().skip(2).any(Transaction::is_coinstake) {
        return Err(Rejection::dos(100, reject::INVALID, "bad-cs-position").with_debug("coinstake in wrong position"));
    }

    // 5. PoS coinbase
    if block.is_proof_of_stake() {
        let outputs = &block.transactions[0].outputs;
        if outputs.len() != 1 || !outputs[0].is_empty() {
            return Err(Rejection::invalid(reject::INVALID, "bad-cb-notempty")
                .with_debug("coinbase output not empty for proof-of-stake block"));
        }
    }

    // 6. Transactions
    for tx in &block.transactions {
        if let Err(rejection) = check_transaction(tx) {
            let debug = format!("Transaction check failed (txid {}) {}", hash_to_hex(&tx.txid()), rejection.debug);
            return Err(rejection.with_debug(debug));
        }
        if let Some(service) = ctx.service {
            process_service_reference(service, tx, block);
        }
        if block.header.timestamp < tx.time {
            return Err(Rejection::dos(50, reject::INVALID, "bad-tx-time")
                .with_debug("block timestamp earlier than transaction timestamp"));
        }
    }

    // 7. Sigops
    let sig_ops: u32 = block.transactions.iter().map(legacy_sig_op_count).sum();
    if sig_ops > MAX_BLOCK_SIGOPS {
        return Err(Rejection::dos(100, reject::INVALID, "bad-blk-sigops").with_debug("out-of-bounds SigOpCount"));
    }

    // 8. Signature
    if !check_block_signature(block) {
        return Err(Rejection::dos(100, reject::INVALID, "bad-block-sig"));
    }

    if check_pow && check_merkle_root {
        checked.hashes.insert(hash);
    }
    Ok(())
}

/// ContextualCheckBlockHeader: ℋ × ℬℐ → {valid, invalid}
///
/// 1. Bits match the next required target for the block kind
/// 2. Timestamp after the parent's median time past
/// 3. Timestamp at most MAX_FUTURE_BLOCK_TIME past adjusted time
/// 4. Version 1 rejected once a supermajority upgraded
pub fn contextual_check_block_header(
    header: &BlockHeader,
    proof_of_stake: bool,
    index: &BlockIndex,
    prev: BlockId,
    params: &ChainParams,
    adjusted_time: i64,
) -> ValidationResult<()> {
    let expected_bits = get_next_target_required(index, Some(prev), proof_of_stake, params);
    if header.bits != expected_bits {
        return Err(Rejection::dos(100, reject::INVALID, "bad-diffbits").with_debug("incorrect difficulty"));
    }
    if header.timestamp as i64 <= index.median_time_past(prev) {
        return Err(Rejection::invalid(reject::INVALID, "time-too-old").with_debug("block's timestamp is too early"));
    }
    if header.timestamp as i64 > adjusted_time + MAX_FUTURE_BLOCK_TIME {
        return Err(Rejection::invalid(reject::INVALID, "time-too-new").with_debug("block timestamp too far in the future"));
    }
    if header.version < 2
        && is_super_majority(
            index,
            2,
            Some(prev),
            params.majority_reject_block_outdated,
            params.majority_window,
        )
    {
        return Err(Rejection::invalid(reject::OBSOLETE, format!("bad-version(0x{:08x})", header.version))
            .with_debug("rejected nVersion block"));
    }
    Ok(())
}

/// Forks from below the last indexed checkpoint are refused
pub fn check_index_against_checkpoint(
    index: &BlockIndex,
    prev: BlockId,
    params: &ChainParams,
    checkpoints_enabled: bool,
) -> ValidationResult<()> {
    if !checkpoints_enabled || index.get(prev).hash == params.genesis_hash() {
        return Ok(());
    }
    let height = index.get(prev).height + 1;
    if let Some(checkpoint) = last_checkpoint(index, &params.checkpoints) {
        let checkpoint_height = index.get(checkpoint).height;
        if height < checkpoint_height {
            return Err(Rejection::dos(100, reject::CHECKPOINT, "bad-fork-prior-to-checkpoint")
                .with_debug(format!("forked chain older than last checkpoint (height {})", height)));
        }
    }
    Ok(())
}

/// ContextualCheckBlock: ℬ × ℬℐ → {valid, invalid}
///
/// 1. Every transaction final at the new height against the parent's
///    median time past
/// 2. Version ≥ 2 blocks start the coinbase scriptSig with the height once
///    a supermajority of the window has upgraded
pub fn contextual_check_block(
    block: &Block,
    index: &BlockIndex,
    prev: Option<BlockId>,
    params: &ChainParams,
) -> ValidationResult<()> {
    let height = prev.map_or(0, |p| index.get(p).height + 1);
    let cutoff = prev.map_or(block.header.timestamp as i64, |p| index.median_time_past(p));

    for tx in &block.transactions {
        if !is_final_tx(tx, height, cutoff) {
            return Err(Rejection::dos(10, reject::INVALID, "bad-txns-nonfinal")
                .with_debug("contains a non-final transaction"));
        }
    }

    if block.header.version >= 2
        && is_super_majority(index, 2, prev, params.majority_enforce_block_upgrade, params.majority_window)
    {
        let mut expect = Vec::new();
        push_int(&mut expect, height as i64);
        let script_sig = block
            .transactions
            .first()
            .and_then(|tx| tx.inputs.first())
            .map(|input| input.script_sig.as_slice())
            .unwrap_or_default();
        if !script_sig.starts_with(&expect) {
            return Err(Rejection::dos(100, reject::INVALID, "bad-cb-height")
                .with_debug("block height mismatch in coinbase"));
        }
    }
    Ok(())
}

/// Script and lock-time flags a block at `id` is connected under
pub fn block_verify_flags(index: &BlockIndex, id: BlockId, params: &ChainParams) -> (u32, u32) {
    let entry = index.get(id);
    let prev = entry.prev;
    let mut script_flags = MANDATORY_SCRIPT_VERIFY_FLAGS;
    let mut lock_flags = LOCKTIME_MEDIAN_TIME_PAST;
    let window = params.majority_window;
    let required = params.majority_enforce_block_upgrade;
    if entry.version >= 3 && is_super_majority(index, 3, prev, required, window) {
        script_flags |= SCRIPT_VERIFY_DERSIG;
    }
    if entry.version >= 4 && is_super_majority(index, 4, prev, required, window) {
        script_flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
    }
    if entry.height >= params.csv_height {
        script_flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
        lock_flags |= LOCKTIME_VERIFY_SEQUENCE;
    }
    (script_flags, lock_flags)
}

/// One deferred input script verification
pub struct ScriptCheck<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub script_pubkey: Vec<u8>,
    pub amount: Amount,
    pub flags: u32,
}

impl ScriptCheck<'_> {
    pub fn run(&self, verifier: &dyn ScriptVerifier) -> Result<(), ScriptError> {
        let checker = TransactionSignatureChecker::new(self.tx, self.input_index, self.amount);
        verifier.verify(
            &self.tx.inputs[self.input_index].script_sig,
            &self.script_pubkey,
            self.flags,
            &checker,
        )
    }
}

/// Run a batch of script checks, on `workers` when given
///
/// Every check completes before the verdict; the first failure in input
/// order decides the rejection.
pub fn run_script_checks(
    checks: &[ScriptCheck<'_>],
    verifier: &dyn ScriptVerifier,
    workers: Option<&rayon::ThreadPool>,
) -> ValidationResult<()> {
    let results: Vec<Result<(), ScriptError>> = match workers {
        Some(pool) => pool.install(|| checks.par_iter().map(|check| check.run(verifier)).collect()),
        None => checks.iter().map(|check| check.run(verifier)).collect(),
    };
    for (check, result) in checks.iter().zip(results) {
        if let Err(error) = result {
            return Err(Rejection::dos(
                100,
                reject::INVALID,
                format!("mandatory-script-verify-flag-failed ({})", error),
            )
            .with_debug(format!(
                "input {} of {}",
                check.input_index,
                hash_to_hex(&check.tx.txid())
            )));
        }
    }
    Ok(())
}

/// Collaborators of block connection
#[derive(Clone, Copy)]
pub struct ConnectContext<'a> {
    pub params: &'a ChainParams,
    pub verifier: &'a dyn ScriptVerifier,
    pub workers: Option<&'a rayon::ThreadPool>,
}

/// ConnectBlock: ℬ × 𝒰𝒮 → {valid, invalid} × 𝒰𝒮 × undo
///
/// Applies `block` (indexed as `id`, whose parent must be the view's best
/// block) to `view`:
/// 1. Per transaction: sigops incl. P2SH, inputs present, BIP68 locks,
///    CheckTxInputs (fees, maturity, stake reward)
/// 2. Spend inputs into the undo record and add outputs
/// 3. All input scripts, batched
/// 4. Coinbase pays at most the PoW reward plus fees
///
/// On success the entry's money supply is updated and the undo record is
/// returned. On failure `view` may hold partial changes; callers connect
/// into a child cache and drop it.
pub fn connect_block<B: CoinsView>(
    block: &Block,
    id: BlockId,
    index: &mut BlockIndex,
    view: &mut CoinsViewCache<B>,
    ctx: &ConnectContext<'_>,
) -> ValidationResult<BlockUndo> {
    let hash = block.hash();
    let entry = index.get(id);
    let height = entry.height;

    // The genesis outputs are not spendable
    if hash == ctx.params.genesis_hash() {
        view.set_best_block(hash);
        return Ok(BlockUndo::default());
    }

    let prev = entry.prev.ok_or_else(|| Rejection::internal("connect_block: block without parent"))?;
    let prev_entry = index.get(prev);
    if view.best_block() != prev_entry.hash {
        return Err(Rejection::internal("connect_block: view is not at the parent block"));
    }
    let prev_hash = prev_entry.hash;
    let prev_supply = prev_entry.money_supply;
    let prev_mtp = index.median_time_past(prev);
    let (script_flags, lock_flags) = block_verify_flags(index, id, ctx.params);

    let spend_ctx = SpendContext {
        spend_height: height,
        tip_height: prev_entry.height,
        money_supply: prev_supply,
        stake_min_age: ctx.params.stake_min_age,
    };

    let mut undo = BlockUndo::default();
    let mut checks = Vec::new();
    let mut sig_ops = 0u32;
    let mut fees: Amount = 0;
    let mut value_in: Amount = 0;
    let mut value_out: Amount = 0;

    for tx in &block.transactions {
        sig_ops += legacy_sig_op_count(tx);
        if sig_ops > MAX_BLOCK_SIGOPS {
            return Err(Rejection::dos(100, reject::INVALID, "bad-blk-sigops").with_debug("too many sigops"));
        }

        if !tx.is_coinbase() {
            if !have_inputs(tx, view) {
                return Err(Rejection::dos(100, reject::INVALID, "bad-txns-inputs-missingorspent")
                    .with_debug("inputs missing/spent"));
            }

            let mut prev_heights: Vec<i32> = tx
                .inputs
                .iter()
                .map(|input| view.access_coin(&input.prevout).map_or(0, |coin| coin.height as i32))
                .collect();
            let mtp_at = |h: i32| index.ancestor(id, h).map_or(0, |a| index.median_time_past(a));
            if !sequence_locks(tx, lock_flags, &mut prev_heights, height, prev_mtp, mtp_at) {
                return Err(Rejection::dos(100, reject::INVALID, "bad-txns-nonfinal")
                    .with_debug("contains a non-BIP68-final transaction"));
            }

            sig_ops += p2sh_sig_op_count(tx, view);
            if sig_ops > MAX_BLOCK_SIGOPS {
                return Err(Rejection::dos(100, reject::INVALID, "bad-blk-sigops").with_debug("too many sigops"));
            }

            let fee = check_tx_inputs(tx, view, &spend_ctx).map_err(|rejection| {
                if rejection.reason.is_empty() {
                    Rejection::dos(100, reject::INVALID, "bad-txns-inputs-missingorspent")
                } else {
                    rejection
                }
            })?;
            fees += fee;
            value_in += view.value_in(tx);

            for (input_index, input) in tx.inputs.iter().enumerate() {
                if let Some(coin) = view.access_coin(&input.prevout) {
                    checks.push(ScriptCheck {
                        tx,
                        input_index,
                        script_pubkey: coin.output.script_pubkey,
                        amount: coin.output.value,
                        flags: script_flags,
                    });
                }
            }

            let mut tx_undo = TxUndo::default();
            for input in &tx.inputs {
                let mut spent = Coin::new(TransactionOutput::empty(), 0, false, 0);
                view.spend_coin(&input.prevout, Some(&mut spent));
                tx_undo.prevout.push(spent);
            }
            undo.tx_undo.push(tx_undo);
        }
        value_out += tx.value_out().unwrap_or(0);
        view.add_coins(tx, height as u32);
    }

    run_script_checks(&checks, ctx.verifier, ctx.workers)?;

    if block.is_proof_of_work() {
        let coinbase_out = block.transactions[0].value_out().unwrap_or(Amount::MAX);
        let limit = proof_of_work_reward(fees, height, &prev_hash);
        if coinbase_out > limit {
            return Err(Rejection::dos(100, reject::INVALID, "bad-cb-amount")
                .with_debug(format!("coinbase pays too much (actual={} vs limit={})", coinbase_out, limit)));
        }
    }

    index.get_mut(id).money_supply = prev_supply + value_out - value_in;
    view.set_best_block(hash);
    tracing::debug!(
        target: "bench",
        height,
        txs = block.transactions.len(),
        inputs = checks.len(),
        "connected block"
    );
    Ok(undo)
}

/// DisconnectBlock: ℬ × undo × 𝒰𝒮 → 𝒰𝒮
///
/// Removes the outputs `block` created and restores the coins it spent.
/// Unclean when the view does not hold exactly what the connection left.
pub fn disconnect_block<B: CoinsView>(
    block: &Block,
    index: &BlockIndex,
    id: BlockId,
    undo: &BlockUndo,
    view: &mut CoinsViewCache<B>,
) -> DisconnectResult {
    let entry = index.get(id);
    if view.best_block() != entry.hash {
        tracing::error!(target: "validation", "disconnect_block: view is not at the block");
        return DisconnectResult::Failed;
    }
    if undo.tx_undo.len() + 1 != block.transactions.len() {
        tracing::error!(target: "validation", "disconnect_block: block and undo data inconsistent");
        return DisconnectResult::Failed;
    }

    let mut clean = true;
    for (i, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        let coinbase = tx.is_coinbase() || tx.is_coinstake();

        for (n, output) in tx.outputs.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            let outpoint = OutPoint::new(txid, n as u32);
            let mut coin = Coin::new(TransactionOutput::empty(), 0, false, 0);
            let spent = view.spend_coin(&outpoint, Some(&mut coin));
            if !spent || coin.output != *output || coin.height != entry.height as u32 || coin.is_coinbase != coinbase {
                clean = false;
            }
        }

        if i > 0 {
            let tx_undo = &undo.tx_undo[i - 1];
            if tx_undo.prevout.len() != tx.inputs.len() {
                tracing::error!(target: "validation", "disconnect_block: transaction and undo data inconsistent");
                return DisconnectResult::Failed;
            }
            for (input, coin) in tx.inputs.iter().zip(&tx_undo.prevout).rev() {
                match apply_tx_in_undo(coin.clone(), view, &input.prevout) {
                    DisconnectResult::Failed => return DisconnectResult::Failed,
                    DisconnectResult::Unclean => clean = false,
                    DisconnectResult::Ok => {}
                }
            }
        }
    }

    view.set_best_block(index.prev_hash(id));
    if clean {
        DisconnectResult::Ok
    } else {
        DisconnectResult::Unclean
    }
}
