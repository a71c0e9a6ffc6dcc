//! Transaction validation: structure, inputs and coin age

use crate::coins::CoinsView;
use crate::constants::*;
use crate::economic::proof_of_stake_reward;
use crate::error::{reject, Rejection, ValidationResult};
use crate::script;
use crate::types::*;
use std::collections::HashSet;

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// Context-free rules for a transaction tx = (v, t, ins, outs, lt):
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. |tx| ≤ MAX_BLOCK_SIZE
/// 3. ∀o ∈ outs: 0 ≤ o.value ≤ MAX_MONEY, Σ o.value ≤ MAX_MONEY
/// 4. Empty outputs only in coinbase or coinstake
/// 5. No outpoint spent twice
/// 6. Coinbase scriptSig is 2..=100 bytes; other inputs are not null
pub fn check_transaction(tx: &Transaction) -> ValidationResult<()> {
    // 1. Non-empty input and output lists
    if tx.inputs.is_empty() {
        return Err(Rejection::dos(10, reject::INVALID, "bad-txns-vin-empty"));
    }
    if tx.outputs.is_empty() {
        return Err(Rejection::dos(10, reject::INVALID, "bad-txns-vout-empty"));
    }

    // 2. Size limit
    if tx.serialized_size() > MAX_BLOCK_SIZE {
        return Err(Rejection::dos(100, reject::INVALID, "bad-txns-oversize"));
    }

    // 3. Output values
    let mut value_out: Amount = 0;
    let user_tx = !tx.is_coinbase() && !tx.is_coinstake();
    for output in &tx.outputs {
        // 4. ppcoin empty output rule
        if output.is_empty() && user_tx {
            return Err(Rejection::dos(100, reject::INVALID, "bad-txns-vout-empty-user"));
        }
        if output.value < 0 {
            return Err(Rejection::dos(100, reject::INVALID, "bad-txns-vout-negative"));
        }
        if output.value > MAX_MONEY {
            return Err(Rejection::dos(100, reject::INVALID, "bad-txns-vout-toolarge"));
        }
        value_out += output.value;
        if !money_range(value_out) {
            return Err(Rejection::dos(100, reject::INVALID, "bad-txns-txouttotal-toolarge"));
        }
    }

    // 5. Duplicate inputs
    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(Rejection::dos(100, reject::INVALID, "bad-txns-inputs-duplicate"));
        }
    }

    // 6. Coinbase shape
    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(Rejection::dos(100, reject::INVALID, "bad-cb-length"));
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Err(Rejection::dos(10, reject::INVALID, "bad-txns-prevout-null"));
    }

    Ok(())
}

/// Signature operations counted without looking at spent outputs
pub fn legacy_sig_op_count(tx: &Transaction) -> u32 {
    let inputs: u32 = tx
        .inputs
        .iter()
        .map(|input| script::sig_op_count(&input.script_sig, false))
        .sum();
    let outputs: u32 = tx
        .outputs
        .iter()
        .map(|output| script::sig_op_count(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}

/// Signature operations in the redeem scripts of P2SH inputs
pub fn p2sh_sig_op_count(tx: &Transaction, view: &impl CoinsView) -> u32 {
    if tx.is_coinbase() {
        return 0;
    }
    tx.inputs
        .iter()
        .filter_map(|input| {
            let coin = view.get_coin(&input.prevout)?;
            if !script::is_pay_to_script_hash(&coin.output.script_pubkey) {
                return None;
            }
            Some(script::p2sh_sig_op_count(&coin.output.script_pubkey, &input.script_sig))
        })
        .sum()
}

/// True if every input refers to an unspent coin in `view`
pub fn have_inputs(tx: &Transaction, view: &impl CoinsView) -> bool {
    tx.is_coinbase() || tx.inputs.iter().all(|input| view.have_coin(&input.prevout))
}

/// Coin age in coin-days
///
/// Sum over inputs of value × seconds held, counted in cent-seconds and
/// converted to whole coin-days. Coins younger than `stake_min_age` add
/// nothing. `None` when an input is missing or the transaction predates one
/// of its coins.
pub fn coin_age(tx: &Transaction, view: &impl CoinsView, stake_min_age: i64) -> Option<u64> {
    if tx.is_coinbase() {
        return Some(0);
    }
    let mut cent_seconds: u128 = 0;
    for input in &tx.inputs {
        let coin = view.get_coin(&input.prevout)?;
        if tx.time < coin.time {
            return None;
        }
        if coin.time as i64 + stake_min_age > tx.time as i64 {
            continue;
        }
        let held = (tx.time - coin.time) as u128;
        cent_seconds += coin.output.value.max(0) as u128 * held / CENT as u128;
    }
    let coin_days = cent_seconds * CENT as u128 / COIN as u128 / SECONDS_PER_DAY as u128;
    Some(coin_days.min(u64::MAX as u128) as u64)
}

/// Chain context for input checks
#[derive(Debug, Clone, Copy)]
pub struct SpendContext {
    /// Height of the block the spend will be in
    pub spend_height: i32,
    /// Height of the active tip, gating the maturity rule
    pub tip_height: i32,
    /// Money supply at the tip, capping stake rewards
    pub money_supply: Amount,
    pub stake_min_age: i64,
}

/// CheckTxInputs: 𝒯𝒳 × 𝒰𝒮 × ℕ → {valid, invalid} × ℤ
///
/// For non-coinbase tx against coin view us:
/// 1. Every input must be available (unscored, empty reason)
/// 2. Coinbase/coinstake coins, and any coin spent by a coinstake, need
///    COINBASE_MATURITY confirmations once the tip is past the enforcement
///    height
/// 3. Input values and their running sum stay in money range
/// 4. Ordinary tx: Σ in ≥ Σ out, fee = Σ in − Σ out in money range
/// 5. Coinstake: reward = Σ out − Σ in ≤ stake reward(coin age) + min fee
///
/// Returns the fee (zero for a coinstake).
pub fn check_tx_inputs(
    tx: &Transaction,
    view: &impl CoinsView,
    ctx: &SpendContext,
) -> ValidationResult<Amount> {
    // 1. Inputs available
    if !have_inputs(tx, view) {
        return Err(Rejection::invalid(0, "").with_debug("Inputs unavailable"));
    }

    let mut value_in: Amount = 0;
    for input in &tx.inputs {
        let coin = view
            .get_coin(&input.prevout)
            .ok_or_else(|| Rejection::invalid(0, "").with_debug("Inputs unavailable"))?;

        // 2. Maturity
        if coin.is_coinbase || tx.is_coinstake() {
            let depth = ctx.spend_height - coin.height as i32;
            if depth < COINBASE_MATURITY && ctx.tip_height > MATURITY_ENFORCEMENT_HEIGHT {
                return Err(Rejection::invalid(reject::INVALID, "bad-txns-premature-spend-of-coinbase")
                    .with_debug(format!("tried to spend coinbase at depth {}", depth)));
            }
        }

        // 3. Value ranges
        value_in = value_in.saturating_add(coin.output.value);
        if !money_range(coin.output.value) || !money_range(value_in) {
            return Err(Rejection::dos(100, reject::INVALID, "bad-txns-inputvalues-outofrange"));
        }
    }

    let value_out = tx
        .value_out()
        .ok_or_else(|| Rejection::dos(100, reject::INVALID, "bad-txns-txouttotal-toolarge"))?;

    if !tx.is_coinstake() {
        // 4. Fee
        if value_in < value_out {
            return Err(Rejection::dos(100, reject::INVALID, "bad-txns-in-belowout")
                .with_debug(format!("value in ({}) < value out ({})", value_in, value_out)));
        }
        let fee = value_in - value_out;
        if fee < 0 {
            return Err(Rejection::dos(100, reject::INVALID, "bad-txns-fee-negative"));
        }
        if !money_range(fee) {
            return Err(Rejection::dos(100, reject::INVALID, "bad-txns-fee-outofrange"));
        }
        return Ok(fee);
    }

    // 5. Stake reward
    let short_id = &hash_to_hex(&tx.txid())[..10];
    let age = coin_age(tx, view, ctx.stake_min_age).ok_or_else(|| {
        Rejection::dos(100, reject::INVALID, "bad-txns-cant-get-coin-age")
            .with_debug(format!("{} unable to get coin age for coinstake", short_id))
    })?;
    let reward = value_out - value_in;
    let entitlement = proof_of_stake_reward(age as i64, ctx.spend_height, ctx.money_supply);
    if reward > entitlement + DEFAULT_TRANSACTION_MINFEE {
        tracing::debug!(target: "validation", reward, coin_age = age, "stake reward exceeded");
        return Err(Rejection::dos(100, reject::INVALID, "bad-txns-stake-reward-too-high")
            .with_debug(format!("{} stake reward exceeded", short_id)));
    }
    Ok(0)
}
