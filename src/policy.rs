//! Relay policy: standardness, fee rates and script flag sets
//!
//! None of these rules are consensus. A transaction failing them is valid in
//! a block but will not be relayed or admitted to the mempool.

use crate::coins::CoinsView;
use crate::constants::*;
use crate::script::*;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// Flags every block script must pass
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: u32 = SCRIPT_VERIFY_P2SH;

/// Flags applied to loose transactions
pub const STANDARD_SCRIPT_VERIFY_FLAGS: u32 = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY
    | SCRIPT_VERIFY_LOW_S;

pub const STANDARD_NOT_MANDATORY_VERIFY_FLAGS: u32 =
    STANDARD_SCRIPT_VERIFY_FLAGS & !MANDATORY_SCRIPT_VERIFY_FLAGS;

/// Highest transaction version relayed
pub const MAX_STANDARD_VERSION: i32 = 2;

/// Sigop ceiling for a standard P2SH redeem script
pub const MAX_P2SH_SIGOPS: u32 = 15;

/// Fee rate in base units per 1000 bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate {
    pub sat_per_k: Amount,
}

impl FeeRate {
    pub fn new(sat_per_k: Amount) -> Self {
        Self { sat_per_k }
    }

    /// Rate paid by `fee` over `size` bytes
    pub fn from_fee(fee: Amount, size: usize) -> Self {
        if size == 0 {
            return Self { sat_per_k: 0 };
        }
        Self { sat_per_k: fee.saturating_mul(1000) / size as Amount }
    }

    /// Fee for `size` bytes; a positive rate never rounds down to zero
    pub fn get_fee(&self, size: usize) -> Amount {
        let fee = self.sat_per_k.saturating_mul(size as Amount) / 1000;
        if fee == 0 && self.sat_per_k > 0 {
            return self.sat_per_k;
        }
        fee
    }
}

/// Priority high enough to be mined for free in the next block
pub fn allow_free(priority: f64) -> bool {
    priority > (COIN * 144) as f64 / 250.0
}

/// Smallest non-dust value for an output under `min_relay_fee`
pub fn dust_threshold(output: &TransactionOutput, min_relay_fee: &FeeRate) -> Amount {
    if output.script_pubkey.first() == Some(&opcodes::OP_RETURN) {
        return 0;
    }
    // Serialized output plus a typical spending input
    let size = 8 + 1 + output.script_pubkey.len() + 148;
    3 * min_relay_fee.get_fee(size)
}

pub fn is_dust(output: &TransactionOutput, min_relay_fee: &FeeRate) -> bool {
    output.value < dust_threshold(output, min_relay_fee)
}

/// A locking script matching a standard template
pub fn is_standard(script_pubkey: &[u8]) -> Option<TxOutType> {
    let (kind, solutions) = solver(script_pubkey);
    match kind {
        TxOutType::NonStandard => None,
        TxOutType::Multisig => {
            let m = solutions.first()?.first().copied()? as usize;
            let n = solutions.last()?.first().copied()? as usize;
            if !(1..=MAX_STANDARD_MULTISIG_KEYS).contains(&n) || m < 1 || m > n {
                return None;
            }
            Some(kind)
        }
        TxOutType::NullData => {
            if script_pubkey.len() > MAX_OP_RETURN_RELAY {
                return None;
            }
            Some(kind)
        }
        _ => Some(kind),
    }
}

/// IsStandardTx: 𝒯𝒳 → {standard} ∪ reason
///
/// 1. Version in [1, MAX_STANDARD_VERSION]
/// 2. Serialized size below MAX_STANDARD_TX_SIZE
/// 3. Every scriptSig is push-only and at most 1650 bytes
/// 4. Every output matches a template and is not dust
/// 5. At most one OP_RETURN output
pub fn is_standard_tx(tx: &Transaction, min_relay_fee: &FeeRate) -> Result<(), &'static str> {
    if tx.version > MAX_STANDARD_VERSION || tx.version < 1 {
        return Err("version");
    }
    if tx.serialized_size() >= MAX_STANDARD_TX_SIZE {
        return Err("tx-size");
    }
    for input in &tx.inputs {
        if input.script_sig.len() > MAX_STANDARD_SCRIPTSIG_SIZE {
            return Err("scriptsig-size");
        }
        if !is_push_only(&input.script_sig) {
            return Err("scriptsig-not-pushonly");
        }
    }

    let mut data_outputs = 0;
    for output in &tx.outputs {
        match is_standard(&output.script_pubkey) {
            None => return Err("scriptpubkey"),
            Some(TxOutType::NullData) => data_outputs += 1,
            Some(_) if is_dust(output, min_relay_fee) => return Err("dust"),
            Some(_) => {}
        }
    }
    if data_outputs > 1 {
        return Err("multi-op-return");
    }
    Ok(())
}

/// Every input spends a standard output, and P2SH redeem scripts stay
/// within the sigop ceiling
pub fn are_inputs_standard(tx: &Transaction, view: &impl CoinsView) -> bool {
    if tx.is_coinbase() {
        return true;
    }
    for input in &tx.inputs {
        let Some(coin) = view.get_coin(&input.prevout) else {
            return false;
        };
        let (kind, _) = solver(&coin.output.script_pubkey);
        match kind {
            TxOutType::NonStandard => return false,
            TxOutType::ScriptHash => {
                let mut stack = Vec::new();
                if eval_script(&mut stack, &input.script_sig, SCRIPT_VERIFY_NONE, &NullChecker).is_err() {
                    return false;
                }
                let Some(redeem_script) = stack.last() else {
                    return false;
                };
                if sig_op_count(redeem_script, true) > MAX_P2SH_SIGOPS {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// Checker that rejects every signature, for push-only evaluation
struct NullChecker;

impl SignatureChecker for NullChecker {
    fn check_sig(&self, _: &[u8], _: &[u8], _: &[u8]) -> bool {
        false
    }
    fn check_lock_time(&self, _: i64) -> bool {
        false
    }
    fn check_sequence(&self, _: i64) -> bool {
        false
    }
}
