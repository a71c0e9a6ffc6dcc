//! Script execution engine
//!
//! A stack machine over the legacy opcode set with P2SH, CHECKLOCKTIMEVERIFY
//! and CHECKSEQUENCEVERIFY. Validation pipelines only see it through the
//! [`ScriptVerifier`] trait and the per-input [`SignatureChecker`].

use crate::constants::*;
use crate::encoding::{encode_transaction, sha256, sha256d_hash, Encoder};
use crate::types::*;
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use thiserror::Error;

pub const SCRIPT_VERIFY_NONE: u32 = 0;
pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: u32 = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: u32 = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: u32 = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: u32 = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: u32 = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: u32 = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: u32 = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: u32 = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;

pub const SIGHASH_ALL: u8 = 1;
pub const SIGHASH_NONE: u8 = 2;
pub const SIGHASH_SINGLE: u8 = 3;
pub const SIGHASH_ANYONECANPAY: u8 = 0x80;

pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_RESERVED: u8 = 0x50;
    pub const OP_1: u8 = 0x51;
    pub const OP_16: u8 = 0x60;
    pub const OP_NOP: u8 = 0x61;
    pub const OP_VER: u8 = 0x62;
    pub const OP_IF: u8 = 0x63;
    pub const OP_NOTIF: u8 = 0x64;
    pub const OP_VERIF: u8 = 0x65;
    pub const OP_VERNOTIF: u8 = 0x66;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_TOALTSTACK: u8 = 0x6b;
    pub const OP_FROMALTSTACK: u8 = 0x6c;
    pub const OP_2DROP: u8 = 0x6d;
    pub const OP_2DUP: u8 = 0x6e;
    pub const OP_3DUP: u8 = 0x6f;
    pub const OP_2OVER: u8 = 0x70;
    pub const OP_2ROT: u8 = 0x71;
    pub const OP_2SWAP: u8 = 0x72;
    pub const OP_IFDUP: u8 = 0x73;
    pub const OP_DEPTH: u8 = 0x74;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_NIP: u8 = 0x77;
    pub const OP_OVER: u8 = 0x78;
    pub const OP_PICK: u8 = 0x79;
    pub const OP_ROLL: u8 = 0x7a;
    pub const OP_ROT: u8 = 0x7b;
    pub const OP_SWAP: u8 = 0x7c;
    pub const OP_TUCK: u8 = 0x7d;
    pub const OP_CAT: u8 = 0x7e;
    pub const OP_SUBSTR: u8 = 0x7f;
    pub const OP_LEFT: u8 = 0x80;
    pub const OP_RIGHT: u8 = 0x81;
    pub const OP_SIZE: u8 = 0x82;
    pub const OP_INVERT: u8 = 0x83;
    pub const OP_AND: u8 = 0x84;
    pub const OP_OR: u8 = 0x85;
    pub const OP_XOR: u8 = 0x86;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_RESERVED1: u8 = 0x89;
    pub const OP_RESERVED2: u8 = 0x8a;
    pub const OP_1ADD: u8 = 0x8b;
    pub const OP_1SUB: u8 = 0x8c;
    pub const OP_2MUL: u8 = 0x8d;
    pub const OP_2DIV: u8 = 0x8e;
    pub const OP_NEGATE: u8 = 0x8f;
    pub const OP_ABS: u8 = 0x90;
    pub const OP_NOT: u8 = 0x91;
    pub const OP_0NOTEQUAL: u8 = 0x92;
    pub const OP_ADD: u8 = 0x93;
    pub const OP_SUB: u8 = 0x94;
    pub const OP_MUL: u8 = 0x95;
    pub const OP_DIV: u8 = 0x96;
    pub const OP_MOD: u8 = 0x97;
    pub const OP_LSHIFT: u8 = 0x98;
    pub const OP_RSHIFT: u8 = 0x99;
    pub const OP_BOOLAND: u8 = 0x9a;
    pub const OP_BOOLOR: u8 = 0x9b;
    pub const OP_NUMEQUAL: u8 = 0x9c;
    pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
    pub const OP_NUMNOTEQUAL: u8 = 0x9e;
    pub const OP_LESSTHAN: u8 = 0x9f;
    pub const OP_GREATERTHAN: u8 = 0xa0;
    pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
    pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
    pub const OP_MIN: u8 = 0xa3;
    pub const OP_MAX: u8 = 0xa4;
    pub const OP_WITHIN: u8 = 0xa5;
    pub const OP_RIPEMD160: u8 = 0xa6;
    pub const OP_SHA1: u8 = 0xa7;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_HASH256: u8 = 0xaa;
    pub const OP_CODESEPARATOR: u8 = 0xab;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    pub const OP_NOP1: u8 = 0xb0;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
    pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
    pub const OP_NOP4: u8 = 0xb3;
    pub const OP_NOP10: u8 = 0xb9;
}

use opcodes::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("Script evaluated without error but finished with a false/empty top stack element")]
    EvalFalse,
    #[error("OP_RETURN was encountered")]
    OpReturn,
    #[error("Script is too big")]
    ScriptSize,
    #[error("Push value size limit exceeded")]
    PushSize,
    #[error("Operation limit exceeded")]
    OpCount,
    #[error("Stack size limit exceeded")]
    StackSize,
    #[error("Signature count negative or greater than pubkey count")]
    SigCount,
    #[error("Pubkey count negative or limit exceeded")]
    PubkeyCount,
    #[error("Script failed an OP_VERIFY operation")]
    Verify,
    #[error("Script failed an OP_EQUALVERIFY operation")]
    EqualVerify,
    #[error("Script failed an OP_CHECKMULTISIGVERIFY operation")]
    CheckMultisigVerify,
    #[error("Script failed an OP_CHECKSIGVERIFY operation")]
    CheckSigVerify,
    #[error("Script failed an OP_NUMEQUALVERIFY operation")]
    NumEqualVerify,
    #[error("Opcode missing or not understood")]
    BadOpcode,
    #[error("Attempted to use a disabled opcode")]
    DisabledOpcode,
    #[error("Operation not valid with the current stack size")]
    InvalidStackOperation,
    #[error("Operation not valid with the current altstack size")]
    InvalidAltstackOperation,
    #[error("Invalid OP_IF construction")]
    UnbalancedConditional,
    #[error("Negative locktime")]
    NegativeLocktime,
    #[error("Locktime requirement not satisfied")]
    UnsatisfiedLocktime,
    #[error("Signature hash type missing or not understood")]
    SigHashType,
    #[error("Non-canonical DER signature")]
    SigDer,
    #[error("Data push larger than necessary")]
    MinimalData,
    #[error("Only non-push operators allowed in signatures")]
    SigPushOnly,
    #[error("Non-canonical signature: S value is unnecessarily high")]
    SigHighS,
    #[error("Dummy CHECKMULTISIG argument must be zero")]
    SigNullDummy,
    #[error("Public key is neither compressed or uncompressed")]
    PubkeyType,
    #[error("Extra items left on stack after execution")]
    CleanStack,
    #[error("NOPx reserved for soft-fork upgrades")]
    DiscourageUpgradableNops,
    #[error("Script number overflow")]
    NumOverflow,
}

type ScriptResult<T> = std::result::Result<T, ScriptError>;

/// Per-input signature and lock checks
pub trait SignatureChecker {
    fn check_sig(&self, signature: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool;
    fn check_lock_time(&self, lock_time: i64) -> bool;
    fn check_sequence(&self, sequence: i64) -> bool;
}

/// Verifies one input's unlocking script against the coin's locking script
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        flags: u32,
        checker: &dyn SignatureChecker,
    ) -> ScriptResult<()>;
}

/// The built-in interpreter
#[derive(Debug, Default, Clone, Copy)]
pub struct Interpreter;

impl ScriptVerifier for Interpreter {
    fn verify(
        &self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        flags: u32,
        checker: &dyn SignatureChecker,
    ) -> ScriptResult<()> {
        verify_script(script_sig, script_pubkey, flags, checker)
    }
}

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static CONTEXT: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::verification_only)
}

/// ECDSA check of a DER signature over a 32-byte digest
pub fn verify_digest_signature(pubkey: &[u8], der: &[u8], digest: &Hash) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(mut sig) = Signature::from_der_lax(der) else {
        return false;
    };
    sig.normalize_s();
    let Ok(message) = Message::from_digest_slice(digest) else {
        return false;
    };
    secp().verify_ecdsa(&message, &sig, &pubkey).is_ok()
}

/// Signature checker bound to (transaction, input index, amount)
pub struct TransactionSignatureChecker<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub amount: Amount,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize, amount: Amount) -> Self {
        Self { tx, input_index, amount }
    }
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(&self, signature: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool {
        let Some((&hash_type, der)) = signature.split_last() else {
            return false;
        };
        let sighash = signature_hash(script_code, self.tx, self.input_index, hash_type);
        verify_digest_signature(pubkey, der, &sighash)
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let tx_lock_time = self.tx.lock_time as i64;
        let threshold = LOCKTIME_THRESHOLD as i64;
        // Height locks and time locks are not comparable
        if !((tx_lock_time < threshold && lock_time < threshold)
            || (tx_lock_time >= threshold && lock_time >= threshold))
        {
            return false;
        }
        if lock_time > tx_lock_time {
            return false;
        }
        // A final input would let the lock time be bypassed
        self.tx
            .inputs
            .get(self.input_index)
            .map(|input| input.sequence != SEQUENCE_FINAL)
            .unwrap_or(false)
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        let Some(input) = self.tx.inputs.get(self.input_index) else {
            return false;
        };
        let tx_sequence = input.sequence as i64;
        if (self.tx.version as u32) < 2 {
            return false;
        }
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 != 0 {
            return false;
        }
        let mask = (SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK) as i64;
        let type_flag = SEQUENCE_LOCKTIME_TYPE_FLAG as i64;
        let tx_masked = tx_sequence & mask;
        let masked = sequence & mask;
        if !((tx_masked < type_flag && masked < type_flag)
            || (tx_masked >= type_flag && masked >= type_flag))
        {
            return false;
        }
        masked <= tx_masked
    }
}

/// Legacy signature hash
///
/// Out-of-range input index, or SIGHASH_SINGLE without a matching output,
/// hashes to one (the historical quirk).
pub fn signature_hash(script_code: &[u8], tx: &Transaction, input_index: usize, hash_type: u8) -> Hash {
    let mut one = [0u8; 32];
    one[0] = 1;
    if input_index >= tx.inputs.len() {
        return one;
    }
    let base_type = hash_type & 0x1f;
    if base_type == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        return one;
    }

    let script_code = remove_codeseparators(script_code);
    let mut tmp = tx.clone();
    for input in tmp.inputs.iter_mut() {
        input.script_sig.clear();
    }
    tmp.inputs[input_index].script_sig = script_code;

    if base_type == SIGHASH_NONE {
        tmp.outputs.clear();
        for (i, input) in tmp.inputs.iter_mut().enumerate() {
            if i != input_index {
                input.sequence = 0;
            }
        }
    } else if base_type == SIGHASH_SINGLE {
        tmp.outputs.truncate(input_index + 1);
        for output in tmp.outputs.iter_mut().take(input_index) {
            output.value = -1;
            output.script_pubkey.clear();
        }
        for (i, input) in tmp.inputs.iter_mut().enumerate() {
            if i != input_index {
                input.sequence = 0;
            }
        }
    }

    if hash_type & SIGHASH_ANYONECANPAY != 0 {
        let own = tmp.inputs[input_index].clone();
        tmp.inputs = vec![own];
    }

    let mut encoder = Encoder::new();
    encode_transaction(&mut encoder, &tmp);
    encoder.write_u32_le(hash_type as u32);
    sha256d_hash(&encoder.into_inner())
}

/// Parse one operation at `pc`, returning the opcode and any pushed data
pub fn next_op<'s>(script: &'s [u8], pc: &mut usize) -> ScriptResult<(u8, &'s [u8])> {
    let opcode = *script.get(*pc).ok_or(ScriptError::BadOpcode)?;
    *pc += 1;
    let len = match opcode {
        0x01..=0x4b => opcode as usize,
        OP_PUSHDATA1 => {
            let b = script.get(*pc).ok_or(ScriptError::BadOpcode)?;
            *pc += 1;
            *b as usize
        }
        OP_PUSHDATA2 => {
            let b = script.get(*pc..*pc + 2).ok_or(ScriptError::BadOpcode)?;
            *pc += 2;
            u16::from_le_bytes([b[0], b[1]]) as usize
        }
        OP_PUSHDATA4 => {
            let b = script.get(*pc..*pc + 4).ok_or(ScriptError::BadOpcode)?;
            *pc += 4;
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
        }
        _ => return Ok((opcode, &[])),
    };
    let end = pc.checked_add(len).ok_or(ScriptError::BadOpcode)?;
    let data = script.get(*pc..end).ok_or(ScriptError::BadOpcode)?;
    *pc = end;
    Ok((opcode, data))
}

fn remove_codeseparators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut pc = 0;
    while pc < script.len() {
        let start = pc;
        match next_op(script, &mut pc) {
            Ok((OP_CODESEPARATOR, _)) => {}
            Ok(_) => out.extend_from_slice(&script[start..pc]),
            Err(_) => {
                out.extend_from_slice(&script[start..]);
                break;
            }
        }
    }
    out
}

/// Remove every push of `data` that starts on an opcode boundary
fn find_and_delete(script: &[u8], data: &[u8]) -> Vec<u8> {
    let mut needle = Vec::new();
    push_data(&mut needle, data);
    if needle.is_empty() {
        return script.to_vec();
    }
    let mut out = Vec::with_capacity(script.len());
    let mut pc = 0;
    while pc < script.len() {
        if script[pc..].starts_with(&needle) {
            pc += needle.len();
            continue;
        }
        let start = pc;
        if next_op(script, &mut pc).is_err() {
            out.extend_from_slice(&script[start..]);
            break;
        }
        out.extend_from_slice(&script[start..pc]);
    }
    out
}

/// Append a minimal push of `data`
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// Append a number the way the script builder does (small ints as opcodes)
pub fn push_int(script: &mut Vec<u8>, value: i64) {
    if value == -1 || (1..=16).contains(&value) {
        script.push((value + (OP_1 as i64 - 1)) as u8);
    } else if value == 0 {
        script.push(OP_0);
    } else {
        push_data(script, &encode_num(value));
    }
}

pub fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out[out.len() - 1] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0 });
    } else if negative {
        let last = out.len() - 1;
        out[last] |= 0x80;
    }
    out
}

pub fn decode_num(bytes: &[u8], require_minimal: bool, max_len: usize) -> ScriptResult<i64> {
    if bytes.len() > max_len {
        return Err(ScriptError::NumOverflow);
    }
    if require_minimal && !bytes.is_empty() {
        let last = bytes[bytes.len() - 1];
        if last & 0x7f == 0 && (bytes.len() <= 1 || bytes[bytes.len() - 2] & 0x80 == 0) {
            return Err(ScriptError::MinimalData);
        }
    }
    if bytes.is_empty() {
        return Ok(0);
    }
    let mut result: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        result |= (*b as i64) << (8 * i);
    }
    let sign_bit = 0x80i64 << (8 * (bytes.len() - 1));
    if result & sign_bit != 0 {
        Ok(-(result & !sign_bit))
    } else {
        Ok(result)
    }
}

pub fn cast_to_bool(bytes: &[u8]) -> bool {
    for (i, b) in bytes.iter().enumerate() {
        if *b != 0 {
            // Negative zero is false
            return !(i == bytes.len() - 1 && *b == 0x80);
        }
    }
    false
}

fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && (1..=16).contains(&data[0]) {
        return false;
    }
    if data.len() == 1 && data[0] == 0x81 {
        return false;
    }
    if data.len() <= 75 {
        return opcode as usize == data.len();
    }
    if data.len() <= 255 {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 65535 {
        return opcode == OP_PUSHDATA2;
    }
    true
}

fn is_disabled(opcode: u8) -> bool {
    matches!(
        opcode,
        OP_CAT | OP_SUBSTR | OP_LEFT | OP_RIGHT | OP_INVERT | OP_AND | OP_OR | OP_XOR
            | OP_2MUL | OP_2DIV | OP_MUL | OP_DIV | OP_MOD | OP_LSHIFT | OP_RSHIFT
    )
}

/// BIP66 strict DER check over signature plus hash type byte
pub fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != sig.len() - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != sig.len() {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

fn is_low_der_signature(sig: &[u8]) -> ScriptResult<()> {
    if !is_valid_signature_encoding(sig) {
        return Err(ScriptError::SigDer);
    }
    let der = &sig[..sig.len() - 1];
    let parsed = Signature::from_der_lax(der).map_err(|_| ScriptError::SigDer)?;
    let mut normalized = parsed;
    normalized.normalize_s();
    if normalized != parsed {
        return Err(ScriptError::SigHighS);
    }
    Ok(())
}

fn check_signature_encoding(sig: &[u8], flags: u32) -> ScriptResult<()> {
    // Empty signature is a compact way to provide an invalid one
    if sig.is_empty() {
        return Ok(());
    }
    if flags & (SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_LOW_S | SCRIPT_VERIFY_STRICTENC) != 0
        && !is_valid_signature_encoding(sig)
    {
        return Err(ScriptError::SigDer);
    }
    if flags & SCRIPT_VERIFY_LOW_S != 0 {
        is_low_der_signature(sig)?;
    }
    if flags & SCRIPT_VERIFY_STRICTENC != 0 {
        let base = sig[sig.len() - 1] & !SIGHASH_ANYONECANPAY;
        if !(SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base) {
            return Err(ScriptError::SigHashType);
        }
    }
    Ok(())
}

fn check_pubkey_encoding(pubkey: &[u8], flags: u32) -> ScriptResult<()> {
    if flags & SCRIPT_VERIFY_STRICTENC != 0 && !is_compressed_or_uncompressed_pubkey(pubkey) {
        return Err(ScriptError::PubkeyType);
    }
    Ok(())
}

pub fn is_compressed_or_uncompressed_pubkey(pubkey: &[u8]) -> bool {
    match pubkey.first() {
        Some(0x04) => pubkey.len() == 65,
        Some(0x02) | Some(0x03) => pubkey.len() == 33,
        _ => false,
    }
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let digest = Ripemd160::digest(sha256(data));
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

fn stack_top(stack: &[Vec<u8>], depth: usize) -> ScriptResult<&Vec<u8>> {
    if depth == 0 || depth > stack.len() {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(&stack[stack.len() - depth])
}

fn pop(stack: &mut Vec<Vec<u8>>) -> ScriptResult<Vec<u8>> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn bool_bytes(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

/// EvalScript: 𝕊 × 𝕊* × ℕ → 𝕊* ∪ {error}
///
/// Runs `script` on `stack` under `flags`:
/// 1. Scripts over the size limit fail immediately
/// 2. Disabled opcodes fail even in unexecuted branches
/// 3. Non-push opcodes count against the operation limit
/// 4. Stack plus altstack depth is bounded after every opcode
/// 5. Every IF must be closed by the end of the script
pub fn eval_script(
    stack: &mut Vec<Vec<u8>>,
    script: &[u8],
    flags: u32,
    checker: &dyn SignatureChecker,
) -> ScriptResult<()> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let require_minimal = flags & SCRIPT_VERIFY_MINIMALDATA != 0;
    let mut pc = 0usize;
    let mut code_hash_start = 0usize;
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut altstack: Vec<Vec<u8>> = Vec::new();
    let mut op_count = 0usize;

    while pc < script.len() {
        let executing = !exec_stack.contains(&false);
        let (opcode, data) = next_op(script, &mut pc)?;

        if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode);
        }

        if executing && opcode <= OP_PUSHDATA4 {
            if require_minimal && !check_minimal_push(data, opcode) {
                return Err(ScriptError::MinimalData);
            }
            stack.push(data.to_vec());
        } else if executing || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let n = opcode as i64 - (OP_1 as i64 - 1);
                    stack.push(encode_num(n));
                }
                OP_NOP | OP_NOP1 | OP_NOP4..=OP_NOP10 => {
                    if flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }
                OP_CHECKLOCKTIMEVERIFY => {
                    if flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY == 0 {
                        if flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        let lock_time = decode_num(stack_top(stack, 1)?, require_minimal, 5)?;
                        if lock_time < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if !checker.check_lock_time(lock_time) {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_CHECKSEQUENCEVERIFY => {
                    if flags & SCRIPT_VERIFY_CHECKSEQUENCEVERIFY == 0 {
                        if flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        let sequence = decode_num(stack_top(stack, 1)?, require_minimal, 5)?;
                        if sequence < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 == 0
                            && !checker.check_sequence(sequence)
                        {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let top = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                        value = cast_to_bool(&top);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec_stack.push(value);
                }
                OP_ELSE => {
                    let last = exec_stack.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }
                OP_ENDIF => {
                    exec_stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    let top = pop(stack)?;
                    if !cast_to_bool(&top) {
                        return Err(ScriptError::Verify);
                    }
                }
                OP_RETURN => return Err(ScriptError::OpReturn),
                OP_TOALTSTACK => {
                    let top = pop(stack)?;
                    altstack.push(top);
                }
                OP_FROMALTSTACK => {
                    let top = altstack.pop().ok_or(ScriptError::InvalidAltstackOperation)?;
                    stack.push(top);
                }
                OP_2DROP => {
                    stack_top(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }
                OP_2DUP => {
                    let a = stack_top(stack, 2)?.clone();
                    let b = stack_top(stack, 1)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_3DUP => {
                    let a = stack_top(stack, 3)?.clone();
                    let b = stack_top(stack, 2)?.clone();
                    let c = stack_top(stack, 1)?.clone();
                    stack.push(a);
                    stack.push(b);
                    stack.push(c);
                }
                OP_2OVER => {
                    let a = stack_top(stack, 4)?.clone();
                    let b = stack_top(stack, 3)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_2ROT => {
                    stack_top(stack, 6)?;
                    let at = stack.len() - 6;
                    let a = stack.remove(at);
                    let b = stack.remove(at);
                    stack.push(a);
                    stack.push(b);
                }
                OP_2SWAP => {
                    stack_top(stack, 4)?;
                    let n = stack.len();
                    stack.swap(n - 4, n - 2);
                    stack.swap(n - 3, n - 1);
                }
                OP_IFDUP => {
                    let top = stack_top(stack, 1)?.clone();
                    if cast_to_bool(&top) {
                        stack.push(top);
                    }
                }
                OP_DEPTH => {
                    let depth = stack.len() as i64;
                    stack.push(encode_num(depth));
                }
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let top = stack_top(stack, 1)?.clone();
                    stack.push(top);
                }
                OP_NIP => {
                    stack_top(stack, 2)?;
                    let at = stack.len() - 2;
                    stack.remove(at);
                }
                OP_OVER => {
                    let second = stack_top(stack, 2)?.clone();
                    stack.push(second);
                }
                OP_PICK | OP_ROLL => {
                    let n = decode_num(&pop(stack)?, require_minimal, 4)?;
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let at = stack.len() - 1 - n as usize;
                    let item = if opcode == OP_ROLL {
                        stack.remove(at)
                    } else {
                        stack[at].clone()
                    };
                    stack.push(item);
                }
                OP_ROT => {
                    stack_top(stack, 3)?;
                    let at = stack.len() - 3;
                    let item = stack.remove(at);
                    stack.push(item);
                }
                OP_SWAP => {
                    stack_top(stack, 2)?;
                    let n = stack.len();
                    stack.swap(n - 2, n - 1);
                }
                OP_TUCK => {
                    stack_top(stack, 2)?;
                    let top = stack[stack.len() - 1].clone();
                    let at = stack.len() - 2;
                    stack.insert(at, top);
                }
                OP_SIZE => {
                    let size = stack_top(stack, 1)?.len() as i64;
                    stack.push(encode_num(size));
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        stack.push(bool_bytes(equal));
                    }
                }
                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = decode_num(&pop(stack)?, require_minimal, 4)?;
                    let result = match opcode {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.push(encode_num(result));
                }
                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    let b = decode_num(&pop(stack)?, require_minimal, 4)?;
                    let a = decode_num(&pop(stack)?, require_minimal, 4)?;
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    if opcode == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::NumEqualVerify);
                        }
                    } else {
                        stack.push(encode_num(result));
                    }
                }
                OP_WITHIN => {
                    let max = decode_num(&pop(stack)?, require_minimal, 4)?;
                    let min = decode_num(&pop(stack)?, require_minimal, 4)?;
                    let x = decode_num(&pop(stack)?, require_minimal, 4)?;
                    stack.push(bool_bytes(min <= x && x < max));
                }
                OP_RIPEMD160 | OP_SHA1 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                    let item = pop(stack)?;
                    let digest = match opcode {
                        OP_RIPEMD160 => Ripemd160::digest(&item).to_vec(),
                        OP_SHA1 => Sha1::digest(&item).to_vec(),
                        OP_SHA256 => Sha256::digest(&item).to_vec(),
                        OP_HASH160 => hash160(&item).to_vec(),
                        _ => sha256d_hash(&item).to_vec(),
                    };
                    stack.push(digest);
                }
                OP_CODESEPARATOR => {
                    code_hash_start = pc;
                }
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = pop(stack)?;
                    let sig = pop(stack)?;
                    let script_code = find_and_delete(&script[code_hash_start..], &sig);
                    check_signature_encoding(&sig, flags)?;
                    check_pubkey_encoding(&pubkey, flags)?;
                    let ok = checker.check_sig(&sig, &pubkey, &script_code);
                    if opcode == OP_CHECKSIGVERIFY {
                        if !ok {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        stack.push(bool_bytes(ok));
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let ok = eval_checkmultisig(
                        stack,
                        &script[code_hash_start..],
                        flags,
                        checker,
                        &mut op_count,
                    )?;
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !ok {
                            return Err(ScriptError::CheckMultisigVerify);
                        }
                    } else {
                        stack.push(bool_bytes(ok));
                    }
                }
                _ => return Err(ScriptError::BadOpcode),
            }
        }

        if stack.len() + altstack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn eval_checkmultisig(
    stack: &mut Vec<Vec<u8>>,
    script_code: &[u8],
    flags: u32,
    checker: &dyn SignatureChecker,
    op_count: &mut usize,
) -> ScriptResult<bool> {
    let require_minimal = flags & SCRIPT_VERIFY_MINIMALDATA != 0;
    let key_count = decode_num(&pop(stack)?, require_minimal, 4)?;
    if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
        return Err(ScriptError::PubkeyCount);
    }
    *op_count += key_count as usize;
    if *op_count > MAX_OPS_PER_SCRIPT {
        return Err(ScriptError::OpCount);
    }
    let mut pubkeys = Vec::with_capacity(key_count as usize);
    for _ in 0..key_count {
        pubkeys.push(pop(stack)?);
    }
    let sig_count = decode_num(&pop(stack)?, require_minimal, 4)?;
    if sig_count < 0 || sig_count > key_count {
        return Err(ScriptError::SigCount);
    }
    let mut sigs = Vec::with_capacity(sig_count as usize);
    for _ in 0..sig_count {
        sigs.push(pop(stack)?);
    }

    let mut script_code = script_code.to_vec();
    for sig in &sigs {
        script_code = find_and_delete(&script_code, sig);
    }

    // Keys and signatures were popped top-first, which is script order
    let mut key_idx = 0usize;
    let mut sig_idx = 0usize;
    let mut success = true;
    while success && sig_idx < sigs.len() {
        let sig = &sigs[sig_idx];
        let pubkey = &pubkeys[key_idx];
        check_signature_encoding(sig, flags)?;
        check_pubkey_encoding(pubkey, flags)?;
        if checker.check_sig(sig, pubkey, &script_code) {
            sig_idx += 1;
        }
        key_idx += 1;
        if sigs.len() - sig_idx > pubkeys.len() - key_idx {
            success = false;
        }
    }

    // The historical off-by-one consumes one extra element
    let dummy = pop(stack)?;
    if flags & SCRIPT_VERIFY_NULLDUMMY != 0 && !dummy.is_empty() {
        return Err(ScriptError::SigNullDummy);
    }
    Ok(success)
}

pub fn is_push_only(script: &[u8]) -> bool {
    let mut pc = 0;
    while pc < script.len() {
        match next_op(script, &mut pc) {
            Ok((opcode, _)) if opcode <= OP_16 => {}
            _ => return false,
        }
    }
    true
}

pub fn is_pay_to_script_hash(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// VerifyScript: 𝕊 × 𝕊 × ℕ → {ok} ∪ ScriptError
///
/// 1. Under SIGPUSHONLY the unlocking script must be push-only
/// 2. Run the unlocking script, then the locking script on the result
/// 3. The top element must be true
/// 4. Under P2SH, a hash-locked output additionally runs the serialized
///    redeem script from a copy of the unlocking stack
/// 5. Under CLEANSTACK exactly one element must remain
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    flags: u32,
    checker: &dyn SignatureChecker,
) -> ScriptResult<()> {
    if flags & SCRIPT_VERIFY_SIGPUSHONLY != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker)?;
    let stack_copy = if flags & SCRIPT_VERIFY_P2SH != 0 {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(&mut stack, script_pubkey, flags, checker)?;
    match stack.last() {
        Some(top) if cast_to_bool(top) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    if flags & SCRIPT_VERIFY_P2SH != 0 && is_pay_to_script_hash(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_copy;
        let redeem_script = stack.pop().ok_or(ScriptError::EvalFalse)?;
        eval_script(&mut stack, &redeem_script, flags, checker)?;
        match stack.last() {
            Some(top) if cast_to_bool(top) => {}
            _ => return Err(ScriptError::EvalFalse),
        }
    }

    if flags & SCRIPT_VERIFY_CLEANSTACK != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}

/// Signature operations in a script
///
/// Inaccurate counting charges every CHECKMULTISIG the maximum key count.
pub fn sig_op_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut pc = 0;
    let mut last_opcode = 0xffu8;
    while pc < script.len() {
        let Ok((opcode, _)) = next_op(script, &mut pc) else {
            break;
        };
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    count += (last_opcode - OP_1 + 1) as u32;
                } else {
                    count += MAX_PUBKEYS_PER_MULTISIG as u32;
                }
            }
            _ => {}
        }
        last_opcode = opcode;
    }
    count
}

/// Accurate sigops of the redeem script for a P2SH spend
pub fn p2sh_sig_op_count(script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    if !is_pay_to_script_hash(script_pubkey) {
        return sig_op_count(script_pubkey, true);
    }
    let mut pc = 0;
    let mut last_push: &[u8] = &[];
    while pc < script_sig.len() {
        match next_op(script_sig, &mut pc) {
            Ok((opcode, data)) if opcode <= OP_16 => last_push = data,
            _ => return 0,
        }
    }
    sig_op_count(last_push, true)
}

/// Standard output templates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutType {
    NonStandard,
    PubKey,
    PubKeyHash,
    ScriptHash,
    Multisig,
    NullData,
}

/// Match a locking script against the standard templates
///
/// Returns the template and its solutions (keys, key hashes or
/// `[m, keys.., n]` for multisig).
pub fn solver(script: &[u8]) -> (TxOutType, Vec<Vec<u8>>) {
    if is_pay_to_script_hash(script) {
        return (TxOutType::ScriptHash, vec![script[2..22].to_vec()]);
    }
    if script.first() == Some(&OP_RETURN) && is_push_only(&script[1..]) {
        return (TxOutType::NullData, Vec::new());
    }
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        return (TxOutType::PubKeyHash, vec![script[3..23].to_vec()]);
    }
    if (script.len() == 35 && script[0] == 33 || script.len() == 67 && script[0] == 65)
        && script[script.len() - 1] == OP_CHECKSIG
    {
        let key = script[1..script.len() - 1].to_vec();
        if is_compressed_or_uncompressed_pubkey(&key) {
            return (TxOutType::PubKey, vec![key]);
        }
    }
    if let Some(solutions) = match_multisig(script) {
        return (TxOutType::Multisig, solutions);
    }
    (TxOutType::NonStandard, Vec::new())
}

fn match_multisig(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    if script.last() != Some(&OP_CHECKMULTISIG) {
        return None;
    }
    let mut pc = 0;
    let (m_op, _) = next_op(script, &mut pc).ok()?;
    if !(OP_1..=OP_16).contains(&m_op) {
        return None;
    }
    let mut keys = Vec::new();
    loop {
        let (opcode, data) = next_op(script, &mut pc).ok()?;
        if (OP_1..=OP_16).contains(&opcode) {
            let m = (m_op - OP_1 + 1) as usize;
            let n = (opcode - OP_1 + 1) as usize;
            if keys.len() != n || m > n || pc != script.len() - 1 {
                return None;
            }
            let mut solutions = vec![vec![m as u8]];
            solutions.extend(keys);
            solutions.push(vec![n as u8]);
            return Some(solutions);
        }
        if !is_compressed_or_uncompressed_pubkey(data) {
            return None;
        }
        keys.push(data.to_vec());
    }
}

pub fn p2pkh_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160];
    push_data(&mut script, key_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::new();
    push_data(&mut script, pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2sh_script(redeem_script: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_HASH160];
    push_data(&mut script, &hash160(redeem_script));
    script.push(OP_EQUAL);
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    struct NoChecker;

    impl SignatureChecker for NoChecker {
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

    fn spend_of(script_pubkey: Vec<u8>) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            inputs: vec![TransactionInput {
                prevout: OutPoint::new([3; 32], 0),
                script_sig: vec![],
                sequence: 0xffffffff,
            }],
            outputs: vec![TransactionOutput { value: 900, script_pubkey }],
            lock_time: 0,
            service_reference_hash: None,
        }
    }

    fn sign(tx: &Transaction, script_code: &[u8], key: &SecretKey) -> Vec<u8> {
        let secp = Secp256k1::new();
        let hash = signature_hash(script_code, tx, 0, SIGHASH_ALL);
        let msg = Message::from_digest_slice(&hash).unwrap();
        let mut sig = secp.sign_ecdsa(&msg, key).serialize_der().to_vec();
        sig.push(SIGHASH_ALL);
        sig
    }

    #[test]
    fn test_eval_script_simple() {
        let mut stack = Vec::new();
        eval_script(&mut stack, &[OP_1], 0, &NoChecker).unwrap();
        assert_eq!(stack, vec![vec![1u8]]);
    }

    #[test]
    fn test_disabled_opcode_fails_in_unexecuted_branch() {
        let script = [OP_0, OP_IF, OP_CAT, OP_ENDIF, OP_1];
        let mut stack = Vec::new();
        assert_eq!(
            eval_script(&mut stack, &script, 0, &NoChecker),
            Err(ScriptError::DisabledOpcode)
        );
    }

    #[test]
    fn test_unbalanced_conditional() {
        let mut stack = Vec::new();
        assert_eq!(
            eval_script(&mut stack, &[OP_1, OP_IF], 0, &NoChecker),
            Err(ScriptError::UnbalancedConditional)
        );
    }

    #[test]
    fn test_if_else_branches() {
        let script = [OP_0, OP_IF, OP_RETURN, OP_ELSE, 0x52, OP_ENDIF];
        let mut stack = Vec::new();
        eval_script(&mut stack, &script, 0, &NoChecker).unwrap();
        assert_eq!(stack, vec![vec![2u8]]);
    }

    #[test]
    fn test_stack_overflow() {
        let script = vec![OP_1; MAX_STACK_SIZE + 1];
        let mut stack = Vec::new();
        assert_eq!(
            eval_script(&mut stack, &script, 0, &NoChecker),
            Err(ScriptError::StackSize)
        );
    }

    #[test]
    fn test_script_num_round_trip_edges() {
        for n in [0i64, 1, -1, 127, 128, -128, 255, 256, 0x7fff_ffff, -0x7fff_ffff] {
            assert_eq!(decode_num(&encode_num(n), true, 4).unwrap(), n);
        }
        assert_eq!(decode_num(&[0x00], true, 4), Err(ScriptError::MinimalData));
        assert_eq!(decode_num(&[1, 2, 3, 4, 5], false, 4), Err(ScriptError::NumOverflow));
    }

    #[test]
    fn test_negative_zero_is_false() {
        assert!(!cast_to_bool(&[0x00, 0x80]));
        assert!(cast_to_bool(&[0x80, 0x00]));
    }

    #[test]
    fn test_p2pkh_spend_verifies() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &key).serialize();
        let script_pubkey = p2pkh_script(&hash160(&pubkey));

        let mut tx = spend_of(vec![OP_1]);
        let sig = sign(&tx, &script_pubkey, &key);
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        push_data(&mut script_sig, &pubkey);
        tx.inputs[0].script_sig = script_sig.clone();

        let checker = TransactionSignatureChecker::new(&tx, 0, 1000);
        let flags = SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_STRICTENC | SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_LOW_S;
        assert_eq!(verify_script(&script_sig, &script_pubkey, flags, &checker), Ok(()));

        // Changing an output invalidates the signature
        let mut tampered = tx.clone();
        tampered.outputs[0].value = 901;
        let checker = TransactionSignatureChecker::new(&tampered, 0, 1000);
        assert_eq!(
            verify_script(&script_sig, &script_pubkey, flags, &checker),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn test_p2sh_redeem_script_runs() {
        let redeem = vec![OP_1, OP_1, OP_ADD, 0x52, OP_EQUAL];
        let script_pubkey = p2sh_script(&redeem);
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &redeem);
        let tx = spend_of(vec![OP_1]);
        let checker = TransactionSignatureChecker::new(&tx, 0, 0);
        assert_eq!(verify_script(&script_sig, &script_pubkey, SCRIPT_VERIFY_P2SH, &checker), Ok(()));

        let bad_redeem = vec![OP_1, OP_1, OP_ADD, 0x53, OP_EQUAL];
        let mut bad_sig = Vec::new();
        push_data(&mut bad_sig, &bad_redeem);
        assert_eq!(
            verify_script(&bad_sig, &p2sh_script(&bad_redeem), SCRIPT_VERIFY_P2SH, &checker),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn test_cleanstack() {
        let tx = spend_of(vec![OP_1]);
        let checker = TransactionSignatureChecker::new(&tx, 0, 0);
        let flags = SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_CLEANSTACK;
        assert_eq!(verify_script(&[OP_1, OP_1], &[OP_1], flags, &checker), Err(ScriptError::CleanStack));
        assert_eq!(verify_script(&[], &[OP_1], flags, &checker), Ok(()));
    }

    #[test]
    fn test_checklocktimeverify() {
        let mut tx = spend_of(vec![OP_1]);
        tx.lock_time = 100;
        tx.inputs[0].sequence = 0;
        let mut script_pubkey = Vec::new();
        push_int(&mut script_pubkey, 90);
        script_pubkey.push(OP_CHECKLOCKTIMEVERIFY);
        let checker = TransactionSignatureChecker::new(&tx, 0, 0);
        assert_eq!(
            verify_script(&[], &script_pubkey, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, &checker),
            Ok(())
        );

        let mut too_late = Vec::new();
        push_int(&mut too_late, 101);
        too_late.push(OP_CHECKLOCKTIMEVERIFY);
        assert_eq!(
            verify_script(&[], &too_late, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, &checker),
            Err(ScriptError::UnsatisfiedLocktime)
        );

        // Without the flag it is a NOP
        assert_eq!(verify_script(&[], &too_late, 0, &checker), Ok(()));
    }

    #[test]
    fn test_checksequenceverify_requires_version_two() {
        let mut tx = spend_of(vec![OP_1]);
        tx.inputs[0].sequence = 10;
        let mut script_pubkey = Vec::new();
        push_int(&mut script_pubkey, 5);
        script_pubkey.push(OP_CHECKSEQUENCEVERIFY);

        let checker = TransactionSignatureChecker::new(&tx, 0, 0);
        assert_eq!(
            verify_script(&[], &script_pubkey, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, &checker),
            Err(ScriptError::UnsatisfiedLocktime)
        );

        tx.version = 2;
        tx.service_reference_hash = Some([0; 32]);
        let checker = TransactionSignatureChecker::new(&tx, 0, 0);
        assert_eq!(
            verify_script(&[], &script_pubkey, SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, &checker),
            Ok(())
        );
    }

    #[test]
    fn test_multisig_nulldummy() {
        let script_pubkey = vec![OP_0, OP_0, OP_CHECKMULTISIG];
        let tx = spend_of(vec![OP_1]);
        let checker = TransactionSignatureChecker::new(&tx, 0, 0);
        // 0-of-0 multisig succeeds with an empty dummy
        assert_eq!(verify_script(&[OP_0], &script_pubkey, SCRIPT_VERIFY_NULLDUMMY, &checker), Ok(()));
        assert_eq!(
            verify_script(&[OP_1], &script_pubkey, SCRIPT_VERIFY_NULLDUMMY, &checker),
            Err(ScriptError::SigNullDummy)
        );
    }

    #[test]
    fn test_sig_op_counting() {
        let multisig = vec![OP_1, OP_0 + 33, OP_CHECKMULTISIG];
        assert_eq!(sig_op_count(&[OP_CHECKSIG, OP_CHECKSIGVERIFY], false), 2);
        assert_eq!(sig_op_count(&[0x52, OP_CHECKMULTISIG], true), 2);
        assert_eq!(sig_op_count(&[0x52, OP_CHECKMULTISIG], false), 20);
        // Truncated push stops counting
        assert_eq!(sig_op_count(&multisig, true), 0);

        let redeem = vec![0x52, OP_CHECKMULTISIG];
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &redeem);
        assert_eq!(p2sh_sig_op_count(&p2sh_script(&redeem), &script_sig), 2);
    }

    #[test]
    fn test_solver_templates() {
        let key = [0x02; 33];
        assert_eq!(solver(&p2pk_script(&key)).0, TxOutType::PubKey);
        assert_eq!(solver(&p2pkh_script(&[1; 20])).0, TxOutType::PubKeyHash);
        assert_eq!(solver(&p2sh_script(&[OP_1])).0, TxOutType::ScriptHash);
        assert_eq!(solver(&[OP_RETURN, 0x01, 0xaa]).0, TxOutType::NullData);

        let mut multisig = vec![OP_1];
        push_data(&mut multisig, &key);
        push_data(&mut multisig, &[0x03; 33]);
        multisig.push(0x52);
        multisig.push(OP_CHECKMULTISIG);
        let (kind, solutions) = solver(&multisig);
        assert_eq!(kind, TxOutType::Multisig);
        assert_eq!(solutions.first(), Some(&vec![1u8]));
        assert_eq!(solutions.last(), Some(&vec![2u8]));

        assert_eq!(solver(&[OP_1]).0, TxOutType::NonStandard);
    }

    #[test]
    fn test_strict_der_encoding() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let msg = Message::from_digest_slice(&[0x44; 32]).unwrap();
        let mut sig = secp.sign_ecdsa(&msg, &key).serialize_der().to_vec();
        sig.push(SIGHASH_ALL);
        assert!(is_valid_signature_encoding(&sig));
        sig[0] = 0x31;
        assert!(!is_valid_signature_encoding(&sig));
    }
}
