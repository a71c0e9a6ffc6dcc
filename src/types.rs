//! Core chain types for consensus validation

use serde::{Deserialize, Serialize};

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Monetary amount in base units
pub type Amount = i64;

/// Returns true if `value` is a valid money amount
pub fn money_range(value: Amount) -> bool {
    (0..=crate::constants::MAX_MONEY).contains(&value)
}

/// Hex of a hash in display (byte-reversed) order
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// OutPoint: 𝒪 = ℍ × ℕ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// The synthetic outpoint referenced by a coinbase input
    pub fn null() -> Self {
        Self { hash: [0u8; 32], index: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == u32::MAX
    }
}

/// Transaction Input: ℐ = 𝒪 × 𝕊 × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

/// Transaction Output: 𝒯 = ℤ × 𝕊
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Amount,
    pub script_pubkey: ByteString,
}

impl TransactionOutput {
    /// The empty output that marks a coinstake and a PoS coinbase
    pub fn empty() -> Self {
        Self { value: 0, script_pubkey: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

/// Transaction: 𝒯𝒳 = ℤ × ℕ × ℐ* × 𝒯* × ℕ × ℍ?
///
/// `time` is the proof-of-stake transaction timestamp. Version 2 transactions
/// pay for the service transaction named by `service_reference_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub time: u32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
    pub service_reference_hash: Option<Hash>,
}

impl Transaction {
    /// Exactly one input spending the null outpoint
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// ppcoin: a coinstake spends a real coin and has an empty first output
    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty()
            && !self.inputs[0].prevout.is_null()
            && self.outputs.len() >= 2
            && self.outputs[0].is_empty()
    }

    /// Sum of output values, `None` on overflow or out-of-range values
    pub fn value_out(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.outputs {
            if !money_range(output.value) {
                return None;
            }
            total = total.checked_add(output.value)?;
            if !money_range(total) {
                return None;
            }
        }
        Some(total)
    }

    pub fn txid(&self) -> Hash {
        crate::encoding::transaction_hash(self)
    }

    pub fn serialized_size(&self) -> usize {
        crate::encoding::serialize_transaction(self).len()
    }
}

/// Block Header: ℋ = ℤ × ℍ × ℍ × ℕ × ℕ × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        crate::encoding::block_header_hash(self)
    }
}

/// Block: ℬ = ℋ × 𝒯𝒳* × 𝕊
///
/// `signature` is the block signature made with the coinstake key on
/// proof-of-stake blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub signature: ByteString,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// A block is proof-of-stake iff its second transaction is a coinstake
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.is_proof_of_stake()
    }

    pub fn serialized_size(&self) -> usize {
        crate::encoding::serialize_block(self).len()
    }
}

/// Unspent output record
///
/// `is_coinbase` is set for outputs of both coinbase and coinstake
/// transactions. `time` is the creating transaction's timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub output: TransactionOutput,
    pub height: u32,
    pub is_coinbase: bool,
    pub time: u32,
}

impl Coin {
    pub fn new(output: TransactionOutput, height: u32, is_coinbase: bool, time: u32) -> Self {
        Self { output, height, is_coinbase, time }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(hash: Hash, index: u32) -> TransactionInput {
        TransactionInput {
            prevout: OutPoint::new(hash, index),
            script_sig: vec![],
            sequence: 0xffffffff,
        }
    }

    #[test]
    fn test_coinbase_shape() {
        let tx = Transaction {
            version: 1,
            time: 0,
            inputs: vec![TransactionInput {
                prevout: OutPoint::null(),
                script_sig: vec![0x51, 0x51],
                sequence: 0xffffffff,
            }],
            outputs: vec![TransactionOutput { value: 50, script_pubkey: vec![0x51] }],
            lock_time: 0,
            service_reference_hash: None,
        };
        assert!(tx.is_coinbase());
        assert!(!tx.is_coinstake());
    }

    #[test]
    fn test_coinstake_shape() {
        let tx = Transaction {
            version: 1,
            time: 0,
            inputs: vec![input([1; 32], 0)],
            outputs: vec![
                TransactionOutput::empty(),
                TransactionOutput { value: 50, script_pubkey: vec![0x51] },
            ],
            lock_time: 0,
            service_reference_hash: None,
        };
        assert!(tx.is_coinstake());
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn test_value_out_overflow() {
        let tx = Transaction {
            version: 1,
            time: 0,
            inputs: vec![input([1; 32], 0)],
            outputs: vec![
                TransactionOutput { value: crate::constants::MAX_MONEY, script_pubkey: vec![] },
                TransactionOutput { value: 1, script_pubkey: vec![] },
            ],
            lock_time: 0,
            service_reference_hash: None,
        };
        assert_eq!(tx.value_out(), None);
    }

    #[test]
    fn test_hash_to_hex_is_reversed() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        let hex = hash_to_hex(&hash);
        assert!(hex.ends_with("ab"));
        assert!(hex.starts_with("00"));
    }
}
