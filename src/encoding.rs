//! Consensus serialization and hashing
//!
//! Transactions serialize as `version, time, inputs, outputs, lock_time`
//! followed by the service reference hash on version 2 transactions. Blocks
//! serialize as the 80-byte header, the transactions and the block signature.

use crate::error::ConsensusError;
use crate::types::*;
use bitcoin_hashes::{sha256d, Hash as BitcoinHash};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of data")]
    UnexpectedEof,
    #[error("non-canonical compact size")]
    NonCanonicalSize,
    #[error("length {0} exceeds limit")]
    Oversized(u64),
    #[error("trailing bytes after value")]
    TrailingBytes,
}

impl From<DecodeError> for ConsensusError {
    fn from(err: DecodeError) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

/// Upper bound for any length prefix we accept while decoding
const MAX_DECODE_LENGTH: u64 = 0x0200_0000;

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_compact_size(&mut self, value: u64) {
        match value {
            0..=0xfc => self.write_u8(value as u8),
            0xfd..=0xffff => {
                self.write_u8(0xfd);
                self.buf.extend_from_slice(&(value as u16).to_le_bytes());
            }
            0x1_0000..=0xffff_ffff => {
                self.write_u8(0xfe);
                self.write_u32_le(value as u32);
            }
            _ => {
                self.write_u8(0xff);
                self.write_u64_le(value);
            }
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_compact_size(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32_le()? as i32)
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(self.read_u64_le()? as i64)
    }

    pub fn read_hash(&mut self) -> Result<Hash, DecodeError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32)?);
        Ok(out)
    }

    pub fn read_compact_size(&mut self) -> Result<u64, DecodeError> {
        let value = match self.read_u8()? {
            0xfd => {
                let v = self.read_u16_le()? as u64;
                if v < 0xfd {
                    return Err(DecodeError::NonCanonicalSize);
                }
                v
            }
            0xfe => {
                let v = self.read_u32_le()? as u64;
                if v < 0x1_0000 {
                    return Err(DecodeError::NonCanonicalSize);
                }
                v
            }
            0xff => {
                let v = self.read_u64_le()?;
                if v < 0x1_0000_0000 {
                    return Err(DecodeError::NonCanonicalSize);
                }
                v
            }
            small => small as u64,
        };
        if value > MAX_DECODE_LENGTH {
            return Err(DecodeError::Oversized(value));
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_compact_size()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes)
        }
    }
}

pub fn sha256(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d_hash(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

pub fn encode_transaction(encoder: &mut Encoder, tx: &Transaction) {
    encoder.write_i32_le(tx.version);
    encoder.write_u32_le(tx.time);
    encoder.write_compact_size(tx.inputs.len() as u64);
    for input in &tx.inputs {
        encoder.write_bytes(&input.prevout.hash);
        encoder.write_u32_le(input.prevout.index);
        encoder.write_var_bytes(&input.script_sig);
        encoder.write_u32_le(input.sequence);
    }
    encoder.write_compact_size(tx.outputs.len() as u64);
    for output in &tx.outputs {
        encoder.write_i64_le(output.value);
        encoder.write_var_bytes(&output.script_pubkey);
    }
    encoder.write_u32_le(tx.lock_time);
    if tx.version == 2 {
        encoder.write_bytes(&tx.service_reference_hash.unwrap_or([0u8; 32]));
    }
}

pub fn decode_transaction(decoder: &mut Decoder<'_>) -> Result<Transaction, DecodeError> {
    let version = decoder.read_i32_le()?;
    let time = decoder.read_u32_le()?;
    let input_count = decoder.read_compact_size()?;
    let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
    for _ in 0..input_count {
        let hash = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        inputs.push(TransactionInput {
            prevout: OutPoint::new(hash, index),
            script_sig,
            sequence,
        });
    }
    let output_count = decoder.read_compact_size()?;
    let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
    for _ in 0..output_count {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        outputs.push(TransactionOutput { value, script_pubkey });
    }
    let lock_time = decoder.read_u32_le()?;
    let service_reference_hash = if version == 2 {
        Some(decoder.read_hash()?)
    } else {
        None
    };
    Ok(Transaction {
        version,
        time,
        inputs,
        outputs,
        lock_time,
        service_reference_hash,
    })
}

pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encode_transaction(&mut encoder, tx);
    encoder.into_inner()
}

pub fn deserialize_transaction(bytes: &[u8]) -> Result<Transaction, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let tx = decode_transaction(&mut decoder)?;
    decoder.finish()?;
    Ok(tx)
}

pub fn transaction_hash(tx: &Transaction) -> Hash {
    sha256d_hash(&serialize_transaction(tx))
}

pub fn encode_header(encoder: &mut Encoder, header: &BlockHeader) {
    encoder.write_i32_le(header.version);
    encoder.write_bytes(&header.prev_block_hash);
    encoder.write_bytes(&header.merkle_root);
    encoder.write_u32_le(header.timestamp);
    encoder.write_u32_le(header.bits);
    encoder.write_u32_le(header.nonce);
}

pub fn decode_header(decoder: &mut Decoder<'_>) -> Result<BlockHeader, DecodeError> {
    Ok(BlockHeader {
        version: decoder.read_i32_le()?,
        prev_block_hash: decoder.read_hash()?,
        merkle_root: decoder.read_hash()?,
        timestamp: decoder.read_u32_le()?,
        bits: decoder.read_u32_le()?,
        nonce: decoder.read_u32_le()?,
    })
}

/// Serialize block header to its 80 consensus bytes
pub fn serialize_header(header: &BlockHeader) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encode_header(&mut encoder, header);
    encoder.into_inner()
}

pub fn block_header_hash(header: &BlockHeader) -> Hash {
    sha256d_hash(&serialize_header(header))
}

pub fn serialize_block(block: &Block) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encode_header(&mut encoder, &block.header);
    encoder.write_compact_size(block.transactions.len() as u64);
    for tx in &block.transactions {
        encode_transaction(&mut encoder, tx);
    }
    encoder.write_var_bytes(&block.signature);
    encoder.into_inner()
}

pub fn deserialize_block(bytes: &[u8]) -> Result<Block, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let header = decode_header(&mut decoder)?;
    let count = decoder.read_compact_size()?;
    let mut transactions = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        transactions.push(decode_transaction(&mut decoder)?);
    }
    let signature = decoder.read_var_bytes()?;
    decoder.finish()?;
    Ok(Block { header, transactions, signature })
}
