//! Key-value storage abstraction and the block tree database
//!
//! The database engine itself is pluggable through [`KeyValueStore`];
//! [`MemoryStore`] backs tests and ephemeral nodes.

use crate::blockfile::BlockFileInfo;
use crate::chain::BlockIndexEntry;
use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::error::ConsensusError;
use crate::types::Hash;
use parking_lot::RwLock;
use primitive_types::U256;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Backend(String),
    #[error("corrupt record in {column}: {reason}")]
    Corrupt { column: &'static str, reason: String },
}

impl From<StoreError> for ConsensusError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Backend(message) => ConsensusError::Storage(message),
            StoreError::Corrupt { .. } => ConsensusError::Corrupt(err.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    Coins,
    BlockIndex,
    BlockFileInfo,
    Meta,
}

impl Column {
    pub fn as_str(self) -> &'static str {
        match self {
            Column::Coins => "coins",
            Column::BlockIndex => "block_index",
            Column::BlockFileInfo => "block_file_info",
            Column::Meta => "meta",
        }
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put { column: Column, key: Vec<u8>, value: Vec<u8> },
    Delete { column: Column, key: Vec<u8> },
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put { column, key: key.into(), value: value.into() });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete { column, key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    /// Apply all operations atomically and durably
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for &T {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        (**self).put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        (**self).delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        (**self).scan_prefix(column, prefix)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        (**self).write_batch(batch)
    }
}

/// Ordered in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<(Column, Vec<u8>), Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail, simulating a dying disk
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self, column: Column) -> usize {
        self.data.read().keys().filter(|(c, _)| *c == column).count()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write failed: store is read only".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.read().get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        self.data.write().insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        self.data.write().remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let data = self.data.read();
        Ok(data
            .range((column, prefix.to_vec())..)
            .take_while(|((c, key), _)| *c == column && key.starts_with(prefix))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut data = self.data.write();
        for op in batch.ops {
            match op {
                WriteOp::Put { column, key, value } => {
                    data.insert((column, key), value);
                }
                WriteOp::Delete { column, key } => {
                    data.remove(&(column, key));
                }
            }
        }
        Ok(())
    }
}

const LAST_BLOCK_FILE_KEY: &[u8] = b"last_block_file";

fn encode_index_entry(entry: &BlockIndexEntry, prev_hash: &Hash) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_bytes(prev_hash);
    encoder.write_i32_le(entry.height);
    encoder.write_u32_le(entry.status);
    encoder.write_u32_le(entry.file);
    encoder.write_u32_le(entry.data_pos);
    encoder.write_u32_le(entry.undo_pos);
    encoder.write_u32_le(entry.tx_count);
    encoder.write_i32_le(entry.version);
    encoder.write_bytes(&entry.merkle_root);
    encoder.write_u32_le(entry.time);
    encoder.write_u32_le(entry.bits);
    encoder.write_u32_le(entry.nonce);
    encoder.write_u8(u8::from(entry.proof_of_stake));
    encoder.write_i64_le(entry.money_supply);
    encoder.into_inner()
}

fn decode_index_entry(hash: Hash, bytes: &[u8]) -> Result<(BlockIndexEntry, Hash), DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let prev_hash = decoder.read_hash()?;
    let entry = BlockIndexEntry {
        hash,
        prev: None,
        skip: None,
        height: decoder.read_i32_le()?,
        chain_work: U256::zero(),
        status: decoder.read_u32_le()?,
        file: decoder.read_u32_le()?,
        data_pos: decoder.read_u32_le()?,
        undo_pos: decoder.read_u32_le()?,
        tx_count: decoder.read_u32_le()?,
        chain_tx: 0,
        sequence_id: 0,
        version: decoder.read_i32_le()?,
        merkle_root: decoder.read_hash()?,
        time: decoder.read_u32_le()?,
        bits: decoder.read_u32_le()?,
        nonce: decoder.read_u32_le()?,
        proof_of_stake: decoder.read_u8()? != 0,
        money_supply: decoder.read_i64_le()?,
    };
    decoder.finish()?;
    Ok((entry, prev_hash))
}

/// Persistent block index and block file metadata
pub struct BlockTreeDb<S> {
    store: S,
}

impl<S: KeyValueStore> BlockTreeDb<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Write file infos, the last file number and index entries as one
    /// durable batch. Entries are given with their parent hash.
    pub fn write_batch_sync(
        &self,
        file_infos: &[(u32, BlockFileInfo)],
        last_file: u32,
        entries: &[(&BlockIndexEntry, Hash)],
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for (file, info) in file_infos {
            batch.put(Column::BlockFileInfo, file.to_be_bytes().to_vec(), info.encode());
        }
        batch.put(Column::Meta, LAST_BLOCK_FILE_KEY.to_vec(), last_file.to_le_bytes().to_vec());
        for (entry, prev_hash) in entries {
            batch.put(Column::BlockIndex, entry.hash.to_vec(), encode_index_entry(entry, prev_hash));
        }
        self.store.write_batch(batch)
    }

    pub fn read_block_file_info(&self, file: u32) -> Result<Option<BlockFileInfo>, StoreError> {
        let Some(bytes) = self.store.get(Column::BlockFileInfo, &file.to_be_bytes())? else {
            return Ok(None);
        };
        BlockFileInfo::decode(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Corrupt { column: Column::BlockFileInfo.as_str(), reason: err.to_string() })
    }

    pub fn read_last_block_file(&self) -> Result<Option<u32>, StoreError> {
        let Some(bytes) = self.store.get(Column::Meta, LAST_BLOCK_FILE_KEY)? else {
            return Ok(None);
        };
        let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
            column: Column::Meta.as_str(),
            reason: "last block file is not four bytes".to_string(),
        })?;
        Ok(Some(u32::from_le_bytes(raw)))
    }

    /// All stored index entries with their parent hashes, ordered by height
    pub fn load_entries(&self) -> Result<Vec<(BlockIndexEntry, Hash)>, StoreError> {
        let mut entries = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::BlockIndex, &[])? {
            let hash: Hash = key.as_slice().try_into().map_err(|_| StoreError::Corrupt {
                column: Column::BlockIndex.as_str(),
                reason: "key is not a block hash".to_string(),
            })?;
            let decoded = decode_index_entry(hash, &value).map_err(|err| StoreError::Corrupt {
                column: Column::BlockIndex.as_str(),
                reason: err.to_string(),
            })?;
            entries.push(decoded);
        }
        entries.sort_by_key(|(entry, _)| entry.height);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{status, BlockIndex};
    use crate::types::BlockHeader;

    #[test]
    fn test_memory_store_scan_prefix_stays_in_column() {
        let store = MemoryStore::new();
        store.put(Column::Coins, b"ab1", b"x").unwrap();
        store.put(Column::Coins, b"ab2", b"y").unwrap();
        store.put(Column::Coins, b"b", b"z").unwrap();
        store.put(Column::Meta, b"ab3", b"w").unwrap();
        let found = store.scan_prefix(Column::Coins, b"ab").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(store.len(Column::Coins), 3);
    }

    #[test]
    fn test_failing_store_rejects_batches() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"k".to_vec(), b"v".to_vec());
        assert!(store.write_batch(batch).is_err());
        assert_eq!(store.get(Column::Meta, b"k").unwrap(), None);
    }

    #[test]
    fn test_block_tree_round_trip() {
        let store = MemoryStore::new();
        let db = BlockTreeDb::new(&store);
        let mut index = BlockIndex::new();
        let genesis = BlockHeader {
            version: 1,
            prev_block_hash: [0; 32],
            merkle_root: [1; 32],
            timestamp: 100,
            bits: 0x207fffff,
            nonce: 0,
        };
        let g = index.insert_header(&genesis, false);
        let child = BlockHeader { prev_block_hash: index.get(g).hash, timestamp: 200, ..genesis.clone() };
        let c = index.insert_header(&child, true);
        index.get_mut(c).status |= status::HAVE_DATA;
        index.get_mut(c).money_supply = 77;

        let info = BlockFileInfo { blocks: 2, size: 500, ..Default::default() };
        db.write_batch_sync(
            &[(0, info.clone())],
            0,
            &[(index.get(c), index.get(g).hash), (index.get(g), [0; 32])],
        )
        .unwrap();

        assert_eq!(db.read_last_block_file().unwrap(), Some(0));
        assert_eq!(db.read_block_file_info(0).unwrap(), Some(info));
        let loaded = db.load_entries().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0.height, 0);
        assert_eq!(loaded[1].1, index.get(g).hash);
        assert!(loaded[1].0.proof_of_stake);
        assert_eq!(loaded[1].0.money_supply, 77);
        assert!(loaded[1].0.have_data());
    }
}
