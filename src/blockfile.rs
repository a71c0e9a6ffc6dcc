//! Flat block and undo files
//!
//! Blocks are appended to `blocks/blkNNNNN.dat` and their undo data to
//! `blocks/revNNNNN.dat`. Every record is prefixed by the network magic and
//! its length; positions point at the record body. Files are pre-allocated
//! in chunks and truncated to their used size when finalized.

use crate::constants::*;
use crate::encoding::{deserialize_block, serialize_block, DecodeError, Decoder, Encoder};
use crate::error::{ConsensusError, Result};
use crate::types::*;
use crate::undo::{undo_checksum, BlockUndo};
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Per-file bookkeeping, persisted in the block tree database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockFileInfo {
    pub blocks: u32,
    pub size: u32,
    pub undo_size: u32,
    pub height_first: u32,
    pub height_last: u32,
    pub time_first: u64,
    pub time_last: u64,
}

impl BlockFileInfo {
    pub fn add_block(&mut self, height: u32, time: u64) {
        if self.blocks == 0 || self.height_first > height {
            self.height_first = height;
        }
        if self.blocks == 0 || self.time_first > time {
            self.time_first = time;
        }
        self.blocks += 1;
        self.height_last = self.height_last.max(height);
        self.time_last = self.time_last.max(time);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.blocks);
        encoder.write_u32_le(self.size);
        encoder.write_u32_le(self.undo_size);
        encoder.write_u32_le(self.height_first);
        encoder.write_u32_le(self.height_last);
        encoder.write_u64_le(self.time_first);
        encoder.write_u64_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let info = Self {
            blocks: decoder.read_u32_le()?,
            size: decoder.read_u32_le()?,
            undo_size: decoder.read_u32_le()?,
            height_first: decoder.read_u32_le()?,
            height_last: decoder.read_u32_le()?,
            time_first: decoder.read_u64_le()?,
            time_last: decoder.read_u64_le()?,
        };
        decoder.finish()?;
        Ok(info)
    }
}

/// Position of a record body inside a numbered file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskPos {
    pub file: u32,
    pub pos: u32,
}

/// One family of numbered flat files sharing a prefix
#[derive(Debug, Clone)]
pub struct FlatFileStore {
    dir: PathBuf,
    prefix: &'static str,
    chunk_size: u32,
}

impl FlatFileStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: &'static str, chunk_size: u32) -> Self {
        Self { dir: dir.into(), prefix, chunk_size }
    }

    pub fn path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("{}{:05}.dat", self.prefix, file))
    }

    /// Open file `pos.file` positioned at `pos.pos`
    pub fn open(&self, pos: DiskPos, read_only: bool) -> Result<File> {
        let path = self.path(pos.file);
        let mut file = if read_only {
            File::open(&path)?
        } else {
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?
        };
        file.seek(SeekFrom::Start(pos.pos as u64))?;
        Ok(file)
    }

    /// Bytes to pre-allocate when a file grows from `old_size` to
    /// `new_size`, or zero if no new chunk is needed
    pub fn allocation_needed(&self, old_size: u32, new_size: u32) -> u64 {
        let chunk = self.chunk_size as u64;
        let old_chunks = (old_size as u64 + chunk - 1) / chunk;
        let new_chunks = (new_size as u64 + chunk - 1) / chunk;
        if new_chunks > old_chunks {
            new_chunks * chunk - old_size as u64
        } else {
            0
        }
    }

    pub fn allocate(&self, file: u32, offset: u32, length: u64) -> Result<()> {
        let handle = self.open(DiskPos { file, pos: 0 }, false)?;
        handle.allocate(offset as u64 + length)?;
        Ok(())
    }

    /// Sync file contents, truncating to `size` first when finalizing
    pub fn flush(&self, file: u32, size: u32, finalize: bool) -> Result<()> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(());
        }
        let handle = OpenOptions::new().write(true).open(&path)?;
        if finalize {
            handle.set_len(size as u64)?;
        }
        handle.sync_all()?;
        Ok(())
    }
}

/// Block and undo file bookkeeping
pub struct BlockFiles {
    dir: PathBuf,
    magic: [u8; 4],
    min_disk_space: u64,
    blocks: FlatFileStore,
    undo: FlatFileStore,
    info: Vec<BlockFileInfo>,
    last_file: u32,
    dirty: BTreeSet<u32>,
}

impl BlockFiles {
    pub fn new(dir: impl AsRef<Path>, magic: [u8; 4], min_disk_space: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            blocks: FlatFileStore::new(&dir, "blk", BLOCKFILE_CHUNK_SIZE),
            undo: FlatFileStore::new(&dir, "rev", UNDOFILE_CHUNK_SIZE),
            dir,
            magic,
            min_disk_space,
            info: vec![BlockFileInfo::default()],
            last_file: 0,
            dirty: BTreeSet::new(),
        })
    }

    /// Restore bookkeeping read from the block tree database
    pub fn load(&mut self, infos: Vec<BlockFileInfo>, last_file: u32) {
        self.info = infos;
        if self.info.len() <= last_file as usize {
            self.info.resize(last_file as usize + 1, BlockFileInfo::default());
        }
        self.last_file = last_file;
        self.dirty.clear();
    }

    pub fn last_file(&self) -> u32 {
        self.last_file
    }

    pub fn info(&self, file: u32) -> Option<&BlockFileInfo> {
        self.info.get(file as usize)
    }

    /// True when `additional` bytes still leave the configured reserve free
    pub fn check_disk_space(&self, additional: u64) -> bool {
        match fs2::available_space(&self.dir) {
            Ok(free) => free >= self.min_disk_space.saturating_add(additional),
            Err(err) => {
                tracing::error!(target: "flush", %err, "cannot read free disk space");
                false
            }
        }
    }

    /// FindBlockPos: choose where a block of `add_size` bytes goes
    ///
    /// With `known` the position was decided earlier (reindex) and only the
    /// bookkeeping is updated. Otherwise the block goes at the end of the
    /// last file, moving on to a fresh file once it would pass
    /// MAX_BLOCKFILE_SIZE.
    pub fn find_block_pos(&mut self, add_size: u32, height: u32, time: u64, known: Option<DiskPos>) -> Result<DiskPos> {
        let mut file = known.map_or(self.last_file, |pos| pos.file);
        self.ensure_info(file);

        let pos = match known {
            Some(pos) => pos,
            None => {
                while self.info[file as usize].size + add_size >= MAX_BLOCKFILE_SIZE {
                    file += 1;
                    self.ensure_info(file);
                }
                DiskPos { file, pos: self.info[file as usize].size }
            }
        };

        let new_size = match known {
            Some(_) => self.info[file as usize].size.max(pos.pos + add_size),
            None => pos.pos + add_size,
        };
        if known.is_none() {
            self.reserve(&self.blocks, file, pos.pos, new_size)?;
        }

        if file != self.last_file {
            if known.is_none() {
                tracing::info!(target: "flush", file = self.last_file, "leaving block file");
                self.flush(true)?;
            }
            self.last_file = file;
        }

        let info = &mut self.info[file as usize];
        info.add_block(height, time);
        info.size = new_size;
        self.dirty.insert(file);
        Ok(pos)
    }

    /// FindUndoPos: reserve `add_size` bytes at the end of undo file `file`
    pub fn find_undo_pos(&mut self, file: u32, add_size: u32) -> Result<DiskPos> {
        self.ensure_info(file);
        let pos = DiskPos { file, pos: self.info[file as usize].undo_size };
        let new_size = pos.pos + add_size;
        self.reserve(&self.undo, file, pos.pos, new_size)?;

        self.info[file as usize].undo_size = new_size;
        self.dirty.insert(file);
        Ok(pos)
    }

    /// Pre-allocate the chunks needed to grow `file` from `old_size` to
    /// `new_size`, refusing when that would eat into the disk reserve
    fn reserve(&self, store: &FlatFileStore, file: u32, old_size: u32, new_size: u32) -> Result<()> {
        let allocation = store.allocation_needed(old_size, new_size);
        if allocation == 0 {
            return Ok(());
        }
        if !self.check_disk_space(allocation) {
            return Err(ConsensusError::Storage("out of disk space".to_string()));
        }
        store.allocate(file, old_size, allocation)
    }

    fn ensure_info(&mut self, file: u32) {
        if self.info.len() <= file as usize {
            self.info.resize(file as usize + 1, BlockFileInfo::default());
        }
    }

    /// Append a block; returns the position of its body
    pub fn write_block(&mut self, block: &Block, height: u32) -> Result<DiskPos> {
        let data = serialize_block(block);
        let record_size = data.len() as u32 + 8;
        let pos = self.find_block_pos(record_size, height, block.header.timestamp as u64, None)?;
        let mut file = self.blocks.open(pos, false)?;
        file.write_all(&self.magic)?;
        file.write_all(&(data.len() as u32).to_le_bytes())?;
        file.write_all(&data)?;
        Ok(DiskPos { file: pos.file, pos: pos.pos + 8 })
    }

    fn read_record(&self, store: &FlatFileStore, pos: DiskPos, trailer: usize) -> Result<Vec<u8>> {
        if pos.pos < 8 {
            return Err(ConsensusError::Corrupt(format!("record position {} inside header", pos.pos)));
        }
        let mut file = store.open(DiskPos { file: pos.file, pos: pos.pos - 8 }, true)?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        if header[..4] != self.magic {
            return Err(ConsensusError::Corrupt(format!(
                "bad magic in {} at {}",
                store.path(pos.file).display(),
                pos.pos
            )));
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_BLOCKFILE_SIZE as usize {
            return Err(ConsensusError::Corrupt(format!("record length {} out of range", len)));
        }
        let mut data = vec![0u8; len + trailer];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Read a block and check that it is the one the index expects
    pub fn read_block(&self, pos: DiskPos, expected_hash: &Hash) -> Result<Block> {
        let data = self.read_record(&self.blocks, pos, 0)?;
        let block = deserialize_block(&data)?;
        if &block.hash() != expected_hash {
            return Err(ConsensusError::Corrupt(format!(
                "block at {}:{} has hash {}",
                pos.file,
                pos.pos,
                hash_to_hex(&block.hash())
            )));
        }
        Ok(block)
    }

    /// Append undo data for a block stored in `file`, followed by its checksum
    pub fn write_undo(&mut self, undo: &BlockUndo, file: u32, prev_block_hash: &Hash) -> Result<DiskPos> {
        let data = undo.encode();
        let record_size = data.len() as u32 + 40;
        let pos = self.find_undo_pos(file, record_size)?;
        let mut handle = self.undo.open(pos, false)?;
        handle.write_all(&self.magic)?;
        handle.write_all(&(data.len() as u32).to_le_bytes())?;
        handle.write_all(&data)?;
        handle.write_all(&undo_checksum(prev_block_hash, &data))?;
        Ok(DiskPos { file: pos.file, pos: pos.pos + 8 })
    }

    pub fn read_undo(&self, pos: DiskPos, prev_block_hash: &Hash) -> Result<BlockUndo> {
        let record = self.read_record(&self.undo, pos, 32)?;
        let (data, checksum) = record.split_at(record.len() - 32);
        if undo_checksum(prev_block_hash, data).as_slice() != checksum {
            return Err(ConsensusError::Corrupt("undo data checksum mismatch".to_string()));
        }
        Ok(BlockUndo::decode(data)?)
    }

    /// FlushBlockFile: sync the last block and undo files
    pub fn flush(&self, finalize: bool) -> Result<()> {
        let Some(info) = self.info.get(self.last_file as usize) else {
            return Ok(());
        };
        self.blocks.flush(self.last_file, info.size, finalize)?;
        self.undo.flush(self.last_file, info.undo_size, finalize)?;
        Ok(())
    }

    /// File infos changed since the last successful index write
    pub fn dirty_infos(&self) -> Vec<(u32, BlockFileInfo)> {
        self.dirty
            .iter()
            .filter_map(|file| self.info.get(*file as usize).map(|info| (*file, info.clone())))
            .collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}
