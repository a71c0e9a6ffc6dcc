//! Chain parameters and node validation settings
//!
//! [`ChainParams`] are consensus constants per network. [`ValidationConfig`]
//! holds local policy knobs and deserializes from JSON with every field
//! optional.

use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::merkle::block_merkle_root;
use crate::pow::{check_proof_of_work, compact_to_target, target_to_compact};
use crate::script::{opcodes, push_data, push_int};
use crate::types::*;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub name: String,
    pub magic: [u8; 4],
    pub pow_limit: U256,
    pub pos_limit: U256,
    pub target_spacing: i64,
    pub target_timespan: i64,
    pub pow_no_retargeting: bool,
    /// Blocks of a new version needed in the window to enforce its rules
    pub majority_enforce_block_upgrade: usize,
    /// Blocks of a new version needed in the window to reject older ones
    pub majority_reject_block_outdated: usize,
    pub majority_window: usize,
    pub checkpoints: BTreeMap<i32, Hash>,
    pub genesis: Block,
    pub stake_min_age: i64,
    /// First height where BIP68 and CHECKSEQUENCEVERIFY apply in blocks
    pub csv_height: i32,
}

impl ChainParams {
    pub fn main() -> Self {
        let pow_limit = U256::MAX >> 20;
        let genesis = genesis_block(1_393_744_287, 12_799_721, target_to_compact(pow_limit));
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(0, genesis.hash());
        Self {
            name: "main".to_string(),
            magic: [0xce, 0xf1, 0xdb, 0xfa],
            pow_limit,
            pos_limit: U256::MAX >> 20,
            target_spacing: 45,
            target_timespan: 7 * SECONDS_PER_DAY,
            pow_no_retargeting: false,
            majority_enforce_block_upgrade: 750,
            majority_reject_block_outdated: 950,
            majority_window: 1000,
            checkpoints,
            genesis,
            stake_min_age: 2 * 60 * 60,
            csv_height: i32::MAX,
        }
    }

    /// Minimal-difficulty network for tests; the genesis block is mined on
    /// construction
    pub fn regtest() -> Self {
        let bits = 0x207f_ffff;
        let pow_limit = compact_to_target(bits).target;
        let genesis = mine_genesis(1_296_688_602, bits, &pow_limit);
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(0, genesis.hash());
        Self {
            name: "regtest".to_string(),
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            pow_limit,
            pos_limit: pow_limit,
            target_spacing: 45,
            target_timespan: 7 * SECONDS_PER_DAY,
            pow_no_retargeting: true,
            majority_enforce_block_upgrade: 750,
            majority_reject_block_outdated: 950,
            majority_window: 1000,
            checkpoints,
            genesis,
            stake_min_age: 0,
            csv_height: 0,
        }
    }

    pub fn pow_limit(&self) -> U256 {
        self.pow_limit
    }

    pub fn pos_limit(&self) -> U256 {
        self.pos_limit
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis.hash()
    }
}

fn genesis_block(time: u32, nonce: u32, bits: u32) -> Block {
    let mut script_sig = Vec::new();
    push_int(&mut script_sig, 486_604_799);
    push_int(&mut script_sig, 4);
    push_data(&mut script_sig, b"hybrid chain genesis");
    let coinbase = Transaction {
        version: 1,
        time,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput { value: 0, script_pubkey: vec![opcodes::OP_RETURN] }],
        lock_time: 0,
        service_reference_hash: None,
    };
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block_hash: [0; 32],
            merkle_root: [0; 32],
            timestamp: time,
            bits,
            nonce,
        },
        transactions: vec![coinbase],
        signature: Vec::new(),
    };
    block.header.merkle_root = block_merkle_root(&block).0;
    block
}

fn mine_genesis(time: u32, bits: u32, pow_limit: &U256) -> Block {
    let mut block = genesis_block(time, 0, bits);
    while !check_proof_of_work(&block.hash(), bits, pow_limit) {
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
    block
}

/// Local validation and relay policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub require_standard: bool,
    pub bytes_per_sigop: u32,
    pub max_mempool_mb: u64,
    pub mempool_expiry_hours: u64,
    /// Free-relay allowance in thousand bytes per minute
    pub limit_free_relay: f64,
    /// Starting fee cutoff of the congestion controller, base units per byte
    pub min_limiter_tx_fee: f64,
    /// Saturated fee cutoff of the congestion controller, base units per byte
    pub max_limiter_tx_fee: f64,
    pub relay_priority: bool,
    pub min_relay_tx_fee: Amount,
    pub ancestor_limit: u64,
    pub ancestor_size_limit_kb: u64,
    pub descendant_limit: u64,
    pub descendant_size_limit_kb: u64,
    pub coin_cache_bytes: usize,
    /// Worker threads for script checks; zero checks inline
    pub script_check_threads: usize,
    pub checkpoints_enabled: bool,
    pub max_orphan_transactions: usize,
    pub data_dir: PathBuf,
    pub min_disk_space: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            require_standard: true,
            bytes_per_sigop: DEFAULT_BYTES_PER_SIGOP,
            max_mempool_mb: DEFAULT_MAX_MEMPOOL_SIZE,
            mempool_expiry_hours: DEFAULT_MEMPOOL_EXPIRY,
            limit_free_relay: DEFAULT_LIMITFREERELAY,
            min_limiter_tx_fee: DEFAULT_MINLIMITERTXFEE,
            max_limiter_tx_fee: DEFAULT_MAXLIMITERTXFEE,
            relay_priority: DEFAULT_RELAYPRIORITY,
            min_relay_tx_fee: DEFAULT_MIN_RELAY_TX_FEE,
            ancestor_limit: DEFAULT_ANCESTOR_LIMIT,
            ancestor_size_limit_kb: DEFAULT_ANCESTOR_SIZE_LIMIT,
            descendant_limit: DEFAULT_DESCENDANT_LIMIT,
            descendant_size_limit_kb: DEFAULT_DESCENDANT_SIZE_LIMIT,
            coin_cache_bytes: DEFAULT_COIN_CACHE_USAGE,
            script_check_threads: 0,
            checkpoints_enabled: true,
            max_orphan_transactions: DEFAULT_MAX_ORPHAN_TRANSACTIONS,
            data_dir: PathBuf::from("."),
            min_disk_space: MIN_DISK_SPACE,
        }
    }
}

impl ValidationConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConsensusError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_limiter_tx_fee > self.max_limiter_tx_fee {
            return Err(ConsensusError::Config(format!(
                "min_limiter_tx_fee {} exceeds max_limiter_tx_fee {}",
                self.min_limiter_tx_fee, self.max_limiter_tx_fee
            )));
        }
        if self.min_relay_tx_fee < 0 {
            return Err(ConsensusError::Config("min_relay_tx_fee is negative".to_string()));
        }
        Ok(())
    }

    pub fn max_mempool_bytes(&self) -> usize {
        (self.max_mempool_mb * 1_000_000) as usize
    }

    pub fn mempool_expiry_seconds(&self) -> i64 {
        (self.mempool_expiry_hours * 60 * 60) as i64
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }
}
