//! Shared fixtures for the integration tests: a regtest node on a
//! temporary data directory and helpers to mine blocks on any parent

#![allow(dead_code)]

use consensus_core::config::{ChainParams, ValidationConfig};
use consensus_core::merkle::block_merkle_root;
use consensus_core::notify::RecordingSubscriber;
use consensus_core::pow::check_proof_of_work;
use consensus_core::script::{push_data, push_int, Interpreter};
use consensus_core::service::ServiceTransactionProvider;
use consensus_core::storage::MemoryStore;
use consensus_core::*;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Seconds between the regtest genesis block and the mock clock
pub const CLOCK_OFFSET: i64 = 1_000_000;

pub const COINBASE_VALUE: Amount = 50 * COIN;

pub struct Node {
    pub manager: ChainstateManager<MemoryStore>,
    pub store: Arc<MemoryStore>,
    pub clock: MockClock,
    pub events: Arc<RecordingSubscriber>,
    pub dir: TempDir,
}

impl Node {
    /// Fresh node with genesis connected
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Fresh node resolving service references through `provider`
    pub fn with_service(provider: Arc<dyn ServiceTransactionProvider>) -> Self {
        Self::build(Some(provider))
    }

    fn build(service: Option<Arc<dyn ServiceTransactionProvider>>) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let params = ChainParams::regtest();
        let clock = MockClock::new(params.genesis.header.timestamp as i64 + CLOCK_OFFSET);
        let (manager, events) = open(Arc::clone(&store), dir.path(), clock.clone(), service);
        Self { manager, store, clock, events, dir }
    }

    /// Reopen the same store and block directory, as after a restart
    pub fn restart(self) -> Self {
        let Node { manager, store, clock, dir, .. } = self;
        drop(manager);
        let (manager, events) = open(Arc::clone(&store), dir.path(), clock.clone(), None);
        Self { manager, store, clock, events, dir }
    }

    pub fn params(&self) -> &ChainParams {
        self.manager.params()
    }

    pub fn tip(&self) -> Hash {
        self.manager.tip_hash().unwrap()
    }

    /// Mine a block at `height` on `prev` and submit it
    pub fn mine(&self, prev: Hash, height: i32, tag: u8, txs: Vec<Transaction>) -> Block {
        let block = make_block(self.params(), prev, height, tag, txs);
        self.manager.process_new_block(&block, true).unwrap();
        block
    }

    /// Extend the active chain by `count` blocks
    pub fn mine_chain(&self, count: usize, tag: u8) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let height = self.manager.height() + 1;
            blocks.push(self.mine(self.tip(), height, tag, vec![]));
        }
        blocks
    }

    pub fn has_status(&self, hash: &Hash, flag: u32) -> bool {
        self.manager.block_status(hash).map_or(false, |status| status & flag != 0)
    }
}

pub fn test_config(data_dir: &Path) -> ValidationConfig {
    ValidationConfig {
        require_standard: false,
        data_dir: data_dir.to_path_buf(),
        min_disk_space: 0,
        ..ValidationConfig::default()
    }
}

fn open(
    store: Arc<MemoryStore>,
    data_dir: &Path,
    clock: MockClock,
    service: Option<Arc<dyn ServiceTransactionProvider>>,
) -> (ChainstateManager<MemoryStore>, Arc<RecordingSubscriber>) {
    let mut manager = ChainstateManager::new(
        ChainParams::regtest(),
        test_config(data_dir),
        store,
        Arc::new(clock),
        Arc::new(Interpreter),
    )
    .unwrap();
    if let Some(provider) = service {
        manager = manager.with_service_provider(provider);
    }
    let events = Arc::new(RecordingSubscriber::default());
    manager.signals().register(events.clone());
    manager.load_block_index().unwrap();
    (manager, events)
}

/// Coinbase for `height`; `tag` keeps sibling blocks on different forks apart
pub fn coinbase(height: i32, tag: u8) -> Transaction {
    let mut script_sig = Vec::new();
    push_int(&mut script_sig, height as i64);
    push_data(&mut script_sig, &[tag]);
    Transaction {
        version: 1,
        time: 0,
        inputs: vec![TransactionInput { prevout: OutPoint::null(), script_sig, sequence: SEQUENCE_FINAL }],
        outputs: vec![TransactionOutput { value: COINBASE_VALUE, script_pubkey: vec![0x51] }],
        lock_time: 0,
        service_reference_hash: None,
    }
}

/// Anyone-can-spend payment of `value` from `prevout`
pub fn spend(prevout: OutPoint, value: Amount) -> Transaction {
    Transaction {
        version: 1,
        time: 0,
        inputs: vec![TransactionInput { prevout, script_sig: vec![], sequence: SEQUENCE_FINAL }],
        outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
        lock_time: 0,
        service_reference_hash: None,
    }
}

/// First output of a block's coinbase
pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

/// Proof-of-work block at `height` on `prev`, one minute per height after
/// genesis
pub fn make_block(params: &ChainParams, prev: Hash, height: i32, tag: u8, txs: Vec<Transaction>) -> Block {
    let mut transactions = vec![coinbase(height, tag)];
    transactions.extend(txs);
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block_hash: prev,
            merkle_root: [0; 32],
            timestamp: params.genesis.header.timestamp + height as u32 * 60 + tag as u32,
            bits: params.genesis.header.bits,
            nonce: 0,
        },
        transactions,
        signature: vec![],
    };
    block.header.merkle_root = block_merkle_root(&block).0;
    while !check_proof_of_work(&block.hash(), block.header.bits, &params.pow_limit()) {
        block.header.nonce += 1;
    }
    block
}
