//! Storage failures stop the node instead of corrupting it

mod common;

use common::*;
use consensus_core::script::Interpreter;
use consensus_core::storage::MemoryStore;
use consensus_core::*;
use std::sync::Arc;

#[test]
fn test_failed_index_write_aborts_node() {
    let node = Node::new();
    node.mine_chain(1, 0);
    node.store.set_fail_writes(true);

    let err = node.manager.flush_state_to_disk(FlushMode::Always).unwrap_err();
    assert!(matches!(err, ConsensusError::Fatal(_)));
    assert!(node.manager.shutdown_requested());
    assert!(node.manager.warnings().contains("block index database"));
}

#[test]
fn test_shutdown_stops_activation() {
    let node = Node::new();
    node.store.set_fail_writes(true);
    let _ = node.manager.flush_state_to_disk(FlushMode::Always);
    node.store.set_fail_writes(false);
    assert!(node.manager.shutdown_requested());

    // Stored, but the tip no longer moves
    let block = make_block(node.params(), node.tip(), 1, 0, vec![]);
    node.manager.process_new_block(&block, true).unwrap();
    assert_eq!(node.manager.height(), 0);
}

#[test]
fn test_low_disk_space_aborts_fresh_node() {
    let dir = tempfile::TempDir::new().unwrap();
    let params = ChainParams::regtest();
    let clock = MockClock::new(params.genesis.header.timestamp as i64 + CLOCK_OFFSET);
    let config = ValidationConfig { min_disk_space: u64::MAX, ..test_config(dir.path()) };
    let manager = ChainstateManager::new(
        params,
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(clock),
        Arc::new(Interpreter),
    )
    .unwrap();
    let err = manager.load_block_index().unwrap_err();
    assert!(matches!(err, ConsensusError::Fatal(_)));
    assert!(manager.shutdown_requested());
    assert!(!manager.warnings().is_empty());
}

#[test]
fn test_low_disk_space_aborts_flush() {
    let node = Node::new();
    node.mine_chain(1, 0);
    node.manager.flush_state_to_disk(FlushMode::Always).unwrap();
    let Node { manager, store, clock, dir, .. } = node;
    drop(manager);

    let config = ValidationConfig { min_disk_space: u64::MAX, ..test_config(dir.path()) };
    let manager =
        ChainstateManager::new(ChainParams::regtest(), config, store, Arc::new(clock), Arc::new(Interpreter)).unwrap();
    manager.load_block_index().unwrap();
    assert_eq!(manager.height(), 1);

    let err = manager.flush_state_to_disk(FlushMode::Always).unwrap_err();
    assert!(matches!(err, ConsensusError::Fatal(_)));
    assert!(manager.shutdown_requested());
    assert_eq!(manager.warnings(), "Disk space is low!");
}

#[test]
fn test_invalid_config_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = ValidationConfig { min_limiter_tx_fee: 5.0, max_limiter_tx_fee: 1.0, ..test_config(dir.path()) };
    let result = ChainstateManager::new(
        ChainParams::regtest(),
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        Arc::new(Interpreter),
    );
    assert!(matches!(result, Err(ConsensusError::Config(_))));
}
