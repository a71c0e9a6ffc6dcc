//! Service transaction references resolved while blocks are checked

mod common;

use common::*;
use consensus_core::service::{MemoryServicePool, ServiceTransaction};
use consensus_core::*;
use std::sync::Arc;

fn paying(prevout: OutPoint, reference: Hash) -> Transaction {
    let mut tx = spend(prevout, COINBASE_VALUE - 10_000);
    tx.version = 2;
    tx.service_reference_hash = Some(reference);
    tx
}

#[test]
fn test_unknown_reference_is_requested_and_block_connects() {
    let pool = Arc::new(MemoryServicePool::new());
    let node = Node::with_service(pool.clone());
    let funding = node.mine_chain(1, 0);

    let tx = paying(coinbase_outpoint(&funding[0]), [7; 32]);
    let block = node.mine(node.tip(), 2, 0, vec![tx]);
    assert_eq!(node.tip(), block.hash());
    assert_eq!(pool.requested(), vec![[7; 32]]);
    assert!(pool.executed().is_empty());
}

#[test]
fn test_known_reference_is_executed_for_the_block() {
    let pool = Arc::new(MemoryServicePool::new());
    pool.insert(ServiceTransaction { hash: [8; 32], version: 1, service_type: 3, payload: vec![1, 2, 3] });
    let node = Node::with_service(pool.clone());
    let funding = node.mine_chain(1, 0);

    let tx = paying(coinbase_outpoint(&funding[0]), [8; 32]);
    let block = node.mine(node.tip(), 2, 0, vec![tx]);
    assert!(pool.requested().is_empty());
    assert!(pool.executed().contains(&([8; 32], block.hash())));
}

#[test]
fn test_invalid_service_transaction_does_not_fail_the_block() {
    let pool = Arc::new(MemoryServicePool::new());
    pool.insert(ServiceTransaction { hash: [9; 32], version: 1, service_type: 3, payload: vec![] });
    let node = Node::with_service(pool.clone());
    let funding = node.mine_chain(1, 0);

    let tx = paying(coinbase_outpoint(&funding[0]), [9; 32]);
    let block = node.mine(node.tip(), 2, 0, vec![tx]);
    assert_eq!(node.tip(), block.hash());
    assert!(pool.executed().is_empty());
}
