//! Best-chain selection, reorganization, invalidation and restart

mod common;

use common::*;
use consensus_core::chain::status;
use consensus_core::*;

#[test]
fn test_fresh_node_connects_genesis() {
    let node = Node::new();
    assert_eq!(node.manager.height(), 0);
    assert_eq!(node.tip(), node.params().genesis_hash());
    assert_eq!(node.events.connected.read().as_slice(), &[node.params().genesis_hash()]);
    // Genesis outputs never enter the coin set
    let genesis_coinbase = OutPoint::new(node.params().genesis.transactions[0].txid(), 0);
    assert!(node.manager.coin(&genesis_coinbase).is_none());
}

#[test]
fn test_extending_the_tip_updates_coins() {
    let node = Node::new();
    let blocks = node.mine_chain(3, 0);
    assert_eq!(node.manager.height(), 3);
    assert_eq!(node.tip(), blocks[2].hash());
    for block in &blocks {
        let coin = node.manager.coin(&coinbase_outpoint(block)).unwrap();
        assert!(coin.is_coinbase);
        assert_eq!(coin.output.value, COINBASE_VALUE);
        assert!(node.has_status(&block.hash(), status::HAVE_UNDO));
    }
    assert_eq!(node.events.connected.read().len(), 4);
}

#[test]
fn test_reorganizes_onto_more_work_fork() {
    let node = Node::new();
    let genesis = node.tip();
    let a = node.mine_chain(2, 0);

    let b1 = node.mine(genesis, 1, 1, vec![]);
    let b2 = node.mine(b1.hash(), 2, 1, vec![]);
    // Equal work: the first-seen chain stays active
    assert_eq!(node.tip(), a[1].hash());
    assert!(node.has_status(&b2.hash(), status::HAVE_DATA));

    let b3 = node.mine(b2.hash(), 3, 1, vec![]);
    assert_eq!(node.tip(), b3.hash());
    assert_eq!(node.manager.height(), 3);

    for block in &a {
        assert!(node.manager.coin(&coinbase_outpoint(block)).is_none());
    }
    for block in [&b1, &b2, &b3] {
        assert!(node.manager.coin(&coinbase_outpoint(block)).is_some());
    }
    assert_eq!(node.events.disconnected.read().as_slice(), &[a[1].hash(), a[0].hash()]);
    let connected = node.events.connected.read();
    assert_eq!(&connected[connected.len() - 3..], &[b1.hash(), b2.hash(), b3.hash()]);
}

#[test]
fn test_unrequested_block_without_more_work_is_not_stored() {
    let node = Node::new();
    let genesis = node.tip();
    node.mine_chain(1, 0);

    let sibling = make_block(node.params(), genesis, 1, 1, vec![]);
    node.manager.process_new_block(&sibling, false).unwrap();
    assert!(node.manager.block_status(&sibling.hash()).is_some());
    assert!(!node.has_status(&sibling.hash(), status::HAVE_DATA));
}

#[test]
fn test_blocks_arriving_before_their_parent_link_later() {
    let node = Node::new();
    let genesis = node.tip();
    let a1 = make_block(node.params(), genesis, 1, 0, vec![]);
    let a2 = make_block(node.params(), a1.hash(), 2, 0, vec![]);
    node.manager.accept_block_header(&a1.header, false).unwrap();
    node.manager.accept_block_header(&a2.header, false).unwrap();

    node.manager.process_new_block(&a2, true).unwrap();
    assert_eq!(node.tip(), genesis);
    let waiting = node.manager.with_chain(|chain| {
        let parent = chain.index().lookup(&a1.hash()).unwrap();
        chain.unlinked_children(parent).len()
    });
    assert_eq!(waiting, 1);

    node.manager.process_new_block(&a1, true).unwrap();
    assert_eq!(node.tip(), a2.hash());
    let waiting = node.manager.with_chain(|chain| {
        let parent = chain.index().lookup(&a1.hash()).unwrap();
        chain.unlinked_children(parent).len()
    });
    assert_eq!(waiting, 0);
}

#[test]
fn test_header_with_unknown_parent_rejected() {
    let node = Node::new();
    let orphan = make_block(node.params(), [7; 32], 1, 0, vec![]);
    let rejection = node.manager.accept_block_header(&orphan.header, false).unwrap_err();
    assert_eq!(rejection.reason, "bad-prevblk");
    assert_eq!(rejection.dos, 10);
}

#[test]
fn test_invalid_block_is_marked_and_its_children_refused() {
    let node = Node::new();
    let genesis = node.tip();
    let bad = make_block(node.params(), genesis, 1, 0, vec![spend(OutPoint::new([7; 32], 0), 1)]);
    let rejection = node.manager.process_new_block(&bad, true).unwrap_err();
    assert_eq!(rejection.reason, "bad-txns-inputs-missingorspent");
    assert_eq!(node.tip(), genesis);
    assert!(node.has_status(&bad.hash(), status::FAILED_VALID));
    let best_invalid = node.manager.with_chain(|chain| chain.best_invalid().map(|id| chain.index().get(id).hash));
    assert_eq!(best_invalid, Some(bad.hash()));

    let again = node.manager.process_new_block(&bad, true).unwrap_err();
    assert_eq!(again.reason, "duplicate");

    let child = make_block(node.params(), bad.hash(), 2, 0, vec![]);
    let rejection = node.manager.process_new_block(&child, true).unwrap_err();
    assert_eq!(rejection.reason, "bad-prevblk");
    assert_eq!(rejection.dos, 100);

    // The honest chain still extends
    node.mine_chain(1, 1);
    assert_eq!(node.manager.height(), 1);
}

#[test]
fn test_invalidate_then_reconsider() {
    let node = Node::new();
    let blocks = node.mine_chain(3, 0);

    node.manager.invalidate_block(&blocks[1].hash()).unwrap();
    assert_eq!(node.manager.height(), 1);
    assert_eq!(node.tip(), blocks[0].hash());
    assert!(node.has_status(&blocks[1].hash(), status::FAILED_VALID));
    assert!(node.has_status(&blocks[2].hash(), status::FAILED_CHILD));
    assert!(node.manager.coin(&coinbase_outpoint(&blocks[2])).is_none());
    assert!(!node.manager.with_chain(|chain| {
        let id = chain.index().lookup(&blocks[2].hash()).unwrap();
        chain.is_candidate(id)
    }));

    node.manager.reconsider_block(&blocks[1].hash()).unwrap();
    assert_eq!(node.tip(), blocks[2].hash());
    assert!(!node.has_status(&blocks[1].hash(), status::FAILED_MASK));
    assert!(!node.has_status(&blocks[2].hash(), status::FAILED_MASK));
    assert!(node.manager.coin(&coinbase_outpoint(&blocks[2])).is_some());
}

#[test]
fn test_invalidate_unknown_block_fails() {
    let node = Node::new();
    let err = node.manager.invalidate_block(&[3; 32]).unwrap_err();
    assert!(matches!(err, ConsensusError::UnknownBlock(_)));
}

#[test]
fn test_restart_restores_tip_and_coins() {
    let node = Node::new();
    let blocks = node.mine_chain(3, 0);
    node.manager.flush_state_to_disk(FlushMode::Always).unwrap();
    assert!(!node.events.locators.read().is_empty());

    let node = node.restart();
    assert_eq!(node.tip(), blocks[2].hash());
    assert_eq!(node.manager.height(), 3);
    assert!(node.manager.coin(&coinbase_outpoint(&blocks[1])).is_some());
    // Nothing was reconnected on load
    assert!(node.events.connected.read().is_empty());

    let next = node.mine_chain(1, 0);
    assert_eq!(node.tip(), next[0].hash());
    assert_eq!(node.manager.height(), 4);
}

#[test]
fn test_restart_falls_back_to_last_flushed_state() {
    let node = Node::new();
    let flushed = node.mine_chain(1, 0);
    node.manager.flush_state_to_disk(FlushMode::Always).unwrap();
    // Neither the index entries nor the coins of these reach the store
    let later = node.mine_chain(2, 0);
    assert_eq!(node.manager.height(), 3);

    let node = node.restart();
    assert_eq!(node.tip(), flushed[0].hash());
    assert!(node.manager.block_status(&later[1].hash()).is_none());
    assert!(node.manager.coin(&coinbase_outpoint(&later[0])).is_none());
}

#[test]
fn test_activation_on_a_synced_node_keeps_the_tip() {
    let node = Node::new();
    let blocks = node.mine_chain(2, 0);
    let tip_id = node.manager.with_chain(|chain| chain.active().tip());

    node.manager.activate_best_chain().unwrap();
    assert_eq!(node.tip(), blocks[1].hash());
    node.manager.with_chain(|chain| {
        assert_eq!(chain.active().tip(), tip_id);
        assert!(tip_id.map_or(false, |id| chain.is_candidate(id)));
        // Candidates with less work than the tip are pruned
        assert_eq!(chain.candidate_count(), 1);
    });
}
