//! Property tests for absolute and relative lock times

use consensus_core::locktime::{calculate_sequence_locks, evaluate_sequence_locks, is_final_tx};
use consensus_core::*;
use proptest::prelude::*;

fn tx_with(lock_time: u32, sequences: &[u32], version: i32) -> Transaction {
    Transaction {
        version,
        time: 0,
        inputs: sequences
            .iter()
            .enumerate()
            .map(|(i, &sequence)| TransactionInput {
                prevout: OutPoint::new([1; 32], i as u32),
                script_sig: vec![],
                sequence,
            })
            .collect(),
        outputs: vec![TransactionOutput { value: 1, script_pubkey: vec![0x51] }],
        lock_time,
        service_reference_hash: None,
    }
}

proptest! {
    #[test]
    fn prop_zero_lock_time_is_always_final(height in 0i32..1_000_000, time in 0i64..2_000_000_000, seq in any::<u32>()) {
        prop_assert!(is_final_tx(&tx_with(0, &[seq], 1), height, time));
    }

    #[test]
    fn prop_height_lock_final_strictly_below_height(
        lock in 1u32..LOCKTIME_THRESHOLD,
        height in 0i32..600_000_000,
    ) {
        let tx = tx_with(lock, &[0], 1);
        prop_assert_eq!(is_final_tx(&tx, height, 0), (lock as i64) < height as i64);
    }

    #[test]
    fn prop_final_sequences_override_lock(lock in 1u32..u32::MAX, height in 0i32..1_000) {
        let tx = tx_with(lock, &[SEQUENCE_FINAL, SEQUENCE_FINAL], 1);
        prop_assert!(is_final_tx(&tx, height, 0));
    }

    #[test]
    fn prop_disabled_inputs_impose_no_lock(
        masks in prop::collection::vec(0u32..=SEQUENCE_LOCKTIME_MASK, 1..5),
        coin_height in 0i32..10_000,
    ) {
        let sequences: Vec<u32> = masks.iter().map(|m| m | SEQUENCE_LOCKTIME_DISABLE_FLAG).collect();
        let tx = tx_with(0, &sequences, 2);
        let mut heights = vec![coin_height; sequences.len()];
        let pair = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &mut heights, |_| 0);
        prop_assert_eq!(pair, (-1, -1));
        prop_assert!(heights.iter().all(|h| *h == 0));
    }

    #[test]
    fn prop_height_locks_stay_satisfied(
        blocks in 0u32..1_000,
        coin_height in 0i32..10_000,
        extra in 0i32..100,
    ) {
        let tx = tx_with(0, &[blocks], 2);
        let mut heights = vec![coin_height];
        let pair = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &mut heights, |_| 0);
        let first_valid = coin_height + blocks as i32;
        prop_assert!(!evaluate_sequence_locks(first_valid - 1, i64::MAX, pair) || blocks == 0);
        prop_assert!(evaluate_sequence_locks(first_valid + extra, i64::MAX, pair));
    }

    #[test]
    fn prop_version_one_ignores_relative_locks(seq in 0u32..=SEQUENCE_LOCKTIME_MASK, coin_height in 0i32..10_000) {
        let tx = tx_with(0, &[seq], 1);
        let mut heights = vec![coin_height];
        let pair = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &mut heights, |_| 0);
        prop_assert_eq!(pair, (-1, -1));
    }
}
