//! Absolute and relative (BIP68) lock time evaluation
//!
//! Pure functions: the caller supplies heights, times and a median-time-past
//! lookup for the chain being evaluated against.

use crate::chain::{ActiveChain, BlockId};
use crate::constants::*;
use crate::types::*;

/// Cached sequence-lock result for a mempool entry
///
/// Valid only while `max_input_block` stays on the active chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPoints {
    pub height: i32,
    pub time: i64,
    pub max_input_block: Option<BlockId>,
}

impl Default for LockPoints {
    fn default() -> Self {
        Self { height: 0, time: 0, max_input_block: None }
    }
}

/// IsFinalTx: 𝒯𝒳 × ℕ × ℕ → {true, false}
///
/// 1. A zero lock time is always final
/// 2. Below LOCKTIME_THRESHOLD the lock is a height, otherwise a timestamp;
///    it is final once strictly below the block's height or time
/// 3. Otherwise final only if every input is SEQUENCE_FINAL
pub fn is_final_tx(tx: &Transaction, block_height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let limit = if tx.lock_time < LOCKTIME_THRESHOLD {
        block_height as i64
    } else {
        block_time
    };
    if (tx.lock_time as i64) < limit {
        return true;
    }
    tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// CalculateSequenceLocks: 𝒯𝒳 × flags × ℕ* → (height, time)
///
/// Returns the last invalid height and time. `prev_heights[i]` is the
/// height of the coin spent by input `i` and is zeroed for inputs whose
/// relative lock is disabled. `mtp_at(h)` is the median time past of the
/// block at height `h` on the chain being evaluated.
pub fn calculate_sequence_locks<F>(
    tx: &Transaction,
    flags: u32,
    prev_heights: &mut [i32],
    mtp_at: F,
) -> (i32, i64)
where
    F: Fn(i32) -> i64,
{
    let mut min_height = -1i32;
    let mut min_time = -1i64;

    let enforce = tx.version as u32 >= 2 && flags & LOCKTIME_VERIFY_SEQUENCE != 0;
    if !enforce {
        return (min_height, min_time);
    }

    for (i, input) in tx.inputs.iter().enumerate() {
        let Some(height) = prev_heights.get_mut(i) else {
            break;
        };
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            *height = 0;
            continue;
        }
        let coin_height = *height;
        let masked = input.sequence & SEQUENCE_LOCKTIME_MASK;
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            // Time locks count from the MTP of the block before the coin's
            let coin_time = mtp_at((coin_height - 1).max(0));
            let lock = coin_time + ((masked as i64) << SEQUENCE_LOCKTIME_GRANULARITY) - 1;
            min_time = min_time.max(lock);
        } else {
            min_height = min_height.max(coin_height + masked as i32 - 1);
        }
    }
    (min_height, min_time)
}

/// A block at `block_height` whose parent has `prev_mtp` satisfies the locks
pub fn evaluate_sequence_locks(block_height: i32, prev_mtp: i64, lock_pair: (i32, i64)) -> bool {
    !(lock_pair.0 >= block_height || lock_pair.1 >= prev_mtp)
}

pub fn sequence_locks<F>(
    tx: &Transaction,
    flags: u32,
    prev_heights: &mut [i32],
    block_height: i32,
    prev_mtp: i64,
    mtp_at: F,
) -> bool
where
    F: Fn(i32) -> i64,
{
    let pair = calculate_sequence_locks(tx, flags, prev_heights, mtp_at);
    evaluate_sequence_locks(block_height, prev_mtp, pair)
}

/// Cached lock points can be reused only while the block they depended on
/// is still part of the active chain
pub fn test_lock_point_validity(lock_points: &LockPoints, active: &ActiveChain) -> bool {
    match lock_points.max_input_block {
        Some(id) => active.contains(id),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_with(lock_time: u32, sequences: &[u32], version: i32) -> Transaction {
        Transaction {
            version,
            time: 0,
            inputs: sequences
                .iter()
                .enumerate()
                .map(|(i, seq)| TransactionInput {
                    prevout: OutPoint::new([i as u8 + 1; 32], 0),
                    script_sig: vec![],
                    sequence: *seq,
                })
                .collect(),
            outputs: vec![TransactionOutput { value: 1, script_pubkey: vec![] }],
            lock_time,
            service_reference_hash: if version == 2 { Some([0; 32]) } else { None },
        }
    }

    #[test]
    fn test_is_final_tx_height_and_time() {
        let tx = tx_with(100, &[0], 1);
        assert!(!is_final_tx(&tx, 100, 0));
        assert!(is_final_tx(&tx, 101, 0));

        let tx = tx_with(LOCKTIME_THRESHOLD + 10, &[0], 1);
        assert!(!is_final_tx(&tx, 1_000_000, (LOCKTIME_THRESHOLD + 10) as i64));
        assert!(is_final_tx(&tx, 0, (LOCKTIME_THRESHOLD + 11) as i64));
    }

    #[test]
    fn test_final_sequences_override_lock_time() {
        let tx = tx_with(u32::MAX, &[SEQUENCE_FINAL, SEQUENCE_FINAL], 1);
        assert!(is_final_tx(&tx, 0, 0));
    }

    #[test]
    fn test_version_one_ignores_relative_locks() {
        let tx = tx_with(0, &[10], 1);
        let mut heights = vec![50];
        assert_eq!(
            calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &mut heights, |_| 0),
            (-1, -1)
        );
    }

    #[test]
    fn test_height_lock() {
        let tx = tx_with(0, &[10], 2);
        let mut heights = vec![50];
        let pair = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &mut heights, |_| 0);
        assert_eq!(pair, (59, -1));
        // Tie is a failure: the pair is the last invalid value
        assert!(!evaluate_sequence_locks(59, 0, pair));
        assert!(evaluate_sequence_locks(60, 0, pair));
    }

    #[test]
    fn test_time_lock_uses_mtp_of_previous_block() {
        let tx = tx_with(0, &[SEQUENCE_LOCKTIME_TYPE_FLAG | 2], 2);
        let mut heights = vec![10];
        let pair = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &mut heights, |h| {
            assert_eq!(h, 9);
            1_000
        });
        assert_eq!(pair, (-1, 1_000 + 1024 - 1));
    }

    #[test]
    fn test_disabled_input_zeroes_height() {
        let tx = tx_with(0, &[SEQUENCE_LOCKTIME_DISABLE_FLAG | 5, 3], 2);
        let mut heights = vec![40, 20];
        let pair = calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &mut heights, |_| 0);
        assert_eq!(heights, vec![0, 20]);
        assert_eq!(pair, (22, -1));
    }

    #[test]
    fn test_lock_points_without_block_are_valid() {
        let active = ActiveChain::default();
        assert!(test_lock_point_validity(&LockPoints::default(), &active));
    }
}
