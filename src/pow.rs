//! Proof of work: compact targets, work and per-block retargeting

use crate::chain::{BlockId, BlockIndex};
use crate::config::ChainParams;
use crate::constants::*;
use crate::types::*;
use primitive_types::U256;

/// Decoded compact target with its sign and overflow flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTarget {
    pub target: U256,
    pub negative: bool,
    pub overflow: bool,
}

/// SetCompact: ℕ → U256 × {negative} × {overflow}
///
/// The compact form is a base-256 float: the high byte is the length in
/// bytes, the low 23 bits the mantissa and bit 23 the sign.
pub fn compact_to_target(bits: u32) -> CompactTarget {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = word != 0 && bits & 0x0080_0000 != 0;
    let overflow = word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
    let target = if overflow {
        U256::zero()
    } else if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size as usize - 3))
    };
    CompactTarget { target, negative, overflow }
}

/// GetCompact: U256 → ℕ
pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() as u32 + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size as usize - 3))).low_u64() as u32
    };
    // The mantissa sign bit must stay clear
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

pub fn hash_to_u256(hash: &Hash) -> U256 {
    U256::from_little_endian(hash)
}

/// CheckProofOfWork: ℍ × ℕ → {true, false}
///
/// 1. The target must decode without sign or overflow, be non-zero and
///    not exceed `pow_limit`
/// 2. The hash as a little-endian number must not exceed the target
pub fn check_proof_of_work(hash: &Hash, bits: u32, pow_limit: &U256) -> bool {
    let decoded = compact_to_target(bits);
    if decoded.negative || decoded.overflow || decoded.target.is_zero() || decoded.target > *pow_limit {
        return false;
    }
    hash_to_u256(hash) <= decoded.target
}

/// Expected number of hashes to find a block at `bits`: 2^256 / (target + 1)
pub fn block_proof(bits: u32) -> U256 {
    let decoded = compact_to_target(bits);
    if decoded.negative || decoded.overflow || decoded.target.is_zero() {
        return U256::zero();
    }
    // 2^256 / (t + 1) == ~t / (t + 1) + 1
    (!decoded.target / (decoded.target + U256::one())) + U256::one()
}

/// Walk back from `id` to the latest block of the requested kind
pub fn get_last_block_index(index: &BlockIndex, id: BlockId, proof_of_stake: bool) -> BlockId {
    let mut walk = id;
    loop {
        let entry = index.get(walk);
        match entry.prev {
            Some(prev) if entry.proof_of_stake != proof_of_stake => walk = prev,
            _ => return walk,
        }
    }
}

/// GetNextTargetRequired: ℬℐ × {pow, pos} → ℕ
///
/// ppcoin retarget on every block, exponentially moving toward the target
/// spacing, with separate PoW and PoS limits:
/// 1. No parent: the limit
/// 2. Regtest-style params never retarget
/// 3. First and second block of the kind: the limit
/// 4. actual = clamp(prev.time − prevprev.time, 1, timespan)
/// 5. spacing = target (PoS) or min(3·target, target·(1 + last.h − prev.h)) (PoW),
///    with target dropping to 150s once prev MTP passes the service upgrade
/// 6. new = prev · ((n − 1)·spacing + 2·actual) / ((n + 1)·spacing), n = timespan / spacing
/// 7. Capped at the limit
pub fn get_next_target_required(
    index: &BlockIndex,
    last: Option<BlockId>,
    proof_of_stake: bool,
    params: &ChainParams,
) -> u32 {
    let limit = if proof_of_stake {
        params.pos_limit()
    } else {
        params.pow_limit()
    };
    let limit_bits = target_to_compact(limit);

    let Some(last) = last else {
        return limit_bits;
    };
    let prev = get_last_block_index(index, last, proof_of_stake);
    if params.pow_no_retargeting {
        return index.get(prev).bits;
    }

    let Some(prev_parent) = index.get(prev).prev else {
        return limit_bits;
    };
    let prev_prev = get_last_block_index(index, prev_parent, proof_of_stake);
    if index.get(prev_prev).prev.is_none() {
        return limit_bits;
    }

    let prev_entry = index.get(prev);
    let mut actual_spacing = prev_entry.block_time() - index.get(prev_prev).block_time();
    if actual_spacing < 0 {
        actual_spacing = 1;
    } else if actual_spacing > params.target_timespan {
        actual_spacing = params.target_timespan;
    }

    let mut target_spacing = params.target_spacing;
    if index.median_time_past(prev) > SERVICE_UPGRADE_HARDFORK {
        target_spacing = SERVICE_UPGRADE_TARGET_SPACING;
    }
    let spacing = if proof_of_stake {
        target_spacing
    } else {
        let blocks_since = 1 + index.get(last).height as i64 - prev_entry.height as i64;
        (3 * target_spacing).min(target_spacing * blocks_since)
    };
    let interval = params.target_timespan / spacing;

    let numerator = ((interval - 1) * spacing + 2 * actual_spacing).max(0) as u64;
    let denominator = ((interval + 1) * spacing).max(1) as u64;
    let mut target = compact_to_target(prev_entry.bits).target;
    target = target.saturating_mul(U256::from(numerator)) / U256::from(denominator);

    if target > limit {
        target = limit;
    }
    target_to_compact(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_round_trip() {
        for bits in [0x1d00ffffu32, 0x1b0404cb, 0x207fffff, 0x1e0fffff] {
            assert_eq!(target_to_compact(compact_to_target(bits).target), bits);
        }
    }

    #[test]
    fn test_compact_flags() {
        assert!(compact_to_target(0x01fedcba).negative);
        assert!(compact_to_target(0xff123456).overflow);
        assert_eq!(compact_to_target(0x01123456).target, U256::from(0x12));
        assert_eq!(compact_to_target(0x00123456).target, U256::zero());
    }

    #[test]
    fn test_check_proof_of_work_bounds() {
        let limit = compact_to_target(0x207fffff).target;
        assert!(check_proof_of_work(&[0; 32], 0x207fffff, &limit));
        assert!(!check_proof_of_work(&[0xff; 32], 0x207fffff, &limit));
        // Target above the limit
        let tight = compact_to_target(0x1d00ffff).target;
        assert!(!check_proof_of_work(&[0; 32], 0x207fffff, &tight));
        assert!(!check_proof_of_work(&[0; 32], 0, &limit));
    }

    #[test]
    fn test_block_proof_grows_with_difficulty() {
        assert!(block_proof(0x1d00ffff) > block_proof(0x207fffff));
        assert_eq!(block_proof(0), U256::zero());
        // Easiest regtest target is worth two hashes
        assert_eq!(block_proof(0x207fffff), U256::from(2));
    }

    fn chain_with_spacing(params: &ChainParams, count: usize, spacing: u32) -> (BlockIndex, Vec<BlockId>) {
        let mut index = BlockIndex::new();
        let mut ids = Vec::new();
        let mut prev = [0u8; 32];
        let bits = target_to_compact(params.pow_limit() >> 4);
        for i in 0..count {
            let header = BlockHeader {
                version: 1,
                prev_block_hash: prev,
                merkle_root: [0; 32],
                timestamp: 1_400_000_000 + i as u32 * spacing,
                bits,
                nonce: 0,
            };
            let id = index.insert_header(&header, false);
            prev = index.get(id).hash;
            ids.push(id);
        }
        (index, ids)
    }

    #[test]
    fn test_retarget_moves_toward_spacing() {
        let mut params = ChainParams::main();
        params.pow_no_retargeting = false;
        let spacing = params.target_spacing as u32;

        let (index, ids) = chain_with_spacing(&params, 5, spacing / 2);
        let fast = get_next_target_required(&index, ids.last().copied(), false, &params);
        let (index, ids) = chain_with_spacing(&params, 5, spacing * 2);
        let slow = get_next_target_required(&index, ids.last().copied(), false, &params);

        let fast_target = compact_to_target(fast).target;
        let slow_target = compact_to_target(slow).target;
        assert!(fast_target < slow_target);
    }

    #[test]
    fn test_first_blocks_get_limit() {
        let params = ChainParams::main();
        let (index, ids) = chain_with_spacing(&params, 2, 60);
        let limit = target_to_compact(params.pow_limit());
        assert_eq!(get_next_target_required(&index, None, false, &params), limit);
        assert_eq!(get_next_target_required(&index, Some(ids[1]), false, &params), limit);
    }

    #[test]
    fn test_no_retargeting_keeps_bits() {
        let params = ChainParams::regtest();
        let (index, ids) = chain_with_spacing(&params, 4, 60);
        assert_eq!(
            get_next_target_required(&index, Some(ids[3]), false, &params),
            index.get(ids[3]).bits
        );
    }
}
