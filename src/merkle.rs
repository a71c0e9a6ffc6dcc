//! Merkle root computation with CVE-2012-2459 mutation detection

use crate::encoding::sha256d_hash;
use crate::types::*;

/// ComputeMerkleRoot: ℍ* → ℍ × {mutated, intact}
///
/// Pairs are hashed level by level, the last hash of an odd level is
/// duplicated. A level containing two identical adjacent hashes at an even
/// position means the transaction list can be extended without changing the
/// root, which is reported as a mutation.
pub fn compute_merkle_root(mut hashes: Vec<Hash>) -> (Hash, bool) {
    if hashes.is_empty() {
        return ([0u8; 32], false);
    }
    let mut mutated = false;
    while hashes.len() > 1 {
        for pair in hashes.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if hashes.len() % 2 == 1 {
            let last = hashes[hashes.len() - 1];
            hashes.push(last);
        }
        hashes = hashes
            .chunks_exact(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                sha256d_hash(&buf)
            })
            .collect();
    }
    (hashes[0], mutated)
}

/// Merkle root of a block's transaction ids
pub fn block_merkle_root(block: &Block) -> (Hash, bool) {
    compute_merkle_root(block.transactions.iter().map(Transaction::txid).collect())
}
