//! Service transaction side channel
//!
//! A version 2 transaction pays for an auxiliary service transaction named
//! by `service_reference_hash`. Block checks consult a provider for it; a
//! miss triggers an out-of-band request and a failed check is logged only.

use crate::error::{reject, Rejection, ValidationResult};
use crate::types::*;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Auxiliary transaction carried outside the block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTransaction {
    pub hash: Hash,
    pub version: i32,
    pub service_type: u16,
    pub payload: Vec<u8>,
}

/// Source and executor of service transactions
pub trait ServiceTransactionProvider: Send + Sync {
    fn lookup(&self, hash: &Hash) -> Option<ServiceTransaction>;

    /// Check the service transaction against the transaction paying for it
    fn validate(&self, stx: &ServiceTransaction, tx: &Transaction) -> ValidationResult<()>;

    fn execute(&self, stx: &ServiceTransaction, tx: &Transaction, block: &Block);

    /// Ask peers for a service transaction we do not have
    fn request(&self, hash: &Hash);
}

/// In-memory provider
///
/// Records requests and executions so callers can inspect what a block
/// check triggered.
#[derive(Debug, Default)]
pub struct MemoryServicePool {
    known: Mutex<HashMap<Hash, ServiceTransaction>>,
    requested: Mutex<Vec<Hash>>,
    executed: Mutex<Vec<(Hash, Hash)>>,
}

impl MemoryServicePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, stx: ServiceTransaction) {
        self.known.lock().insert(stx.hash, stx);
    }

    pub fn requested(&self) -> Vec<Hash> {
        self.requested.lock().clone()
    }

    /// (service hash, block hash) of every execution
    pub fn executed(&self) -> Vec<(Hash, Hash)> {
        self.executed.lock().clone()
    }
}

impl ServiceTransactionProvider for MemoryServicePool {
    fn lookup(&self, hash: &Hash) -> Option<ServiceTransaction> {
        self.known.lock().get(hash).cloned()
    }

    fn validate(&self, stx: &ServiceTransaction, tx: &Transaction) -> ValidationResult<()> {
        if tx.service_reference_hash != Some(stx.hash) {
            return Err(Rejection::invalid(reject::INVALID, "bad-stx-reference"));
        }
        if stx.payload.is_empty() {
            return Err(Rejection::invalid(reject::INVALID, "bad-stx-empty"));
        }
        Ok(())
    }

    fn execute(&self, stx: &ServiceTransaction, _tx: &Transaction, block: &Block) {
        self.executed.lock().push((stx.hash, block.hash()));
    }

    fn request(&self, hash: &Hash) {
        let mut requested = self.requested.lock();
        if !requested.contains(hash) {
            requested.push(*hash);
        }
    }
}

/// Run the side channel for one transaction of `block`
///
/// Never fails the block: a miss requests the service transaction, an
/// invalid one is logged, a valid one is executed.
pub fn process_service_reference(provider: &dyn ServiceTransactionProvider, tx: &Transaction, block: &Block) {
    if tx.version != 2 {
        return;
    }
    let Some(reference) = tx.service_reference_hash else {
        return;
    };
    let txid = hash_to_hex(&tx.txid());
    let stx_id = hash_to_hex(&reference);
    match provider.lookup(&reference) {
        None => {
            tracing::info!(target: "validation", txid = %txid, stx = %stx_id, "service transaction not found, requesting");
            provider.request(&reference);
        }
        Some(stx) => match provider.validate(&stx, tx) {
            Err(rejection) => {
                tracing::warn!(
                    target: "validation",
                    txid = %txid,
                    reason = %rejection.message(),
                    "service transaction check failed, non fatal"
                );
            }
            Ok(()) => provider.execute(&stx, tx, block),
        },
    }
}
