//! Validation notifications for wallets and relay

use crate::chain::BlockId;
use crate::types::*;
use parking_lot::RwLock;
use std::sync::Arc;

/// Observer of validation events
///
/// All methods default to doing nothing so a subscriber only implements what
/// it needs. Calls arrive synchronously with the chain lock held, so an
/// implementation must not call back into the chainstate.
pub trait ValidationInterface: Send + Sync {
    fn on_transaction_admitted(&self, _tx: &Arc<Transaction>) {}

    /// `conflicted` holds mempool transactions evicted because the block
    /// spent their inputs
    fn on_block_connected(&self, _block: &Block, _id: BlockId, _conflicted: &[Arc<Transaction>]) {}

    fn on_block_disconnected(&self, _block: &Block) {}

    fn on_best_chain_changed(&self, _locator: &[Hash]) {}
}

/// Registered subscribers, notified in registration order
#[derive(Default)]
pub struct ValidationSignals {
    subscribers: RwLock<Vec<Arc<dyn ValidationInterface>>>,
}

impl ValidationSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, subscriber: Arc<dyn ValidationInterface>) {
        self.subscribers.write().push(subscriber);
    }

    pub fn unregister_all(&self) {
        self.subscribers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    pub fn transaction_admitted(&self, tx: &Arc<Transaction>) {
        for subscriber in self.subscribers.read().iter() {
            subscriber.on_transaction_admitted(tx);
        }
    }

    pub fn block_connected(&self, block: &Block, id: BlockId, conflicted: &[Arc<Transaction>]) {
        for subscriber in self.subscribers.read().iter() {
            subscriber.on_block_connected(block, id, conflicted);
        }
    }

    pub fn block_disconnected(&self, block: &Block) {
        for subscriber in self.subscribers.read().iter() {
            subscriber.on_block_disconnected(block);
        }
    }

    pub fn best_chain_changed(&self, locator: &[Hash]) {
        for subscriber in self.subscribers.read().iter() {
            subscriber.on_best_chain_changed(locator);
        }
    }
}

impl std::fmt::Debug for ValidationSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationSignals").field("subscribers", &self.len()).finish()
    }
}

/// Subscriber that records every event, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    pub admitted: RwLock<Vec<Hash>>,
    pub connected: RwLock<Vec<Hash>>,
    pub disconnected: RwLock<Vec<Hash>>,
    pub conflicted: RwLock<Vec<Hash>>,
    pub locators: RwLock<Vec<Vec<Hash>>>,
}

impl ValidationInterface for RecordingSubscriber {
    fn on_transaction_admitted(&self, tx: &Arc<Transaction>) {
        self.admitted.write().push(tx.txid());
    }

    fn on_block_connected(&self, block: &Block, _id: BlockId, conflicted: &[Arc<Transaction>]) {
        self.connected.write().push(block.hash());
        self.conflicted.write().extend(conflicted.iter().map(|tx| tx.txid()));
    }

    fn on_block_disconnected(&self, block: &Block) {
        self.disconnected.write().push(block.hash());
    }

    fn on_best_chain_changed(&self, locator: &[Hash]) {
        self.locators.write().push(locator.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Ordered {
        tag: u8,
        log: Arc<Mutex<Vec<u8>>>,
    }

    impl ValidationInterface for Ordered {
        fn on_best_chain_changed(&self, _locator: &[Hash]) {
            self.log.lock().unwrap().push(self.tag);
        }
    }

    #[test]
    fn test_subscribers_called_in_registration_order() {
        let signals = ValidationSignals::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in [3u8, 1, 2] {
            signals.register(Arc::new(Ordered { tag, log: log.clone() }));
        }
        signals.best_chain_changed(&[[0; 32]]);
        assert_eq!(*log.lock().unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_recording_subscriber() {
        let signals = ValidationSignals::new();
        let recorder = Arc::new(RecordingSubscriber::default());
        signals.register(recorder.clone());
        signals.best_chain_changed(&[[7; 32], [6; 32]]);
        assert_eq!(recorder.locators.read().len(), 1);
        signals.unregister_all();
        assert!(signals.is_empty());
        signals.best_chain_changed(&[]);
        assert_eq!(recorder.locators.read().len(), 1);
    }
}
