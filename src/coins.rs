//! Coin views: the layered UTXO set
//!
//! A [`CoinsViewCache`] overlays any [`CoinsView`] and tracks per-entry
//! DIRTY/FRESH flags so that a flush only writes what changed, and coins
//! created and spent inside one layer never reach the layer below.
//!
//! Layering used by validation:
//! `CoinsViewDb` ← tip `CoinsViewCache` ← per-block `CoinsViewCache`, and
//! for admission `CoinsViewMempool` over the tip cache.

use crate::constants::*;
use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::error::{ConsensusError, Result};
use crate::mempool::TxMempool;
use crate::storage::{Column, KeyValueStore, WriteBatch};
use crate::types::*;
use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem::size_of;

/// Entry differs from the parent view
pub const DIRTY: u8 = 1 << 0;
/// Parent view has no unspent version of this entry
pub const FRESH: u8 = 1 << 1;

/// Cached coin; `None` marks a spent coin that still has to be erased below
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub coin: Option<Coin>,
    pub flags: u8,
}

impl CacheEntry {
    pub fn is_dirty(&self) -> bool {
        self.flags & DIRTY != 0
    }

    pub fn is_fresh(&self) -> bool {
        self.flags & FRESH != 0
    }
}

pub type CoinsMap = HashMap<OutPoint, CacheEntry>;

pub trait CoinsView {
    /// Unspent coin at `outpoint`, if any
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin>;

    fn have_coin(&self, outpoint: &OutPoint) -> bool {
        self.get_coin(outpoint).is_some()
    }

    /// Block hash whose state this view represents
    fn best_block(&self) -> Hash;

    /// Apply a child cache's dirty entries and move the best block
    fn batch_write(&mut self, coins: CoinsMap, best_block: Hash) -> Result<()>;

    /// Approximate on-disk size in bytes
    fn estimate_size(&self) -> usize {
        0
    }
}

impl<T: CoinsView + ?Sized> CoinsView for &mut T {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        (**self).get_coin(outpoint)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> bool {
        (**self).have_coin(outpoint)
    }

    fn best_block(&self) -> Hash {
        (**self).best_block()
    }

    fn batch_write(&mut self, coins: CoinsMap, best_block: Hash) -> Result<()> {
        (**self).batch_write(coins, best_block)
    }

    fn estimate_size(&self) -> usize {
        (**self).estimate_size()
    }
}

/// View with no coins, used as a base in tests and for dry runs
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCoinsView;

impl CoinsView for EmptyCoinsView {
    fn get_coin(&self, _outpoint: &OutPoint) -> Option<Coin> {
        None
    }

    fn best_block(&self) -> Hash {
        [0; 32]
    }

    fn batch_write(&mut self, _coins: CoinsMap, _best_block: Hash) -> Result<()> {
        Ok(())
    }
}

fn coin_usage(coin: &Option<Coin>) -> usize {
    coin.as_ref().map_or(0, |c| c.output.script_pubkey.capacity())
}

/// Outputs that can never be spent are not stored
pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&crate::script::opcodes::OP_RETURN) || script_pubkey.len() > MAX_SCRIPT_SIZE
}

/// In-memory overlay with DIRTY/FRESH tracking
///
/// Reads pull coins from the base into the cache, so lookups take `&self`
/// and mutate through interior mutability.
pub struct CoinsViewCache<B> {
    base: B,
    cache: RefCell<CoinsMap>,
    best_block: Cell<Option<Hash>>,
    cached_usage: Cell<usize>,
}

impl<B: CoinsView> CoinsViewCache<B> {
    pub fn new(base: B) -> Self {
        Self {
            base,
            cache: RefCell::new(CoinsMap::new()),
            best_block: Cell::new(None),
            cached_usage: Cell::new(0),
        }
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    fn fetch_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if let Some(entry) = self.cache.borrow().get(outpoint) {
            return entry.coin.clone();
        }
        let coin = self.base.get_coin(outpoint)?;
        self.cached_usage
            .set(self.cached_usage.get() + coin.output.script_pubkey.capacity());
        self.cache
            .borrow_mut()
            .insert(*outpoint, CacheEntry { coin: Some(coin.clone()), flags: 0 });
        Some(coin)
    }

    pub fn access_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.fetch_coin(outpoint)
    }

    /// True only if an unspent coin is already in this layer
    pub fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.cache
            .borrow()
            .get(outpoint)
            .is_some_and(|entry| entry.coin.is_some())
    }

    /// Add a coin. `possible_overwrite` allows replacing an unspent coin
    /// (duplicate coinbases); without it, the entry may be marked FRESH.
    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin, possible_overwrite: bool) {
        if is_unspendable(&coin.output.script_pubkey) {
            return;
        }
        let cache = self.cache.get_mut();
        let mut usage = self.cached_usage.get();
        let mut fresh = false;
        let entry = match cache.entry(outpoint) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                if !possible_overwrite {
                    if entry.coin.is_some() {
                        tracing::error!(
                            target: "validation",
                            txid = %hash_to_hex(&outpoint.hash),
                            index = outpoint.index,
                            "adding coin over an unspent coin without overwrite"
                        );
                    }
                    fresh = !entry.is_dirty();
                }
                usage = usage.saturating_sub(coin_usage(&entry.coin));
                entry
            }
            Entry::Vacant(vacant) => {
                fresh = !possible_overwrite;
                vacant.insert(CacheEntry { coin: None, flags: 0 })
            }
        };
        entry.coin = Some(coin);
        entry.flags |= DIRTY | if fresh { FRESH } else { 0 };
        usage += coin_usage(&entry.coin);
        self.cached_usage.set(usage);
    }

    /// Add all spendable outputs of `tx` at `height`
    pub fn add_coins(&mut self, tx: &Transaction, height: u32) {
        let txid = tx.txid();
        let coinbase = tx.is_coinbase() || tx.is_coinstake();
        for (index, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(txid, index as u32);
            self.add_coin(outpoint, Coin::new(output.clone(), height, coinbase, tx.time), coinbase);
        }
    }

    /// Spend a coin, moving it into `undo` when given. Returns false when no
    /// unspent coin exists.
    pub fn spend_coin(&mut self, outpoint: &OutPoint, undo: Option<&mut Coin>) -> bool {
        let Some(coin) = self.fetch_coin(outpoint) else {
            return false;
        };
        let cache = self.cache.get_mut();
        let Some(entry) = cache.get_mut(outpoint) else {
            return false;
        };
        self.cached_usage
            .set(self.cached_usage.get().saturating_sub(coin.output.script_pubkey.capacity()));
        if let Some(slot) = undo {
            *slot = coin;
        }
        if entry.is_fresh() {
            cache.remove(outpoint);
        } else {
            entry.flags |= DIRTY;
            entry.coin = None;
        }
        true
    }

    /// Drop an unmodified entry from this layer
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        let cache = self.cache.get_mut();
        if cache.get(outpoint).is_some_and(|entry| entry.flags == 0) {
            if let Some(entry) = cache.remove(outpoint) {
                self.cached_usage
                    .set(self.cached_usage.get().saturating_sub(coin_usage(&entry.coin)));
            }
        }
    }

    /// Push every change to the base and empty the cache
    pub fn flush(&mut self) -> Result<()> {
        let coins = std::mem::take(self.cache.get_mut());
        let best_block = self.best_block();
        self.base.batch_write(coins, best_block)?;
        self.cached_usage.set(0);
        Ok(())
    }

    pub fn set_best_block(&mut self, hash: Hash) {
        self.best_block.set(Some(hash));
    }

    pub fn cache_size(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        let per_entry = size_of::<OutPoint>() + size_of::<CacheEntry>() + 2 * size_of::<usize>();
        self.cache.borrow().capacity() * per_entry + self.cached_usage.get()
    }

    /// Total input value of `tx`; zero for a coinbase
    pub fn value_in(&self, tx: &Transaction) -> Amount {
        if tx.is_coinbase() {
            return 0;
        }
        tx.inputs
            .iter()
            .filter_map(|input| self.access_coin(&input.prevout))
            .map(|coin| coin.output.value)
            .sum()
    }

    /// Priority of `tx` at `height` and the value of its confirmed inputs
    ///
    /// priority = Σ value·(height − coin height) / modified size, counting
    /// only coins confirmed at or below `height`. The modified size drops up
    /// to 110 bytes of scriptSig plus 41 bytes of fixed input data per input.
    pub fn priority(&self, tx: &Transaction, height: u32) -> (f64, Amount) {
        if tx.is_coinbase() {
            return (0.0, 0);
        }
        let mut result = 0.0;
        let mut in_chain_value: Amount = 0;
        for input in &tx.inputs {
            let Some(coin) = self.access_coin(&input.prevout) else {
                continue;
            };
            if coin.height <= height {
                result += coin.output.value as f64 * (height - coin.height) as f64;
                in_chain_value += coin.output.value;
            }
        }
        let mut size = tx.serialized_size();
        for input in &tx.inputs {
            let offset = 41 + input.script_sig.len().min(110);
            if size > offset {
                size -= offset;
            }
        }
        if size == 0 {
            return (0.0, in_chain_value);
        }
        (result / size as f64, in_chain_value)
    }
}

impl<B: CoinsView> CoinsView for CoinsViewCache<B> {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.fetch_coin(outpoint)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> bool {
        self.fetch_coin(outpoint).is_some()
    }

    fn best_block(&self) -> Hash {
        match self.best_block.get() {
            Some(hash) => hash,
            None => {
                let hash = self.base.best_block();
                self.best_block.set(Some(hash));
                hash
            }
        }
    }

    fn batch_write(&mut self, coins: CoinsMap, best_block: Hash) -> Result<()> {
        let cache = self.cache.get_mut();
        let mut usage = self.cached_usage.get();
        for (outpoint, child) in coins {
            // Clean child entries carry nothing new
            if !child.is_dirty() {
                continue;
            }
            match cache.get_mut(&outpoint) {
                None => {
                    // A fresh spent coin never existed below; drop it
                    if child.is_fresh() && child.coin.is_none() {
                        continue;
                    }
                    usage += coin_usage(&child.coin);
                    let flags = DIRTY | if child.is_fresh() { FRESH } else { 0 };
                    cache.insert(outpoint, CacheEntry { coin: child.coin, flags });
                }
                Some(parent) => {
                    if child.is_fresh() && parent.coin.is_some() {
                        return Err(ConsensusError::Corrupt(
                            "FRESH flag misapplied to coin that exists in parent cache".to_string(),
                        ));
                    }
                    usage = usage.saturating_sub(coin_usage(&parent.coin));
                    if parent.is_fresh() && child.coin.is_none() {
                        cache.remove(&outpoint);
                    } else {
                        usage += coin_usage(&child.coin);
                        parent.coin = child.coin;
                        parent.flags |= DIRTY;
                    }
                }
            }
        }
        self.cached_usage.set(usage);
        self.best_block.set(Some(best_block));
        Ok(())
    }

    fn estimate_size(&self) -> usize {
        self.base.estimate_size()
    }
}

pub fn encode_coin(encoder: &mut Encoder, coin: &Coin) {
    encoder.write_i64_le(coin.output.value);
    encoder.write_var_bytes(&coin.output.script_pubkey);
    encoder.write_u32_le(coin.height);
    encoder.write_u8(u8::from(coin.is_coinbase));
    encoder.write_u32_le(coin.time);
}

pub fn decode_coin(decoder: &mut Decoder<'_>) -> std::result::Result<Coin, DecodeError> {
    let value = decoder.read_i64_le()?;
    let script_pubkey = decoder.read_var_bytes()?;
    let height = decoder.read_u32_le()?;
    let is_coinbase = decoder.read_u8()? != 0;
    let time = decoder.read_u32_le()?;
    Ok(Coin::new(TransactionOutput { value, script_pubkey }, height, is_coinbase, time))
}

pub fn outpoint_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(&outpoint.hash);
    key.extend_from_slice(&outpoint.index.to_le_bytes());
    key
}

const BEST_BLOCK_KEY: &[u8] = b"coins_best_block";

/// Coin set persisted in a key-value store
pub struct CoinsViewDb<S> {
    store: S,
}

impl<S: KeyValueStore> CoinsViewDb<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: KeyValueStore> CoinsView for CoinsViewDb<S> {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        let bytes = match self.store.get(Column::Coins, &outpoint_key(outpoint)) {
            Ok(bytes) => bytes?,
            Err(err) => {
                tracing::error!(target: "validation", %err, "error reading from coin database");
                return None;
            }
        };
        let mut decoder = Decoder::new(&bytes);
        match decode_coin(&mut decoder).and_then(|coin| decoder.finish().map(|_| coin)) {
            Ok(coin) => Some(coin),
            Err(err) => {
                tracing::error!(target: "validation", %err, "corrupt coin record");
                None
            }
        }
    }

    fn best_block(&self) -> Hash {
        match self.store.get(Column::Meta, BEST_BLOCK_KEY) {
            Ok(Some(bytes)) if bytes.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                hash
            }
            _ => [0; 32],
        }
    }

    fn batch_write(&mut self, coins: CoinsMap, best_block: Hash) -> Result<()> {
        let mut batch = WriteBatch::new();
        let mut changed = 0usize;
        for (outpoint, entry) in coins {
            if !entry.is_dirty() {
                continue;
            }
            let key = outpoint_key(&outpoint);
            match entry.coin {
                Some(coin) => {
                    let mut encoder = Encoder::new();
                    encode_coin(&mut encoder, &coin);
                    batch.put(Column::Coins, key, encoder.into_inner());
                }
                None => batch.delete(Column::Coins, key),
            }
            changed += 1;
        }
        if best_block != [0; 32] {
            batch.put(Column::Meta, BEST_BLOCK_KEY.to_vec(), best_block.to_vec());
        }
        self.store.write_batch(batch)?;
        tracing::debug!(target: "flush", changed, "committed coin database batch");
        Ok(())
    }

    fn estimate_size(&self) -> usize {
        self.store
            .scan_prefix(Column::Coins, &[])
            .map(|entries| entries.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or(0)
    }
}

/// Coins of the chain tip plus the outputs of pool transactions
///
/// Pool outputs come back with height [`MEMPOOL_HEIGHT`]. Spends by other
/// pool transactions are not hidden; conflicts are checked separately.
pub struct CoinsViewMempool<'a, B> {
    base: &'a B,
    pool: &'a TxMempool,
}

impl<'a, B: CoinsView> CoinsViewMempool<'a, B> {
    pub fn new(base: &'a B, pool: &'a TxMempool) -> Self {
        Self { base, pool }
    }
}

impl<'a, B: CoinsView> CoinsView for CoinsViewMempool<'a, B> {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if let Some(tx) = self.pool.lookup(&outpoint.hash) {
            let output = tx.outputs.get(outpoint.index as usize)?;
            return Some(Coin::new(output.clone(), MEMPOOL_HEIGHT, false, tx.time));
        }
        self.base.get_coin(outpoint)
    }

    fn best_block(&self) -> Hash {
        self.base.best_block()
    }

    fn batch_write(&mut self, _coins: CoinsMap, _best_block: Hash) -> Result<()> {
        Err(ConsensusError::Storage("the mempool coin view is read only".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn coin(value: Amount) -> Coin {
        Coin::new(TransactionOutput { value, script_pubkey: vec![0x51] }, 1, false, 0)
    }

    fn op(n: u8) -> OutPoint {
        OutPoint::new([n; 32], 0)
    }

    fn base_with(coins: &[(OutPoint, Coin)]) -> CoinsViewCache<EmptyCoinsView> {
        let mut base = CoinsViewCache::new(EmptyCoinsView);
        let mut map = CoinsMap::new();
        for (outpoint, c) in coins {
            map.insert(*outpoint, CacheEntry { coin: Some(c.clone()), flags: DIRTY });
        }
        base.batch_write(map, [1; 32]).unwrap();
        base
    }

    #[test]
    fn test_add_coin_marks_fresh_when_missing() {
        let mut view = CoinsViewCache::new(EmptyCoinsView);
        view.add_coin(op(1), coin(10), false);
        let entry = view.cache.borrow().get(&op(1)).cloned().unwrap();
        assert_eq!(entry.flags, DIRTY | FRESH);

        view.add_coin(op(2), coin(10), true);
        let entry = view.cache.borrow().get(&op(2)).cloned().unwrap();
        assert_eq!(entry.flags, DIRTY);
    }

    #[test]
    fn test_unspendable_outputs_skipped() {
        let mut view = CoinsViewCache::new(EmptyCoinsView);
        let mut c = coin(10);
        c.output.script_pubkey = vec![crate::script::opcodes::OP_RETURN, 0x01, 0x02];
        view.add_coin(op(1), c, false);
        assert_eq!(view.cache_size(), 0);
    }

    #[test]
    fn test_spend_fresh_coin_erases_entry() {
        let mut view = CoinsViewCache::new(EmptyCoinsView);
        view.add_coin(op(1), coin(10), false);
        let mut undo = coin(0);
        assert!(view.spend_coin(&op(1), Some(&mut undo)));
        assert_eq!(undo.output.value, 10);
        assert_eq!(view.cache_size(), 0);
        assert!(!view.spend_coin(&op(1), None));
    }

    #[test]
    fn test_spend_over_fresh_parent_erases_on_flush() {
        let mut parent = CoinsViewCache::new(EmptyCoinsView);
        parent.add_coin(op(1), coin(10), false);
        {
            let mut child = CoinsViewCache::new(&mut parent);
            assert!(child.spend_coin(&op(1), None));
            let entry = child.cache.borrow().get(&op(1)).cloned().unwrap();
            assert_eq!(entry, CacheEntry { coin: None, flags: DIRTY });
            child.flush().unwrap();
        }
        assert_eq!(parent.cache_size(), 0);
    }

    #[test]
    fn test_child_fresh_and_spent_never_reaches_parent() {
        let mut child = CoinsViewCache::new(CoinsViewCache::new(EmptyCoinsView));
        child.add_coin(op(3), coin(5), false);
        child.spend_coin(&op(3), None);
        child.flush().unwrap();
        assert_eq!(child.base().cache_size(), 0);
    }

    #[test]
    fn test_flush_overwrites_and_keeps_dirty() {
        let mut parent = CoinsViewCache::new(EmptyCoinsView);
        let mut map = CoinsMap::new();
        map.insert(op(1), CacheEntry { coin: Some(coin(10)), flags: DIRTY });
        parent.batch_write(map, [0; 32]).unwrap();
        // Not fresh in the parent, so a spend must stay as a tombstone
        {
            let mut child = CoinsViewCache::new(&mut parent);
            child.spend_coin(&op(1), None);
            child.set_best_block([7; 32]);
            child.flush().unwrap();
        }
        let entry = parent.cache.borrow().get(&op(1)).cloned().unwrap();
        assert_eq!(entry, CacheEntry { coin: None, flags: DIRTY });
        assert_eq!(parent.best_block(), [7; 32]);
    }

    #[test]
    fn test_fresh_child_over_unspent_parent_is_corruption() {
        let mut parent = base_with(&[(op(1), coin(10))]);
        let mut map = CoinsMap::new();
        map.insert(op(1), CacheEntry { coin: Some(coin(3)), flags: DIRTY | FRESH });
        assert!(matches!(parent.batch_write(map, [0; 32]), Err(ConsensusError::Corrupt(_))));
    }

    #[test]
    fn test_uncache_only_drops_clean_entries() {
        let base = base_with(&[(op(1), coin(10))]);
        let mut child = CoinsViewCache::new(base);
        assert!(child.have_coin(&op(1)));
        assert!(child.have_coin_in_cache(&op(1)));
        child.uncache(&op(1));
        assert!(!child.have_coin_in_cache(&op(1)));

        child.add_coin(op(2), coin(1), false);
        child.uncache(&op(2));
        assert!(child.have_coin_in_cache(&op(2)));
    }

    #[test]
    fn test_priority_uses_confirmed_inputs_only() {
        let mut view = CoinsViewCache::new(EmptyCoinsView);
        view.add_coin(op(1), Coin::new(TransactionOutput { value: 1000, script_pubkey: vec![0x51] }, 10, false, 0), false);
        view.add_coin(op(2), Coin::new(TransactionOutput { value: 5000, script_pubkey: vec![0x51] }, MEMPOOL_HEIGHT, false, 0), false);
        let tx = Transaction {
            version: 1,
            time: 0,
            inputs: vec![
                TransactionInput { prevout: op(1), script_sig: vec![], sequence: SEQUENCE_FINAL },
                TransactionInput { prevout: op(2), script_sig: vec![], sequence: SEQUENCE_FINAL },
            ],
            outputs: vec![TransactionOutput { value: 100, script_pubkey: vec![0x51] }],
            lock_time: 0,
            service_reference_hash: None,
        };
        let (priority, in_chain) = view.priority(&tx, 20);
        assert_eq!(in_chain, 1000);
        assert!(priority > 0.0);
        assert_eq!(view.value_in(&tx), 6000);
    }

    #[test]
    fn test_db_view_persists_through_flush() {
        let store = MemoryStore::new();
        let mut cache = CoinsViewCache::new(CoinsViewDb::new(&store));
        cache.add_coin(op(4), coin(44), false);
        cache.set_best_block([9; 32]);
        cache.flush().unwrap();

        let db = CoinsViewDb::new(&store);
        assert_eq!(db.get_coin(&op(4)).map(|c| c.output.value), Some(44));
        assert_eq!(db.best_block(), [9; 32]);

        let mut cache = CoinsViewCache::new(CoinsViewDb::new(&store));
        cache.spend_coin(&op(4), None);
        cache.flush().unwrap();
        assert!(CoinsViewDb::new(&store).get_coin(&op(4)).is_none());
    }
}
