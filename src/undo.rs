//! Undo records: the coins a block spent, needed to disconnect it

use crate::coins::{decode_coin, encode_coin, CoinsViewCache, CoinsView};
use crate::encoding::{sha256d_hash, DecodeError, Decoder, Encoder};
use crate::types::*;

/// Coins spent by one transaction, in input order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxUndo {
    pub prevout: Vec<Coin>,
}

/// Undo data of every non-coinbase transaction of a block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub tx_undo: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_compact_size(self.tx_undo.len() as u64);
        for tx in &self.tx_undo {
            encoder.write_compact_size(tx.prevout.len() as u64);
            for coin in &tx.prevout {
                encode_coin(&mut encoder, coin);
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx_count = decoder.read_compact_size()?;
        let mut tx_undo = Vec::new();
        for _ in 0..tx_count {
            let coin_count = decoder.read_compact_size()?;
            let mut prevout = Vec::new();
            for _ in 0..coin_count {
                prevout.push(decode_coin(&mut decoder)?);
            }
            tx_undo.push(TxUndo { prevout });
        }
        decoder.finish()?;
        Ok(Self { tx_undo })
    }
}

/// Checksum stored after an undo record, binding it to the parent block
pub fn undo_checksum(prev_block_hash: &Hash, undo_bytes: &[u8]) -> Hash {
    let mut data = Vec::with_capacity(32 + undo_bytes.len());
    data.extend_from_slice(prev_block_hash);
    data.extend_from_slice(undo_bytes);
    sha256d_hash(&data)
}

/// Outcome of undoing a block against a coin view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectResult {
    Ok,
    /// Rolled back, but the view did not match exactly
    Unclean,
    Failed,
}

/// Restore one spent coin. Unclean when something already sits there.
pub fn apply_tx_in_undo<B: CoinsView>(
    undo: Coin,
    view: &mut CoinsViewCache<B>,
    outpoint: &OutPoint,
) -> DisconnectResult {
    let clean = !view.have_coin(outpoint);
    view.add_coin(*outpoint, undo, !clean);
    if clean {
        DisconnectResult::Ok
    } else {
        DisconnectResult::Unclean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::EmptyCoinsView;

    fn coin(value: Amount, height: u32) -> Coin {
        Coin::new(TransactionOutput { value, script_pubkey: vec![0x76, 0xa9] }, height, height == 0, 1234)
    }

    #[test]
    fn test_block_undo_encoding() {
        let undo = BlockUndo {
            tx_undo: vec![
                TxUndo { prevout: vec![coin(5, 1), coin(6, 2)] },
                TxUndo { prevout: vec![coin(7, 0)] },
            ],
        };
        let bytes = undo.encode();
        assert_eq!(BlockUndo::decode(&bytes).unwrap(), undo);
        assert!(BlockUndo::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_checksum_depends_on_parent() {
        let bytes = BlockUndo::default().encode();
        assert_ne!(undo_checksum(&[1; 32], &bytes), undo_checksum(&[2; 32], &bytes));
    }

    #[test]
    fn test_apply_undo_reports_overwrite() {
        let mut view = CoinsViewCache::new(EmptyCoinsView);
        let outpoint = OutPoint::new([3; 32], 1);
        assert_eq!(apply_tx_in_undo(coin(10, 5), &mut view, &outpoint), DisconnectResult::Ok);
        assert_eq!(apply_tx_in_undo(coin(10, 5), &mut view, &outpoint), DisconnectResult::Unclean);
        assert_eq!(view.access_coin(&outpoint).map(|c| c.output.value), Some(10));
    }
}
