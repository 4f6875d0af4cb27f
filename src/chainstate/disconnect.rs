use super::CoinsView;
use crate::core::types::{Block, Coin, OutPoint};
use serde::{Deserialize, Serialize};

/// Outcome of undoing one block from a coin view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectResult {
    Ok,
    /// The view disagreed in places (missing outputs, resurrected coins that
    /// already existed) but the undo could be applied.
    Unclean,
    /// The undo data did not match the block; the view is unusable.
    Failed,
}

/// Coins consumed by a block, in input order, recorded when the block was
/// connected.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockUndo {
    pub spent: Vec<(OutPoint, Coin)>,
}

/// Undo one block: remove the outputs it created and restore the coins it
/// spent. The caller owns reading block and undo data from disk.
pub fn disconnect_block(block: &Block, undo: &BlockUndo, view: &mut CoinsView) -> DisconnectResult {
    let mut clean = true;

    for tx in &block.txs {
        let txid = tx.txid();
        for vout in 0..tx.outputs.len() as u32 {
            if view.remove_coin(&OutPoint::new(txid, vout)).is_none() {
                clean = false;
            }
        }
    }

    let spends: Vec<&OutPoint> = block
        .txs
        .iter()
        .filter(|tx| !tx.is_coinbase())
        .flat_map(|tx| tx.inputs.iter().map(|txin| &txin.prevout))
        .collect();
    if spends.len() != undo.spent.len() {
        return DisconnectResult::Failed;
    }

    for (prevout, (undo_outpoint, coin)) in spends.iter().zip(&undo.spent) {
        if **prevout != *undo_outpoint {
            return DisconnectResult::Failed;
        }
        if view.contains(undo_outpoint) {
            clean = false;
        }
        let _ = view.add_coin(*undo_outpoint, coin.clone(), true);
    }

    if clean {
        DisconnectResult::Ok
    } else {
        DisconnectResult::Unclean
    }
}
