mod block_store;
mod coin_db;
mod disconnect;
mod view;

pub use block_store::BlockStore;
pub use coin_db::{CoinDb, COINDB_CACHE_BYTES};
pub use disconnect::{disconnect_block, BlockUndo, DisconnectResult};
pub use view::CoinsView;

use crate::core::types::{Block, BlockIndex, Coin, Hash256, OutPoint};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Mutation interface of the UTXO database. The snapshot loader talks to the
/// store exclusively through this trait.
pub trait ChainStateStore {
    /// Insert a coin. With `overwrite` false an existing entry is an error.
    fn add_coin(&mut self, outpoint: OutPoint, coin: Coin, overwrite: bool) -> Result<()>;
    fn remove_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>>;
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>>;
    fn best_block(&self) -> Result<Hash256>;
    fn set_best_block(&mut self, hash: Hash256) -> Result<()>;
    /// Persist all buffered mutations.
    fn flush(&mut self) -> Result<()>;
    fn coin_count(&self) -> Result<u64>;
}

/// The active chain: block hashes by height plus the current tip.
///
/// Header sync may know more hashes than the tip covers; `tip` marks how far
/// the UTXO set has been materialized.
#[derive(Default)]
pub struct ChainIndex {
    hashes: Vec<Hash256>,
    by_hash: HashMap<Hash256, u32>,
    tip: Option<u32>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a header without moving the tip.
    pub fn add_header(&mut self, hash: Hash256) -> u32 {
        let height = self.hashes.len() as u32;
        self.by_hash.insert(hash, height);
        self.hashes.push(hash);
        height
    }

    /// Record a fully connected block and advance the tip to it.
    pub fn connect(&mut self, hash: Hash256) -> BlockIndex {
        let height = self.add_header(hash);
        self.tip = Some(height);
        BlockIndex { height, hash }
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.tip
    }

    pub fn tip_hash(&self) -> Option<Hash256> {
        self.tip.and_then(|h| self.hash_at(h))
    }

    pub fn best_header_height(&self) -> Option<u32> {
        (!self.hashes.is_empty()).then(|| self.hashes.len() as u32 - 1)
    }

    pub fn hash_at(&self, height: u32) -> Option<Hash256> {
        self.hashes.get(height as usize).copied()
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u32> {
        self.by_hash.get(hash).copied()
    }

    /// Move the tip to an already-known block.
    pub fn set_tip(&mut self, hash: &Hash256) -> Result<u32> {
        match self.height_of(hash) {
            Some(height) => {
                self.tip = Some(height);
                Ok(height)
            }
            None => bail!("block {} not in the active chain", hash),
        }
    }
}

/// The live chainstate: coin database, active chain, and block files.
pub struct ChainState {
    pub coins: CoinDb,
    pub chain: ChainIndex,
    pub blocks: BlockStore,
}

impl ChainState {
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let coins = CoinDb::open(data_dir.join("chainstate.redb"), COINDB_CACHE_BYTES)?;
        let blocks = BlockStore::new(data_dir.join("blocks"))?;

        // Rebuild the active chain from stored blocks. The tip is wherever
        // the coin database says it is; stored blocks past a loaded snapshot
        // height stay headers-only.
        let mut chain = ChainIndex::new();
        if let Some(highest) = blocks.highest()? {
            for height in 0..=highest {
                match blocks.load_block(height)? {
                    Some(block) => {
                        chain.add_header(block.hash());
                    }
                    None => break,
                }
            }
            let best = coins.best_block()?;
            if !best.is_zero() && chain.height_of(&best).is_some() {
                chain.set_tip(&best)?;
            }
        }

        Ok(Self {
            coins,
            chain,
            blocks,
        })
    }

    /// Connect a validated block: spend its inputs, create its outputs, and
    /// persist the undo data needed to disconnect it again.
    pub fn connect_block(&mut self, block: &Block) -> Result<BlockIndex> {
        let height = self.chain.best_header_height().map_or(0, |h| h + 1);
        let mut undo = BlockUndo::default();
        for tx in &block.txs {
            if !tx.is_coinbase() {
                for txin in &tx.inputs {
                    let coin = self
                        .coins
                        .remove_coin(&txin.prevout)?
                        .with_context(|| format!("missing input {:?}", txin.prevout))?;
                    undo.spent.push((txin.prevout, coin));
                }
            }
            let txid = tx.txid();
            let is_coinbase = tx.is_coinbase();
            for (vout, out) in tx.outputs.iter().enumerate() {
                self.coins.add_coin(
                    OutPoint::new(txid, vout as u32),
                    Coin {
                        amount: out.amount,
                        script: out.script.clone(),
                        is_coinbase,
                        height,
                    },
                    false,
                )?;
            }
        }

        let hash = block.hash();
        let index = self.chain.connect(hash);
        self.coins.set_best_block(hash)?;
        self.blocks.save(index.height, block, &undo)?;
        Ok(index)
    }

    /// Delete block files strictly below `height`. Keeps everything from
    /// `height` up so confirmations in the tail stay collectable.
    pub fn prune_blocks_up_to(&mut self, height: u32) -> Result<u64> {
        self.blocks.prune_below(height)
    }
}
