use super::CoinDb;
use crate::core::types::{Coin, Hash256, OutPoint};
use anyhow::{bail, Result};
use std::collections::BTreeMap;

/// Private, fully materialized coin view used for snapshot construction.
///
/// The view is seeded from the live store and then mutated by block
/// disconnects; the canonical store underneath stays untouched. Iteration
/// follows the canonical (txid, vout) order, which is what makes snapshot
/// bytes deterministic.
pub struct CoinsView {
    coins: BTreeMap<OutPoint, Coin>,
    best_block: Hash256,
}

impl CoinsView {
    pub fn new() -> Self {
        Self {
            coins: BTreeMap::new(),
            best_block: Hash256::ZERO,
        }
    }

    pub fn load_from(db: &CoinDb) -> Result<Self> {
        use super::ChainStateStore;
        Ok(Self {
            coins: db.ordered_coins()?,
            best_block: db.best_block()?,
        })
    }

    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin, overwrite: bool) -> Result<()> {
        if !overwrite && self.coins.contains_key(&outpoint) {
            bail!("coin {:?} already present in view", outpoint);
        }
        self.coins.insert(outpoint, coin);
        Ok(())
    }

    pub fn remove_coin(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.remove(outpoint)
    }

    pub fn get_coin(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.coins.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.coins.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &Coin)> {
        self.coins.iter()
    }

    pub fn best_block(&self) -> Hash256 {
        self.best_block
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = hash;
    }
}

impl Default for CoinsView {
    fn default() -> Self {
        Self::new()
    }
}
