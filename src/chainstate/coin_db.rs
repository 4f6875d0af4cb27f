use super::ChainStateStore;
use crate::core::types::{Coin, Hash256, OutPoint};
use anyhow::{bail, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const COINS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("coins");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const BEST_BLOCK_KEY: &str = "best_block";

/// Cache reserved for the coin database when a snapshot is being applied.
pub const COINDB_CACHE_BYTES: usize = 1 << 23;

/// redb-backed UTXO store with a write-back cache. Mutations accumulate in
/// memory and hit the database on `flush`, mirroring how block processing
/// batches its writes.
pub struct CoinDb {
    db: Database,
    path: PathBuf,
    dirty: BTreeMap<OutPoint, Option<Coin>>,
    pending_best: Option<Hash256>,
}

/// Database key: txid followed by the big-endian output index, so the raw
/// byte order of the table equals the canonical (txid, vout) coin order.
fn coin_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(outpoint.txid.as_bytes());
    key[32..].copy_from_slice(&outpoint.vout.to_be_bytes());
    key
}

fn coin_key_decode(key: &[u8]) -> Result<OutPoint> {
    if key.len() != 36 {
        bail!("malformed coin key of {} bytes", key.len());
    }
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&key[..32]);
    let vout = u32::from_be_bytes(<[u8; 4]>::try_from(&key[32..]).unwrap());
    Ok(OutPoint::new(Hash256(txid), vout))
}

fn coin_encode(coin: &Coin) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(crate::core::codec::coin_entry_len(coin));
    crate::core::codec::write_coin(&mut buf, coin)?;
    Ok(buf)
}

fn coin_decode(bytes: &[u8]) -> Result<Coin> {
    crate::core::codec::read_coin(&mut &bytes[..])
}

impl CoinDb {
    pub fn open<P: AsRef<Path>>(path: P, cache_bytes: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::builder()
            .set_cache_size(cache_bytes)
            .create(&path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(COINS_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            path,
            dirty: BTreeMap::new(),
            pending_best: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop every coin and the best-block marker, leaving an empty store at
    /// the same path. Used when a snapshot replaces the chainstate wholesale.
    pub fn wipe(&mut self) -> Result<()> {
        self.dirty.clear();
        self.pending_best = None;

        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(COINS_TABLE)?;
        write_txn.delete_table(META_TABLE)?;
        {
            let _ = write_txn.open_table(COINS_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn stored_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COINS_TABLE)?;
        match table.get(coin_key(outpoint).as_slice())? {
            Some(bytes) => Ok(Some(coin_decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    /// Materialize the full coin set in canonical order, committed entries
    /// overlaid with unflushed mutations. This is the basis for the private
    /// view a snapshot build works on.
    pub fn ordered_coins(&self) -> Result<BTreeMap<OutPoint, Coin>> {
        let mut coins = BTreeMap::new();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COINS_TABLE)?;
        for entry in table.iter()? {
            let (key, value) = entry?;
            coins.insert(coin_key_decode(key.value())?, coin_decode(value.value())?);
        }
        for (outpoint, change) in &self.dirty {
            match change {
                Some(coin) => {
                    coins.insert(*outpoint, coin.clone());
                }
                None => {
                    coins.remove(outpoint);
                }
            }
        }
        Ok(coins)
    }
}

impl ChainStateStore for CoinDb {
    fn add_coin(&mut self, outpoint: OutPoint, coin: Coin, overwrite: bool) -> Result<()> {
        if !overwrite && self.get_coin(&outpoint)?.is_some() {
            bail!("coin {:?} already present", outpoint);
        }
        self.dirty.insert(outpoint, Some(coin));
        Ok(())
    }

    fn remove_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        let existing = self.get_coin(outpoint)?;
        if existing.is_some() {
            self.dirty.insert(*outpoint, None);
        }
        Ok(existing)
    }

    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        if let Some(change) = self.dirty.get(outpoint) {
            return Ok(change.clone());
        }
        self.stored_coin(outpoint)
    }

    fn best_block(&self) -> Result<Hash256> {
        if let Some(best) = self.pending_best {
            return Ok(best);
        }
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        match table.get(BEST_BLOCK_KEY)? {
            Some(bytes) => {
                let value = bytes.value();
                if value.len() != 32 {
                    bail!("corrupt best-block marker");
                }
                Ok(Hash256(<[u8; 32]>::try_from(value).unwrap()))
            }
            None => Ok(Hash256::ZERO),
        }
    }

    fn set_best_block(&mut self, hash: Hash256) -> Result<()> {
        self.pending_best = Some(hash);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty.is_empty() && self.pending_best.is_none() {
            return Ok(());
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(COINS_TABLE)?;
            for (outpoint, change) in &self.dirty {
                let key = coin_key(outpoint);
                match change {
                    Some(coin) => {
                        table.insert(key.as_slice(), coin_encode(coin)?.as_slice())?;
                    }
                    None => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
            if let Some(best) = self.pending_best {
                let mut meta = write_txn.open_table(META_TABLE)?;
                meta.insert(BEST_BLOCK_KEY, best.as_bytes().as_slice())?;
            }
        }
        write_txn.commit()?;

        self.dirty.clear();
        self.pending_best = None;
        Ok(())
    }

    fn coin_count(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COINS_TABLE)?;
        let mut count = table.len()?;
        for (outpoint, change) in &self.dirty {
            let stored = table.get(coin_key(outpoint).as_slice())?.is_some();
            match change {
                Some(_) if !stored => count += 1,
                None if stored => count -= 1,
                _ => {}
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(height: u32) -> Coin {
        Coin {
            amount: 100,
            script: vec![1, 2, 3],
            is_coinbase: false,
            height,
        }
    }

    #[test]
    fn add_flush_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coins.redb");
        let outpoint = OutPoint::new(Hash256([9u8; 32]), 1);

        {
            let mut db = CoinDb::open(&path, COINDB_CACHE_BYTES).unwrap();
            db.add_coin(outpoint, coin(5), false).unwrap();
            db.set_best_block(Hash256([2u8; 32])).unwrap();
            db.flush().unwrap();
        }

        let db = CoinDb::open(&path, COINDB_CACHE_BYTES).unwrap();
        assert_eq!(db.get_coin(&outpoint).unwrap(), Some(coin(5)));
        assert_eq!(db.best_block().unwrap(), Hash256([2u8; 32]));
        assert_eq!(db.coin_count().unwrap(), 1);
    }

    #[test]
    fn duplicate_add_rejected_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = CoinDb::open(dir.path().join("coins.redb"), COINDB_CACHE_BYTES).unwrap();
        let outpoint = OutPoint::new(Hash256([1u8; 32]), 0);

        db.add_coin(outpoint, coin(1), false).unwrap();
        assert!(db.add_coin(outpoint, coin(2), false).is_err());
        db.add_coin(outpoint, coin(2), true).unwrap();
        assert_eq!(db.get_coin(&outpoint).unwrap().unwrap().height, 2);
    }

    #[test]
    fn ordered_coins_respects_canonical_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = CoinDb::open(dir.path().join("coins.redb"), COINDB_CACHE_BYTES).unwrap();

        let a = OutPoint::new(Hash256([1u8; 32]), 7);
        let b = OutPoint::new(Hash256([1u8; 32]), 300);
        let c = OutPoint::new(Hash256([2u8; 32]), 0);
        for op in [c, b, a] {
            db.add_coin(op, coin(1), false).unwrap();
        }
        db.flush().unwrap();

        let ordered: Vec<OutPoint> = db.ordered_coins().unwrap().into_keys().collect();
        assert_eq!(ordered, vec![a, b, c]);
    }

    #[test]
    fn wipe_empties_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = CoinDb::open(dir.path().join("coins.redb"), COINDB_CACHE_BYTES).unwrap();
        db.add_coin(OutPoint::new(Hash256([3u8; 32]), 0), coin(1), false)
            .unwrap();
        db.flush().unwrap();

        db.wipe().unwrap();
        assert_eq!(db.coin_count().unwrap(), 0);
        assert!(db.best_block().unwrap().is_zero());
    }
}
