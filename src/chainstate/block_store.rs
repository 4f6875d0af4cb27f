use super::disconnect::BlockUndo;
use crate::core::types::Block;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Block and its undo data, stored together per height.
#[derive(Serialize, Deserialize)]
struct StoredBlock {
    block: Block,
    undo: BlockUndo,
}

/// File-per-height block storage, 1000 blocks per folder.
pub struct BlockStore {
    base_path: PathBuf,
}

impl BlockStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn file_path(&self, height: u32) -> PathBuf {
        let folder = height / 1000;
        self.base_path
            .join(format!("{:06}", folder))
            .join(format!("block_{}.bin", height))
    }

    pub fn save(&self, height: u32, block: &Block, undo: &BlockUndo) -> Result<()> {
        let path = self.file_path(height);
        fs::create_dir_all(path.parent().unwrap())?;
        let record = StoredBlock {
            block: block.clone(),
            undo: undo.clone(),
        };
        fs::write(path, bincode::serialize(&record)?)?;
        Ok(())
    }

    pub fn load_block(&self, height: u32) -> Result<Option<Block>> {
        Ok(self.load(height)?.map(|record| record.block))
    }

    pub fn load_undo(&self, height: u32) -> Result<Option<BlockUndo>> {
        Ok(self.load(height)?.map(|record| record.undo))
    }

    fn load(&self, height: u32) -> Result<Option<StoredBlock>> {
        let path = self.file_path(height);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    /// Highest stored height, scanning down from the last folder.
    pub fn highest(&self) -> Result<Option<u32>> {
        let mut max_height = None;
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(entry.path())? {
                let name = file?.file_name();
                let name = name.to_string_lossy();
                if let Some(height) = name
                    .strip_prefix("block_")
                    .and_then(|rest| rest.strip_suffix(".bin"))
                    .and_then(|digits| digits.parse::<u32>().ok())
                {
                    max_height = Some(max_height.map_or(height, |m: u32| m.max(height)));
                }
            }
        }
        Ok(max_height)
    }

    /// Delete every block file strictly below `height`. Returns the number
    /// of files removed.
    pub fn prune_below(&self, height: u32) -> Result<u64> {
        let mut removed = 0;
        for h in 0..height {
            let path = self.file_path(h);
            if path.exists() {
                fs::remove_file(path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("Pruned {} block files below height {}", removed, height);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BlockHeader, Hash256};

    fn block(time: u64) -> Block {
        Block {
            header: BlockHeader {
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                time,
            },
            txs: Vec::new(),
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();

        store.save(0, &block(1), &BlockUndo::default()).unwrap();
        store.save(1500, &block(2), &BlockUndo::default()).unwrap();

        assert_eq!(store.load_block(0).unwrap().unwrap().header.time, 1);
        assert_eq!(store.load_block(1500).unwrap().unwrap().header.time, 2);
        assert!(store.load_block(7).unwrap().is_none());
        assert_eq!(store.highest().unwrap(), Some(1500));
    }

    #[test]
    fn prune_below_keeps_the_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();
        for h in 0..5 {
            store.save(h, &block(h as u64), &BlockUndo::default()).unwrap();
        }

        assert_eq!(store.prune_below(3).unwrap(), 3);
        assert!(store.load_block(2).unwrap().is_none());
        assert!(store.load_block(3).unwrap().is_some());
    }
}
