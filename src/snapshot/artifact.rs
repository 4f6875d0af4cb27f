//! On-disk state artifact: one metafile plus its chunk files, and the
//! in-memory handle binding them together.

use crate::core::codec;
use crate::core::hashing::{hash_bytes, hash_file};
use crate::core::types::Hash256;
use crate::shutdown::Shutdown;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Contents of the metafile: `height ‖ latest_block_hash ‖ num_chunks`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateMeta {
    pub height: u32,
    pub latest_block_hash: Hash256,
    pub num_chunks: u32,
}

impl StateMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(40);
        codec::write_u32(&mut buf, self.height).expect("meta encode");
        codec::write_hash(&mut buf, &self.latest_block_hash).expect("meta encode");
        codec::write_u32(&mut buf, self.num_chunks).expect("meta encode");
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let height = codec::read_u32(&mut reader)?;
        let latest_block_hash = codec::read_hash(&mut reader)?;
        let num_chunks = codec::read_u32(&mut reader)?;
        if !reader.is_empty() {
            bail!("{} trailing bytes after state metafile", reader.len());
        }
        Ok(Self {
            height,
            latest_block_hash,
            num_chunks,
        })
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("creating state file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&self.encode())?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("opening state file {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let height = codec::read_u32(&mut reader)?;
        let latest_block_hash = codec::read_hash(&mut reader)?;
        let num_chunks = codec::read_u32(&mut reader)?;
        Ok(Self {
            height,
            latest_block_hash,
            num_chunks,
        })
    }
}

pub fn state_file_name(height: u32) -> String {
    format!("{:010}.state", height)
}

pub fn state_file_path(state_dir: &Path, height: u32) -> PathBuf {
    state_dir.join(state_file_name(height))
}

pub fn chunk_file_name(height: u32, offset: u32) -> String {
    format!("{:010}_{:04}.chunk", height, offset)
}

pub fn chunk_file_path(state_dir: &Path, height: u32, offset: u32) -> PathBuf {
    state_dir.join("chunks").join(chunk_file_name(height, offset))
}

/// `state_hash = H(state_file_hash ‖ chunk_hash[0] ‖ … ‖ chunk_hash[N-1])`.
pub fn compute_state_hash(state_file_hash: &Hash256, chunk_hashes: &[Hash256]) -> Hash256 {
    let mut buf = Vec::with_capacity(32 * (1 + chunk_hashes.len()));
    buf.extend_from_slice(state_file_hash.as_bytes());
    for chunk_hash in chunk_hashes {
        buf.extend_from_slice(chunk_hash.as_bytes());
    }
    hash_bytes(&buf)
}

/// One chunk of a state: content hash, position, and on-disk location.
#[derive(Clone, Debug)]
pub struct ChunkInfo {
    pub hash: Hash256,
    pub height: u32,
    pub offset: u32,
    pub n_utxos: usize,
    pub file: PathBuf,
}

/// In-memory handle of a state artifact. Coins are never materialized here;
/// the handle only binds hashes, counts, and file names.
#[derive(Clone)]
pub struct StateHandle {
    confirmed: bool,
    height: u32,
    state_hash: Hash256,
    latest_block_hash: Hash256,
    file: PathBuf,
    chunks: Vec<ChunkInfo>,
    chunk_index: HashMap<Hash256, u32>,
    state_file_hash: Hash256,
    prev: Option<Box<StateHandle>>,
}

impl StateHandle {
    pub(crate) fn assemble(
        height: u32,
        latest_block_hash: Hash256,
        file: PathBuf,
        state_file_hash: Hash256,
        chunks: Vec<ChunkInfo>,
    ) -> Self {
        let chunk_index = chunks
            .iter()
            .map(|chunk| (chunk.hash, chunk.offset))
            .collect();
        let chunk_hashes: Vec<Hash256> = chunks.iter().map(|chunk| chunk.hash).collect();
        Self {
            confirmed: false,
            height,
            state_hash: compute_state_hash(&state_file_hash, &chunk_hashes),
            latest_block_hash,
            file,
            chunks,
            chunk_index,
            state_file_hash,
            prev: None,
        }
    }

    /// Load an existing state from its metafile, hashing each chunk file.
    /// Rejects a state whose chunk files on disk do not line up with the
    /// metafile's chunk count.
    pub fn load(state_dir: &Path, file_name: &str, shutdown: &Shutdown) -> Result<Self> {
        let file = state_dir.join(file_name);
        let meta = StateMeta::read_from(&file)?;

        let found = count_chunk_files(state_dir, meta.height)?;
        if found != meta.num_chunks as usize {
            bail!(
                "state {} lists {} chunks but {} chunk files exist",
                file_name,
                meta.num_chunks,
                found
            );
        }

        let mut chunks = Vec::with_capacity(meta.num_chunks as usize);
        for offset in 0..meta.num_chunks {
            let chunk_path = chunk_file_path(state_dir, meta.height, offset);
            let data = super::chunk::read_chunk(&chunk_path)?;
            if data.height != meta.height || data.offset != offset {
                bail!(
                    "chunk {} carries height {} offset {}, expected {} {}",
                    chunk_path.display(),
                    data.height,
                    data.offset,
                    meta.height,
                    offset
                );
            }
            chunks.push(ChunkInfo {
                hash: hash_file(&chunk_path, shutdown)?,
                height: data.height,
                offset,
                n_utxos: data.utxos.len(),
                file: chunk_path,
            });
        }

        let state_file_hash = hash_file(&file, shutdown)?;
        let state = Self::assemble(
            meta.height,
            meta.latest_block_hash,
            file,
            state_file_hash,
            chunks,
        );
        tracing::info!(
            "Loaded state at height {} with hash {} ({} chunks)",
            state.height,
            state.state_hash,
            state.chunks.len()
        );
        Ok(state)
    }

    /// Verify the handle's aggregate hash against an externally committed one.
    pub fn verify_hash(&self, expected: &Hash256) -> Result<()> {
        if self.state_hash != *expected {
            bail!(
                "state hash mismatch: computed {}, expected {}",
                self.state_hash,
                expected
            );
        }
        Ok(())
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn state_hash(&self) -> Hash256 {
        self.state_hash
    }

    pub fn latest_block_hash(&self) -> Hash256 {
        self.latest_block_hash
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn meta(&self) -> StateMeta {
        StateMeta {
            height: self.height,
            latest_block_hash: self.latest_block_hash,
            num_chunks: self.chunks.len() as u32,
        }
    }

    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    pub fn chunk_hashes(&self) -> Vec<Hash256> {
        self.chunks.iter().map(|chunk| chunk.hash).collect()
    }

    pub fn chunk_by_hash(&self, hash: &Hash256) -> Option<&ChunkInfo> {
        self.chunk_index
            .get(hash)
            .map(|offset| &self.chunks[*offset as usize])
    }

    /// True if `hash` names this state, its metafile, or one of its chunks.
    pub fn is_known_hash(&self, hash: &Hash256) -> bool {
        self.state_hash == *hash
            || self.state_file_hash == *hash
            || self.chunk_index.contains_key(hash)
    }

    pub fn state_file_hash(&self) -> Hash256 {
        self.state_file_hash
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn set_confirmed(&mut self) {
        self.confirmed = true;
    }

    pub fn previous(&self) -> Option<&StateHandle> {
        self.prev.as_deref()
    }

    pub fn set_previous(&mut self, prev: Box<StateHandle>) {
        self.prev = Some(prev);
    }

    pub fn clear_previous(&mut self) {
        self.prev = None;
    }

    /// Remove the metafile and every chunk file. Called exactly once, when a
    /// confirmed state is superseded.
    pub fn delete_files(&self) -> Result<()> {
        for chunk in &self.chunks {
            if let Err(e) = std::fs::remove_file(&chunk.file) {
                tracing::warn!("Could not remove {}: {}", chunk.file.display(), e);
            }
        }
        if let Err(e) = std::fs::remove_file(&self.file) {
            tracing::warn!("Could not remove {}: {}", self.file.display(), e);
        }
        tracing::info!("Removed state files for height {}", self.height);
        Ok(())
    }
}

/// Chunk files on disk belonging to a state at `height`.
fn count_chunk_files(state_dir: &Path, height: u32) -> Result<usize> {
    let chunks_dir = state_dir.join("chunks");
    if !chunks_dir.exists() {
        return Ok(0);
    }
    let prefix = format!("{:010}_", height);
    let mut count = 0;
    for entry in std::fs::read_dir(&chunks_dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(".chunk") {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(state_file_name(42), "0000000042.state");
        assert_eq!(chunk_file_name(42, 7), "0000000042_0007.chunk");
    }

    #[test]
    fn meta_encode_decode_round_trip() {
        let meta = StateMeta {
            height: 1234,
            latest_block_hash: Hash256([0xCD; 32]),
            num_chunks: 3,
        };
        let bytes = meta.encode();
        assert_eq!(bytes.len(), 40);
        assert_eq!(StateMeta::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn state_hash_depends_on_every_chunk() {
        let file_hash = Hash256([1u8; 32]);
        let base = compute_state_hash(&file_hash, &[Hash256([2u8; 32])]);
        let reordered = compute_state_hash(&file_hash, &[Hash256([3u8; 32])]);
        assert_ne!(base, reordered);
        assert_ne!(base, compute_state_hash(&file_hash, &[]));
    }
}
