//! Chunk file codec.
//!
//! A chunk is `height(u32) ‖ offset(u32) ‖ compact_size(n) ‖ n × (outpoint ‖
//! coin)` in the canonical disk encoding. The bytes on disk are what gets
//! content-hashed and shipped to peers, so writing must be deterministic.

use crate::core::codec;
use crate::core::types::{Coin, OutPoint};
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Serialized width of the height/offset chunk header.
pub const CHUNK_HEADER_LEN: usize = 8;

#[derive(Debug)]
pub struct ChunkData {
    pub height: u32,
    pub offset: u32,
    pub utxos: Vec<(OutPoint, Coin)>,
}

/// Total encoded size of a chunk holding `entries_bytes` worth of entries.
pub fn encoded_chunk_len(n_entries: usize, entries_bytes: usize) -> usize {
    CHUNK_HEADER_LEN + codec::compact_size_len(n_entries as u64) + entries_bytes
}

pub fn write_chunk<P: AsRef<Path>>(
    path: P,
    height: u32,
    offset: u32,
    utxos: &[(OutPoint, Coin)],
) -> Result<()> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("creating chunk file {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    codec::write_u32(&mut writer, height)?;
    codec::write_u32(&mut writer, offset)?;
    codec::write_compact_size(&mut writer, utxos.len() as u64)?;
    for (outpoint, coin) in utxos {
        codec::write_outpoint(&mut writer, outpoint)?;
        codec::write_coin(&mut writer, coin)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_chunk<P: AsRef<Path>>(path: P) -> Result<ChunkData> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("opening chunk file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let height = codec::read_u32(&mut reader)?;
    let offset = codec::read_u32(&mut reader)?;
    let count = codec::read_compact_size(&mut reader)? as usize;
    let mut utxos = Vec::with_capacity(count);
    for _ in 0..count {
        let outpoint = codec::read_outpoint(&mut reader)?;
        let coin = codec::read_coin(&mut reader)?;
        utxos.push((outpoint, coin));
    }
    Ok(ChunkData {
        height,
        offset,
        utxos,
    })
}

/// Decode a chunk received over the wire without touching disk. Used to
/// recover the (height, offset) a delivered chunk belongs to.
pub fn decode_chunk(bytes: &[u8]) -> Result<ChunkData> {
    let mut reader = bytes;
    let height = codec::read_u32(&mut reader)?;
    let offset = codec::read_u32(&mut reader)?;
    let count = codec::read_compact_size(&mut reader)? as usize;
    let mut utxos = Vec::with_capacity(count);
    for _ in 0..count {
        let outpoint = codec::read_outpoint(&mut reader)?;
        let coin = codec::read_coin(&mut reader)?;
        utxos.push((outpoint, coin));
    }
    if !reader.is_empty() {
        bail!("{} trailing bytes after chunk payload", reader.len());
    }
    Ok(ChunkData {
        height,
        offset,
        utxos,
    })
}
