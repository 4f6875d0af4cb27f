//! Snapshot construction: rewind a private coin view to the target height,
//! then serialize it into size-bounded chunks plus a metafile.

use super::artifact::{chunk_file_path, state_file_path, ChunkInfo, StateHandle, StateMeta};
use super::chunk::{encoded_chunk_len, write_chunk};
use crate::chainstate::{
    disconnect_block, BlockStore, ChainIndex, ChainState, CoinsView, DisconnectResult,
};
use crate::core::codec::coin_entry_len;
use crate::core::hashing::hash_file;
use crate::core::types::{BlockIndex, Coin, OutPoint, MAX_CHUNK_SIZE};
use crate::shutdown::Shutdown;
use anyhow::{bail, Context, Result};
use std::path::Path;

struct RewindOutcome {
    undone: Vec<BlockIndex>,
    any_failed: bool,
}

/// Walk the view back from its tip to `target_height`, disconnecting one
/// block at a time. Disconnect failures are logged, not fatal; the caller
/// decides what a failed block means for the result.
fn rewind(
    view: &mut CoinsView,
    chain: &ChainIndex,
    blocks: &BlockStore,
    target_height: u32,
    shutdown: &Shutdown,
    remember: bool,
) -> Result<RewindOutcome> {
    let tip = chain
        .tip_height()
        .context("cannot rewind an empty chain")?;
    tracing::info!(
        "Rewinding UTXO view to height {}, current height: {}",
        target_height,
        tip
    );

    let mut outcome = RewindOutcome {
        undone: Vec::new(),
        any_failed: false,
    };

    for height in ((target_height + 1)..=tip).rev() {
        if shutdown.requested() {
            bail!("rewind interrupted by shutdown at height {}", height);
        }

        let hash = chain
            .hash_at(height)
            .with_context(|| format!("no block hash at height {}", height))?;
        let (block, undo) = match (blocks.load_block(height)?, blocks.load_undo(height)?) {
            (Some(block), Some(undo)) => (block, undo),
            _ => {
                tracing::error!("Could not read block {} from disk", height);
                outcome.any_failed = true;
                continue;
            }
        };

        match disconnect_block(&block, &undo, view) {
            DisconnectResult::Ok => {}
            DisconnectResult::Unclean => {
                tracing::warn!("Disconnect of block {} was unclean", height);
            }
            DisconnectResult::Failed => {
                tracing::error!("Disconnect of block {} failed", height);
                outcome.any_failed = true;
            }
        }
        if remember {
            outcome.undone.push(BlockIndex { height, hash });
        }

        if height % 5000 == 0 {
            tracing::info!("Rewind progress, current height: {}", height);
        }
    }

    if let Some(hash) = chain.hash_at(target_height) {
        view.set_best_block(hash);
    }
    tracing::info!("Done rewinding, {} coins in view", view.len());
    Ok(outcome)
}

/// Rewind and return the disconnected block indices so the caller can redo
/// them later. `Ok((_, false))` means at least one block failed to
/// disconnect and the view should not be trusted.
pub fn rewind_and_remember(
    view: &mut CoinsView,
    chain: &ChainIndex,
    blocks: &BlockStore,
    target_height: u32,
    shutdown: &Shutdown,
) -> Result<(Vec<BlockIndex>, bool)> {
    let outcome = rewind(view, chain, blocks, target_height, shutdown, true)?;
    Ok((outcome.undone, !outcome.any_failed))
}

/// Rewind without keeping the disconnected blocks. Returns whether every
/// disconnect was usable.
pub fn rewind_and_forget(
    view: &mut CoinsView,
    chain: &ChainIndex,
    blocks: &BlockStore,
    target_height: u32,
    shutdown: &Shutdown,
) -> Result<bool> {
    let outcome = rewind(view, chain, blocks, target_height, shutdown, false)?;
    Ok(!outcome.any_failed)
}

/// Build a state for `height` (0 or out-of-range means the current tip) from
/// a private view over the live chainstate. The canonical store is not
/// touched. Identical view contents always produce identical chunk
/// boundaries, chunk hashes, and state hash.
pub fn build(
    chainstate: &ChainState,
    height: u32,
    state_dir: &Path,
    shutdown: &Shutdown,
) -> Result<StateHandle> {
    let tip = chainstate
        .chain
        .tip_height()
        .context("cannot build a state on an empty chain")?;
    let target = if height == 0 || height > tip { tip } else { height };

    let mut view = CoinsView::load_from(&chainstate.coins)?;
    tracing::info!("UTXO size before rewinding: {}", view.len());

    let usable = rewind_and_forget(
        &mut view,
        &chainstate.chain,
        &chainstate.blocks,
        target,
        shutdown,
    )?;
    if !usable {
        bail!("disconnect failures while rewinding to {}; discarding state", target);
    }
    tracing::info!("UTXO size after rewinding: {}", view.len());

    let latest_block_hash = chainstate
        .chain
        .hash_at(target)
        .with_context(|| format!("no block at height {}", target))?;

    let chunks = serialize_chunks(&view, target, state_dir, shutdown)?;

    let meta = StateMeta {
        height: target,
        latest_block_hash,
        num_chunks: chunks.len() as u32,
    };
    let file = state_file_path(state_dir, target);
    meta.write_to(&file)?;

    let state_file_hash = hash_file(&file, shutdown)?;
    let state = StateHandle::assemble(target, latest_block_hash, file, state_file_hash, chunks);
    tracing::info!(
        "Created state at height {} with hash {}",
        state.height(),
        state.state_hash()
    );
    Ok(state)
}

/// Emit the view's coins as chunk files, starting a new chunk whenever the
/// next entry would push the current one past `MAX_CHUNK_SIZE`. An entry is
/// never split across chunks.
fn serialize_chunks(
    view: &CoinsView,
    state_height: u32,
    state_dir: &Path,
    shutdown: &Shutdown,
) -> Result<Vec<ChunkInfo>> {
    std::fs::create_dir_all(state_dir.join("chunks"))?;

    let mut chunks = Vec::new();
    let mut buffer: Vec<(OutPoint, Coin)> = Vec::new();
    let mut buffer_bytes = 0usize;
    let mut offset = 0u32;

    for (outpoint, coin) in view.iter() {
        // A coin younger than the state means the rewind missed something.
        if coin.height > state_height {
            tracing::error!(
                "Inconsistent coin {:?} at height {} in state for height {}, skipping",
                outpoint,
                coin.height,
                state_height
            );
            continue;
        }

        let entry_len = coin_entry_len(coin);
        if !buffer.is_empty()
            && encoded_chunk_len(buffer.len() + 1, buffer_bytes + entry_len) > MAX_CHUNK_SIZE
        {
            if shutdown.requested() {
                bail!("chunk serialization interrupted by shutdown");
            }
            chunks.push(emit_chunk(state_dir, state_height, offset, &buffer, shutdown)?);
            offset += 1;
            buffer.clear();
            buffer_bytes = 0;
        }

        buffer.push((*outpoint, coin.clone()));
        buffer_bytes += entry_len;
    }

    if !buffer.is_empty() {
        chunks.push(emit_chunk(state_dir, state_height, offset, &buffer, shutdown)?);
    }

    tracing::info!("Wrote {} chunk files", chunks.len());
    Ok(chunks)
}

fn emit_chunk(
    state_dir: &Path,
    height: u32,
    offset: u32,
    utxos: &[(OutPoint, Coin)],
    shutdown: &Shutdown,
) -> Result<ChunkInfo> {
    let path = chunk_file_path(state_dir, height, offset);
    write_chunk(&path, height, offset, utxos)?;
    Ok(ChunkInfo {
        hash: hash_file(&path, shutdown)?,
        height,
        offset,
        n_utxos: utxos.len(),
        file: path,
    })
}
