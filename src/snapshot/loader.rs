//! Snapshot application: replace the chainstate store with the coins of a
//! state artifact.

use super::artifact::StateHandle;
use super::chunk::read_chunk;
use crate::chainstate::ChainStateStore;
use crate::lifecycle::SharedRuntime;
use anyhow::{bail, Context, Result};

/// Apply a state to the chainstate. The store is emptied first; a failure
/// partway leaves it empty and the node must resynchronize from scratch.
///
/// The runtime lock is re-acquired per chunk so other readers make progress
/// while a large state streams in. Concurrent apply attempts are rejected
/// via the loading flag with no mutation.
pub async fn apply(runtime: &SharedRuntime, state: &StateHandle) -> Result<u64> {
    {
        let mut rt = runtime.lock().await;
        if rt.loading {
            bail!("Another state is currently being loaded. Aborting.");
        }
        rt.loading = true;

        if let Err(e) = begin(&mut rt, state) {
            rt.loading = false;
            return Err(e);
        }
    }

    match apply_chunks(runtime, state).await {
        Ok(total) => {
            let mut rt = runtime.lock().await;
            let result = finish(&mut rt, state, total);
            rt.loading = false;
            result?;
            Ok(total)
        }
        Err(e) => {
            let mut rt = runtime.lock().await;
            rt.loading = false;
            Err(e)
        }
    }
}

/// Swap in a fresh empty store at the same path and seed its best block.
fn begin(rt: &mut crate::lifecycle::Runtime, state: &StateHandle) -> Result<()> {
    rt.chainstate.coins.wipe()?;
    rt.chainstate
        .coins
        .set_best_block(state.latest_block_hash())?;
    tracing::info!(
        "Applying state {} (height {}, {} chunks) to an empty chainstate",
        state.state_hash(),
        state.height(),
        state.chunks().len()
    );
    Ok(())
}

async fn apply_chunks(runtime: &SharedRuntime, state: &StateHandle) -> Result<u64> {
    let mut total = 0u64;
    for chunk in state.chunks() {
        let mut rt = runtime.lock().await;
        if rt.shutdown.requested() {
            bail!("state application interrupted by shutdown");
        }

        let data = read_chunk(&chunk.file)
            .with_context(|| format!("loading chunk {}", chunk.offset))?;
        if data.offset != chunk.offset || data.height != state.height() {
            bail!(
                "chunk {} carries unexpected position {}/{}",
                chunk.file.display(),
                data.height,
                data.offset
            );
        }

        let count = data.utxos.len() as u64;
        for (outpoint, coin) in data.utxos {
            rt.chainstate.coins.add_coin(outpoint, coin, false)?;
        }
        total += count;
        tracing::info!(
            "Applied chunk {} / {} ({} UTXOs)",
            chunk.offset + 1,
            state.chunks().len(),
            count
        );
    }
    Ok(total)
}

/// Flush the rebuilt store and move the active tip to the state's block.
fn finish(rt: &mut crate::lifecycle::Runtime, state: &StateHandle, total: u64) -> Result<()> {
    rt.chainstate.coins.flush()?;
    rt.chainstate
        .chain
        .set_tip(&state.latest_block_hash())
        .context("state's block is unknown to the active chain")?;
    rt.metrics.inc_states_applied();
    tracing::info!(
        "Applied state file {} to the UTXO database ({} coins), tip now {}",
        state.file().display(),
        total,
        state.latest_block_hash()
    );
    Ok(())
}
