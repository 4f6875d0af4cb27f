//! Coinbase-embedded state confirmations.
//!
//! Miners prepend `CoinPrune/<state_hash>/` to the coinbase input script;
//! counting such tags across the chain is what promotes a state from
//! tentative to confirmed.

use crate::chainstate::{BlockStore, ChainIndex};
use crate::core::types::{
    Block, Hash256, CONFIRMATION_SEPARATOR, CONFIRMATION_TAG, MAX_COINBASE_SCRIPT_SIZE,
};
use crate::shutdown::Shutdown;
use anyhow::{bail, Result};
use std::collections::HashMap;

/// Tag, two separators, and the hash itself.
const EMBEDDING_LEN: usize = CONFIRMATION_TAG.len() + 2 + 32;

/// Prepend a confirmation for `state_hash` to a coinbase script. The old
/// script content shifts right and is truncated so the result never exceeds
/// the coinbase script cap.
pub fn embed_confirmation(script: &mut Vec<u8>, state_hash: &Hash256) {
    let kept = script.len().min(MAX_COINBASE_SCRIPT_SIZE - EMBEDDING_LEN);

    let mut embedded = Vec::with_capacity(EMBEDDING_LEN + kept);
    embedded.extend_from_slice(CONFIRMATION_TAG);
    embedded.push(CONFIRMATION_SEPARATOR);
    embedded.extend_from_slice(state_hash.as_bytes());
    embedded.push(CONFIRMATION_SEPARATOR);
    embedded.extend_from_slice(&script[..kept]);

    *script = embedded;
}

/// Find the confirmation tag in a script and return the index just past its
/// last byte. Plain forward search that backtracks by the matched prefix on
/// a mismatch; scripts are tiny.
fn find_tag(script: &[u8]) -> Option<usize> {
    let mut matched = 0usize;
    let mut i = 0usize;
    while i < script.len() {
        if script[i] == CONFIRMATION_TAG[matched] {
            matched += 1;
            if matched == CONFIRMATION_TAG.len() {
                return Some(i + 1);
            }
        } else {
            i -= matched;
            matched = 0;
        }
        i += 1;
    }
    None
}

/// Extract the confirmed state hash from a block's coinbase, if present.
pub fn scan_block(block: &Block) -> Option<Hash256> {
    let coinbase = block.txs.first()?;
    let script = &coinbase.inputs.first()?.script_sig;

    let pos = find_tag(script)?;
    let hash_start = pos + 1; // one separator past the tag
    if script.len() < hash_start + 32 {
        tracing::debug!("Confirmation tag found but script too short for a hash");
        return None;
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&script[hash_start..hash_start + 32]);
    Some(Hash256(hash))
}

/// Counts confirmations per state hash and decides when a state is trusted.
pub struct ConfirmationTracker {
    confirmations: HashMap<Hash256, u32>,
    required: u32,
}

impl ConfirmationTracker {
    pub fn new(required: u32) -> Self {
        Self {
            confirmations: HashMap::new(),
            required,
        }
    }

    pub fn record(&mut self, state_hash: Hash256) {
        *self.confirmations.entry(state_hash).or_insert(0) += 1;
    }

    pub fn count(&self, state_hash: &Hash256) -> u32 {
        self.confirmations.get(state_hash).copied().unwrap_or(0)
    }

    pub fn is_confirmed(&self, state_hash: &Hash256) -> bool {
        self.count(state_hash) >= self.required
    }

    pub fn clear(&mut self) {
        self.confirmations.clear();
    }
}

/// Walk the active chain from the tip downward, recording every embedded
/// confirmation, and return the first height at which some state hash
/// reaches the threshold. Falls back to `(floor, None)` when nothing is
/// sufficiently confirmed. The tracker is reset before the walk so blocks
/// are never double counted across rescans.
pub fn last_confirmed_in_active_chain(
    tracker: &mut ConfirmationTracker,
    chain: &ChainIndex,
    blocks: &BlockStore,
    floor: u32,
    shutdown: &Shutdown,
) -> Result<(u32, Option<Hash256>)> {
    tracker.clear();

    let Some(tip) = chain.tip_height() else {
        return Ok((floor, None));
    };

    let mut height = tip;
    while height >= floor {
        if shutdown.requested() {
            bail!("confirmation rescan interrupted by shutdown");
        }

        match blocks.load_block(height)? {
            Some(block) => {
                if let Some(hash) = scan_block(&block) {
                    tracker.record(hash);
                    if tracker.is_confirmed(&hash) {
                        tracing::info!("Last confirmed state is {} at height {}", hash, height);
                        return Ok((height, Some(hash)));
                    }
                }
            }
            None => tracing::warn!("Could not read block {} from disk", height),
        }

        if height == 0 {
            break;
        }
        height -= 1;
    }

    tracing::info!("No confirmed state found on the active chain");
    Ok((floor, None))
}
