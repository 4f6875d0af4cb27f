//! State acquisition on a joining node: collect offers, commit to a state
//! once enough peers agree, download its chunks from many peers at once,
//! and hand off to full sync when the header chain has caught up.

use crate::core::hashing::hash_bytes;
use crate::core::types::{Hash256, MAX_DOWNLOADS_PER_PEER, REQUIRED_STATE_OFFERS};
use crate::lifecycle::SharedRuntime;
use crate::network::{PeerIndex, PeerManager};
use crate::shutdown::Shutdown;
use crate::snapshot::artifact::{chunk_file_path, state_file_name, state_file_path};
use crate::snapshot::{chunk, loader, StateHandle, StateMeta};
use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    Needed,
    InTransit,
    Stored,
}

/// What happened to a delivered chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored under its canonical name; the acquisition advanced.
    Accepted,
    /// Already stored, nothing to do.
    Duplicate,
    /// Bytes do not hash to any chunk we asked for; the peer misbehaved.
    Mismatch,
}

struct Offer {
    height: u32,
    meta: Vec<u8>,
    chunk_hashes: Vec<Hash256>,
    peers: HashSet<PeerIndex>,
}

pub struct Acquisition {
    state_dir: PathBuf,
    offers: HashMap<Hash256, Offer>,
    committed: Option<Hash256>,
    committed_height: u32,
    chunk_list: Vec<Hash256>,
    chunk_status: HashMap<Hash256, ChunkStatus>,
    in_transit: HashMap<PeerIndex, HashSet<Hash256>>,
}

impl Acquisition {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            offers: HashMap::new(),
            committed: None,
            committed_height: 0,
            chunk_list: Vec::new(),
            chunk_status: HashMap::new(),
            in_transit: HashMap::new(),
        }
    }

    pub fn committed(&self) -> Option<Hash256> {
        self.committed
    }

    pub fn committed_height(&self) -> u32 {
        self.committed_height
    }

    /// Record an offer. Once some state is offered by enough distinct peers
    /// we commit to it; with several qualifying states the highest one wins.
    /// Returns true when this call committed.
    pub fn handle_offer(
        &mut self,
        peer: PeerIndex,
        state_hash: Hash256,
        height: u32,
        meta: Vec<u8>,
        chunk_hashes: Vec<Hash256>,
    ) -> Result<bool> {
        if self.committed.is_some() {
            return Ok(false);
        }

        let decoded = StateMeta::decode(&meta).context("malformed metafile in offer")?;
        if decoded.height != height || decoded.num_chunks as usize != chunk_hashes.len() {
            bail!(
                "offer of {} is inconsistent: meta says height {} / {} chunks, offer says {} / {}",
                state_hash,
                decoded.height,
                decoded.num_chunks,
                height,
                chunk_hashes.len()
            );
        }

        let offer = self.offers.entry(state_hash).or_insert_with(|| Offer {
            height,
            meta,
            chunk_hashes,
            peers: HashSet::new(),
        });
        offer.peers.insert(peer);
        tracing::info!(
            "Peer {} offers state {} at height {} ({} offers now)",
            peer,
            state_hash,
            height,
            offer.peers.len()
        );

        let best = self
            .offers
            .iter()
            .filter(|(_, offer)| offer.peers.len() >= REQUIRED_STATE_OFFERS)
            .max_by_key(|(_, offer)| offer.height)
            .map(|(hash, _)| *hash);
        match best {
            Some(hash) => {
                self.commit(hash)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn commit(&mut self, state_hash: Hash256) -> Result<()> {
        let offer = self.offers.get(&state_hash).expect("offer exists");
        tracing::info!(
            "Committing to state {} at height {} with {} chunks",
            state_hash,
            offer.height,
            offer.chunk_hashes.len()
        );

        // Persist the metafile now; chunk files arrive around it.
        std::fs::create_dir_all(self.state_dir.join("chunks"))?;
        std::fs::write(state_file_path(&self.state_dir, offer.height), &offer.meta)?;

        self.committed = Some(state_hash);
        self.committed_height = offer.height;
        self.chunk_list = offer.chunk_hashes.clone();
        self.chunk_status = self
            .chunk_list
            .iter()
            .map(|hash| (*hash, ChunkStatus::Needed))
            .collect();
        Ok(())
    }

    /// Assign needed chunks to peers with download capacity. Flips each
    /// assigned chunk to in-transit; the caller sends the requests.
    pub fn schedule(&mut self, peers: &mut PeerManager) -> Vec<(PeerIndex, Vec<Hash256>)> {
        if self.committed.is_none() {
            return Vec::new();
        }

        let mut assignments = Vec::new();
        for idx in peers.connected_indices() {
            let Some(peer) = peers.get_mut(idx) else {
                continue;
            };
            if peer.in_flight_chunks >= MAX_DOWNLOADS_PER_PEER {
                continue;
            }
            let capacity = MAX_DOWNLOADS_PER_PEER - peer.in_flight_chunks;

            let mut batch = Vec::new();
            for hash in &self.chunk_list {
                if batch.len() >= capacity {
                    break;
                }
                if self.chunk_status.get(hash) == Some(&ChunkStatus::Needed) {
                    self.chunk_status.insert(*hash, ChunkStatus::InTransit);
                    self.in_transit.entry(idx).or_default().insert(*hash);
                    batch.push(*hash);
                }
            }

            if !batch.is_empty() {
                peer.in_flight_chunks += batch.len();
                tracing::info!("Requesting {} chunks from peer {}", batch.len(), idx);
                assignments.push((idx, batch));
            }
        }
        assignments
    }

    /// Handle a delivered chunk: verify its content hash against the
    /// committed chunk list and persist it under its canonical file name.
    pub fn handle_chunk(&mut self, peer: PeerIndex, bytes: &[u8]) -> Result<ChunkOutcome> {
        let hash = hash_bytes(bytes);
        match self.chunk_status.get(&hash) {
            Some(ChunkStatus::Stored) => {
                self.clear_in_transit(peer, &hash);
                return Ok(ChunkOutcome::Duplicate);
            }
            Some(ChunkStatus::Needed) | Some(ChunkStatus::InTransit) => {}
            None => return Ok(ChunkOutcome::Mismatch),
        }

        let data = chunk::decode_chunk(bytes).context("undecodable chunk payload")?;
        if data.height != self.committed_height {
            bail!(
                "chunk {} is for height {}, expected {}",
                hash,
                data.height,
                self.committed_height
            );
        }

        let path = chunk_file_path(&self.state_dir, data.height, data.offset);
        std::fs::write(&path, bytes)
            .with_context(|| format!("persisting chunk {}", path.display()))?;

        self.chunk_status.insert(hash, ChunkStatus::Stored);
        self.clear_in_transit(peer, &hash);
        tracing::info!(
            "Stored chunk {} of state (offset {}, {} left)",
            hash,
            data.offset,
            self.remaining()
        );
        Ok(ChunkOutcome::Accepted)
    }

    fn clear_in_transit(&mut self, peer: PeerIndex, hash: &Hash256) {
        if let Some(set) = self.in_transit.get_mut(&peer) {
            set.remove(hash);
        }
    }

    /// Requeue everything a failed peer had in transit.
    pub fn fail_peer(&mut self, peer: PeerIndex) -> usize {
        let Some(chunks) = self.in_transit.remove(&peer) else {
            return 0;
        };
        let mut requeued = 0;
        for hash in chunks {
            if self.chunk_status.get(&hash) == Some(&ChunkStatus::InTransit) {
                self.chunk_status.insert(hash, ChunkStatus::Needed);
                requeued += 1;
            }
        }
        if requeued > 0 {
            tracing::warn!("Requeued {} chunks from failed peer {}", requeued, peer);
        }
        requeued
    }

    pub fn remaining(&self) -> usize {
        self.chunk_status
            .values()
            .filter(|status| **status != ChunkStatus::Stored)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.committed.is_some() && self.remaining() == 0
    }

    /// Assemble the completed download into a state handle and verify the
    /// aggregate hash against what the network committed to.
    pub fn assemble(&self, shutdown: &Shutdown) -> Result<StateHandle> {
        let committed = self.committed.context("nothing committed")?;
        let state = StateHandle::load(
            &self.state_dir,
            &state_file_name(self.committed_height),
            shutdown,
        )?;
        state.verify_hash(&committed)?;
        Ok(state)
    }
}

/// Hand off to normal block sync once the header chain has reached the
/// downloaded state's height: apply the state and flip the one-way flag.
/// Returns true when the switch happened on this call.
pub async fn try_switch_to_full_sync(runtime: &SharedRuntime) -> Result<bool> {
    let state = {
        let mut rt = runtime.lock().await;
        if rt.full_sync_mode {
            return Ok(false);
        }
        let Some(downloaded) = &rt.downloaded else {
            return Ok(false);
        };
        if rt.header_best_known < downloaded.height() {
            return Ok(false);
        }
        rt.downloaded.take().expect("checked above")
    };

    tracing::info!(
        "Header chain caught up to {}, applying downloaded state {}",
        state.height(),
        state.state_hash()
    );
    loader::apply(runtime, &state).await?;

    let mut rt = runtime.lock().await;
    rt.current = Some(state);
    rt.enter_full_sync();
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_parts(height: u32, num_chunks: u32) -> (Vec<u8>, Vec<Hash256>) {
        let meta = StateMeta {
            height,
            latest_block_hash: Hash256([0xEE; 32]),
            num_chunks,
        };
        let chunk_hashes = (0..num_chunks)
            .map(|i| Hash256([i as u8 + 1; 32]))
            .collect();
        (meta.encode(), chunk_hashes)
    }

    #[test]
    fn commits_only_at_offer_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut acq = Acquisition::new(dir.path().to_path_buf());
        let (meta, chunks) = offer_parts(100, 2);
        let state_hash = Hash256([0x42; 32]);

        for peer in 0..REQUIRED_STATE_OFFERS as u64 - 1 {
            let committed = acq
                .handle_offer(peer, state_hash, 100, meta.clone(), chunks.clone())
                .unwrap();
            assert!(!committed);
        }
        let committed = acq
            .handle_offer(99, state_hash, 100, meta, chunks)
            .unwrap();
        assert!(committed);
        assert_eq!(acq.committed(), Some(state_hash));
        assert_eq!(acq.remaining(), 2);
    }

    #[test]
    fn repeated_offers_from_one_peer_count_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut acq = Acquisition::new(dir.path().to_path_buf());
        let (meta, chunks) = offer_parts(100, 1);
        let state_hash = Hash256([0x42; 32]);

        for _ in 0..REQUIRED_STATE_OFFERS * 2 {
            let committed = acq
                .handle_offer(5, state_hash, 100, meta.clone(), chunks.clone())
                .unwrap();
            assert!(!committed);
        }
        assert_eq!(acq.committed(), None);
    }

    #[test]
    fn higher_state_wins_the_tie_break() {
        let dir = tempfile::tempdir().unwrap();
        let mut acq = Acquisition::new(dir.path().to_path_buf());
        let (meta_low, chunks_low) = offer_parts(100, 1);
        let (meta_high, chunks_high) = offer_parts(200, 1);
        let low = Hash256([0x01; 32]);
        let high = Hash256([0x02; 32]);

        // Both reach the threshold in the same round of replies; the low
        // state gets there first but must not win.
        for peer in 0..REQUIRED_STATE_OFFERS as u64 - 1 {
            acq.handle_offer(peer, low, 100, meta_low.clone(), chunks_low.clone())
                .unwrap();
            acq.handle_offer(100 + peer, high, 200, meta_high.clone(), chunks_high.clone())
                .unwrap();
        }
        let committed = acq
            .handle_offer(500, high, 200, meta_high, chunks_high)
            .unwrap();
        assert!(committed);
        assert_eq!(acq.committed(), Some(high));
        assert_eq!(acq.committed_height(), 200);

        // A late qualifying offer for the lower state changes nothing.
        assert!(!acq.handle_offer(501, low, 100, meta_low, chunks_low).unwrap());
        assert_eq!(acq.committed(), Some(high));
    }

    #[test]
    fn inconsistent_offer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut acq = Acquisition::new(dir.path().to_path_buf());
        let (meta, chunks) = offer_parts(100, 2);

        // Claimed height disagrees with the metafile.
        assert!(acq
            .handle_offer(0, Hash256([1u8; 32]), 101, meta, chunks)
            .is_err());
    }
}
