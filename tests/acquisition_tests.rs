use coinprune::acquire::{Acquisition, ChunkOutcome};
use coinprune::chainstate::{ChainState, ChainStateStore};
use coinprune::core::types::{
    Block, BlockHeader, Hash256, OutPoint, Transaction, TxIn, TxOut, MAX_DOWNLOADS_PER_PEER,
    REQUIRED_STATE_OFFERS,
};
use coinprune::network::{PeerConnection, PeerManager};
use coinprune::shutdown::Shutdown;
use coinprune::snapshot::{self, StateHandle, StateMeta};
use std::path::Path;
use tokio::net::TcpListener;

fn coinbase_tx(height_tag: u32, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        inputs: vec![TxIn {
            prevout: OutPoint::new(Hash256::ZERO, u32::MAX),
            script_sig: height_tag.to_le_bytes().to_vec(),
        }],
        outputs,
    }
}

fn block(prev_hash: Hash256, time: u64, txs: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            prev_hash,
            merkle_root: Hash256::ZERO,
            time,
        },
        txs,
    }
}

/// Provider-side fixture: a small chain and its built state.
fn provider_state(dir: &Path) -> StateHandle {
    let mut cs = ChainState::open(dir).unwrap();
    let genesis = block(Hash256::ZERO, 0, Vec::new());
    cs.connect_block(&genesis).unwrap();
    let b1 = block(
        genesis.hash(),
        1,
        vec![coinbase_tx(
            1,
            vec![
                TxOut {
                    amount: 50,
                    script: vec![0xA1],
                },
                TxOut {
                    amount: 25,
                    script: vec![0xB2; 40],
                },
            ],
        )],
    );
    cs.connect_block(&b1).unwrap();
    cs.coins.flush().unwrap();
    snapshot::build(&cs, 1, &dir.join("states"), &Shutdown::new()).unwrap()
}

fn offer_to_all(acq: &mut Acquisition, state: &StateHandle) {
    let meta = state.meta().encode();
    let chunk_hashes = state.chunk_hashes();
    for peer in 0..REQUIRED_STATE_OFFERS as u64 {
        acq.handle_offer(
            peer,
            state.state_hash(),
            state.height(),
            meta.clone(),
            chunk_hashes.clone(),
        )
        .unwrap();
    }
}

#[test]
fn transferred_chunks_reassemble_the_offered_state() {
    let provider_dir = tempfile::tempdir().unwrap();
    let joiner_dir = tempfile::tempdir().unwrap();
    let state = provider_state(provider_dir.path());

    let mut acq = Acquisition::new(joiner_dir.path().to_path_buf());
    offer_to_all(&mut acq, &state);
    assert_eq!(acq.committed(), Some(state.state_hash()));

    for chunk in state.chunks() {
        let bytes = std::fs::read(&chunk.file).unwrap();
        assert_eq!(acq.handle_chunk(3, &bytes).unwrap(), ChunkOutcome::Accepted);
    }
    assert!(acq.is_complete());

    let assembled = acq.assemble(&Shutdown::new()).unwrap();
    assert_eq!(assembled.state_hash(), state.state_hash());
    assert_eq!(assembled.height(), state.height());
    assert_eq!(assembled.chunks().len(), state.chunks().len());
}

#[test]
fn redelivered_chunk_is_a_duplicate() {
    let provider_dir = tempfile::tempdir().unwrap();
    let joiner_dir = tempfile::tempdir().unwrap();
    let state = provider_state(provider_dir.path());

    let mut acq = Acquisition::new(joiner_dir.path().to_path_buf());
    offer_to_all(&mut acq, &state);

    let bytes = std::fs::read(&state.chunks()[0].file).unwrap();
    assert_eq!(acq.handle_chunk(0, &bytes).unwrap(), ChunkOutcome::Accepted);
    assert_eq!(acq.handle_chunk(1, &bytes).unwrap(), ChunkOutcome::Duplicate);
}

#[test]
fn garbage_bytes_are_a_mismatch() {
    let provider_dir = tempfile::tempdir().unwrap();
    let joiner_dir = tempfile::tempdir().unwrap();
    let state = provider_state(provider_dir.path());

    let mut acq = Acquisition::new(joiner_dir.path().to_path_buf());
    offer_to_all(&mut acq, &state);

    assert_eq!(
        acq.handle_chunk(0, b"not a chunk").unwrap(),
        ChunkOutcome::Mismatch
    );
    assert!(!acq.is_complete());
}

/// Spin up a throwaway remote peer so the manager has a connected entry.
async fn connected_manager() -> (PeerManager, coinprune::network::PeerIndex) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, peer_addr) = listener.accept().await.unwrap();
        let mut conn = PeerConnection::from_stream(stream, peer_addr);
        conn.accept_handshake(500).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    });

    let (mut mgr, _rx) = PeerManager::new();
    let idx = mgr.connect_to_peer(addr, 0).await.unwrap();
    (mgr, idx)
}

#[tokio::test]
async fn scheduling_respects_the_per_peer_cap() {
    let joiner_dir = tempfile::tempdir().unwrap();
    let mut acq = Acquisition::new(joiner_dir.path().to_path_buf());

    // Offer of a state with more chunks than one peer may carry at once.
    let num_chunks = MAX_DOWNLOADS_PER_PEER as u32 + 4;
    let meta = StateMeta {
        height: 300,
        latest_block_hash: Hash256([0xEE; 32]),
        num_chunks,
    }
    .encode();
    let chunk_hashes: Vec<Hash256> = (0..num_chunks).map(|i| Hash256([i as u8 + 1; 32])).collect();
    for peer in 0..REQUIRED_STATE_OFFERS as u64 {
        acq.handle_offer(peer, Hash256([0x77; 32]), 300, meta.clone(), chunk_hashes.clone())
            .unwrap();
    }

    let (mut mgr, idx) = connected_manager().await;

    let assignments = acq.schedule(&mut mgr);
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].0, idx);
    assert_eq!(assignments[0].1.len(), MAX_DOWNLOADS_PER_PEER);
    assert_eq!(mgr.get(idx).unwrap().in_flight_chunks, MAX_DOWNLOADS_PER_PEER);

    // The peer is maxed out; nothing further is assigned to it.
    assert!(acq.schedule(&mut mgr).is_empty());
    assert_eq!(acq.remaining() as u32, num_chunks);
}

#[tokio::test]
async fn failed_peer_chunks_are_requeued_and_rescheduled() {
    let joiner_dir = tempfile::tempdir().unwrap();
    let mut acq = Acquisition::new(joiner_dir.path().to_path_buf());

    let meta = StateMeta {
        height: 300,
        latest_block_hash: Hash256([0xEE; 32]),
        num_chunks: 4,
    }
    .encode();
    let chunk_hashes: Vec<Hash256> = (0..4).map(|i| Hash256([i as u8 + 1; 32])).collect();
    for peer in 0..REQUIRED_STATE_OFFERS as u64 {
        acq.handle_offer(peer, Hash256([0x77; 32]), 300, meta.clone(), chunk_hashes.clone())
            .unwrap();
    }

    let (mut mgr, idx) = connected_manager().await;
    let assignments = acq.schedule(&mut mgr);
    assert_eq!(assignments[0].1.len(), 4);

    // The peer delivers junk: everything it carried goes back to needed.
    assert_eq!(
        acq.handle_chunk(idx, b"junk").unwrap(),
        ChunkOutcome::Mismatch
    );
    assert_eq!(acq.fail_peer(idx), 4);
    if let Some(peer) = mgr.get_mut(idx) {
        peer.in_flight_chunks = 0;
    }

    let again = acq.schedule(&mut mgr);
    assert_eq!(again[0].1.len(), 4, "requeued chunks get rescheduled");
}
