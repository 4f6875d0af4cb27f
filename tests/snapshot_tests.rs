use coinprune::chainstate::{ChainState, ChainStateStore, CoinsView};
use coinprune::core::hashing::hash_file;
use coinprune::core::types::{
    Block, BlockHeader, Hash256, OutPoint, Transaction, TxIn, TxOut, MAX_CHUNK_SIZE,
};
use coinprune::lifecycle::{self, CompactionConfig, Runtime};
use coinprune::metrics::Metrics;
use coinprune::shutdown::Shutdown;
use coinprune::snapshot::{self, artifact, loader};
use std::path::Path;

fn coinbase_tx(height_tag: u32, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        inputs: vec![TxIn {
            prevout: OutPoint::new(Hash256::ZERO, u32::MAX),
            // Unique per height so coinbase txids never collide.
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

/// Three coins at heights 1 and 2: 50 @ script A, then 25 @ B and 10 @ C.
fn three_coin_chain(dir: &Path) -> (ChainState, Vec<Block>) {
    let mut cs = ChainState::open(dir).unwrap();

    let genesis = block(Hash256::ZERO, 0, Vec::new());
    cs.connect_block(&genesis).unwrap();

    let b1 = block(
        genesis.hash(),
        1,
        vec![coinbase_tx(
            1,
            vec![TxOut {
                amount: 50,
                script: vec![0xA1, 0xA2],
            }],
        )],
    );
    cs.connect_block(&b1).unwrap();

    let b2 = block(
        b1.hash(),
        2,
        vec![coinbase_tx(
            2,
            vec![
                TxOut {
                    amount: 25,
                    script: vec![0xB1],
                },
                TxOut {
                    amount: 10,
                    script: vec![0xC1, 0xC2, 0xC3],
                },
            ],
        )],
    );
    cs.connect_block(&b2).unwrap();

    cs.coins.flush().unwrap();
    (cs, vec![genesis, b1, b2])
}

#[test]
fn identical_chains_build_identical_states() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (cs_a, _) = three_coin_chain(dir_a.path());
    let (cs_b, _) = three_coin_chain(dir_b.path());
    let shutdown = Shutdown::new();

    let state_a = snapshot::build(&cs_a, 2, &dir_a.path().join("states"), &shutdown).unwrap();
    let state_b = snapshot::build(&cs_b, 2, &dir_b.path().join("states"), &shutdown).unwrap();

    assert_eq!(state_a.state_hash(), state_b.state_hash());
    assert_eq!(state_a.chunks().len(), 1);
    assert_eq!(state_b.chunks().len(), 1);
    assert_eq!(state_a.chunks()[0].hash, state_b.chunks()[0].hash);
    assert_eq!(state_a.chunks()[0].n_utxos, 3);
}

#[test]
fn state_hash_is_a_pure_function_of_the_files() {
    let dir = tempfile::tempdir().unwrap();
    let (cs, _) = three_coin_chain(dir.path());
    let shutdown = Shutdown::new();
    let state_dir = dir.path().join("states");

    let state = snapshot::build(&cs, 2, &state_dir, &shutdown).unwrap();

    assert_eq!(
        hash_file(state.file(), &shutdown).unwrap(),
        state.state_file_hash()
    );
    let chunk_hashes: Vec<Hash256> = state.chunks().iter().map(|c| c.hash).collect();
    assert_eq!(
        artifact::compute_state_hash(&state.state_file_hash(), &chunk_hashes),
        state.state_hash()
    );

    // Reloading from disk reproduces the same identity.
    let reloaded = snapshot::StateHandle::load(
        &state_dir,
        &artifact::state_file_name(2),
        &shutdown,
    )
    .unwrap();
    assert_eq!(reloaded.state_hash(), state.state_hash());
}

#[test]
fn building_at_tip_equals_building_at_zero() {
    let dir = tempfile::tempdir().unwrap();
    let (cs, _) = three_coin_chain(dir.path());
    let shutdown = Shutdown::new();

    let at_tip = snapshot::build(&cs, 2, &dir.path().join("s1"), &shutdown).unwrap();
    let at_zero = snapshot::build(&cs, 0, &dir.path().join("s2"), &shutdown).unwrap();

    assert_eq!(at_tip.height(), at_zero.height());
    assert_eq!(at_tip.state_hash(), at_zero.state_hash());
}

#[test]
fn empty_utxo_set_builds_a_chunkless_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut cs = ChainState::open(dir.path()).unwrap();
    cs.connect_block(&block(Hash256::ZERO, 0, Vec::new())).unwrap();
    cs.coins.flush().unwrap();
    let shutdown = Shutdown::new();

    let state = snapshot::build(&cs, 0, &dir.path().join("states"), &shutdown).unwrap();
    assert_eq!(state.height(), 0);
    assert_eq!(state.chunks().len(), 0);
    assert_eq!(
        state.state_hash(),
        artifact::compute_state_hash(&state.state_file_hash(), &[])
    );
}

#[test]
fn rewinding_a_spend_restores_the_coin() {
    let dir = tempfile::tempdir().unwrap();
    let (mut cs, blocks) = three_coin_chain(dir.path());

    // Height 3 spends the height-1 coin.
    let spent_outpoint = OutPoint::new(blocks[1].txs[0].txid(), 0);
    let spend = Transaction {
        inputs: vec![TxIn {
            prevout: spent_outpoint,
            script_sig: vec![0x51],
        }],
        outputs: vec![TxOut {
            amount: 49,
            script: vec![0xD1],
        }],
    };
    let created_outpoint = OutPoint::new(spend.txid(), 0);
    let b3 = block(blocks[2].hash(), 3, vec![coinbase_tx(3, Vec::new()), spend]);
    cs.connect_block(&b3).unwrap();
    cs.coins.flush().unwrap();

    let shutdown = Shutdown::new();
    let mut view = CoinsView::load_from(&cs.coins).unwrap();
    assert!(!view.contains(&spent_outpoint));
    assert!(view.contains(&created_outpoint));

    let (undone, usable) =
        snapshot::rewind_and_remember(&mut view, &cs.chain, &cs.blocks, 2, &shutdown).unwrap();
    assert!(usable);
    assert_eq!(undone.len(), 1);
    assert_eq!(undone[0].height, 3);
    assert_eq!(undone[0].hash, b3.hash());

    assert!(view.contains(&spent_outpoint));
    assert!(!view.contains(&created_outpoint));
    assert_eq!(view.best_block(), blocks[2].hash());

    // The canonical store is untouched by the private view.
    assert!(cs.coins.get_coin(&spent_outpoint).unwrap().is_none());
}

#[test]
fn build_below_tip_matches_a_chain_that_stopped_there() {
    let dir_long = tempfile::tempdir().unwrap();
    let dir_short = tempfile::tempdir().unwrap();
    let shutdown = Shutdown::new();

    let (mut cs_long, blocks) = three_coin_chain(dir_long.path());
    let b3 = block(
        blocks[2].hash(),
        3,
        vec![coinbase_tx(
            3,
            vec![TxOut {
                amount: 12,
                script: vec![0xE1],
            }],
        )],
    );
    cs_long.connect_block(&b3).unwrap();
    cs_long.coins.flush().unwrap();

    let (cs_short, _) = three_coin_chain(dir_short.path());

    let rewound = snapshot::build(&cs_long, 2, &dir_long.path().join("states"), &shutdown).unwrap();
    let direct = snapshot::build(&cs_short, 2, &dir_short.path().join("states"), &shutdown).unwrap();

    assert_eq!(rewound.state_hash(), direct.state_hash());
}

#[test]
fn oversized_sets_split_into_bounded_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let mut cs = ChainState::open(dir.path()).unwrap();
    let genesis = block(Hash256::ZERO, 0, Vec::new());
    cs.connect_block(&genesis).unwrap();

    // ~1100 outputs of ~1 KB each: more than one chunk, less than three.
    let outputs: Vec<TxOut> = (0..1100u32)
        .map(|i| TxOut {
            amount: i as u64 + 1,
            script: vec![(i % 251) as u8; 1000],
        })
        .collect();
    let b1 = block(genesis.hash(), 1, vec![coinbase_tx(1, outputs)]);
    cs.connect_block(&b1).unwrap();
    cs.coins.flush().unwrap();

    let shutdown = Shutdown::new();
    let state_dir = dir.path().join("states");
    let state = snapshot::build(&cs, 1, &state_dir, &shutdown).unwrap();

    assert_eq!(state.chunks().len(), 2);
    let mut total_utxos = 0;
    for (i, chunk) in state.chunks().iter().enumerate() {
        assert_eq!(chunk.offset as usize, i);
        let size = std::fs::metadata(&chunk.file).unwrap().len() as usize;
        assert!(size <= MAX_CHUNK_SIZE, "chunk {} is {} bytes", i, size);
        total_utxos += chunk.n_utxos;
    }
    assert_eq!(total_utxos, 1100);

    // The first entry of chunk 1 would not have fit into chunk 0: entries
    // move whole, they are never split.
    let chunk0_size = std::fs::metadata(&state.chunks()[0].file).unwrap().len() as usize;
    let chunk1 = snapshot::chunk::read_chunk(&state.chunks()[1].file).unwrap();
    let first_entry_len =
        coinprune::core::codec::coin_entry_len(&chunk1.utxos[0].1);
    assert!(chunk0_size + first_entry_len > MAX_CHUNK_SIZE);
}

#[tokio::test]
async fn apply_round_trips_the_coin_set() {
    let provider_dir = tempfile::tempdir().unwrap();
    let joiner_dir = tempfile::tempdir().unwrap();
    let shutdown = Shutdown::new();

    let (cs, blocks) = three_coin_chain(provider_dir.path());
    let state_dir = provider_dir.path().join("states");
    let state = snapshot::build(&cs, 2, &state_dir, &shutdown).unwrap();
    let expected = cs.coins.ordered_coins().unwrap();

    // Fresh node that knows the headers but has no coins.
    let mut joiner = Runtime::open(
        joiner_dir.path(),
        CompactionConfig::default(),
        Shutdown::new(),
        Metrics::new(),
    )
    .unwrap();
    for b in &blocks {
        joiner.chainstate.chain.add_header(b.hash());
    }
    let runtime = lifecycle::shared(joiner);

    let applied = loader::apply(&runtime, &state).await.unwrap();
    assert_eq!(applied, 3);

    let rt = runtime.lock().await;
    assert_eq!(rt.chainstate.coins.best_block().unwrap(), blocks[2].hash());
    assert_eq!(rt.chainstate.chain.tip_height(), Some(2));
    for (outpoint, coin) in &expected {
        assert_eq!(
            rt.chainstate.coins.get_coin(outpoint).unwrap().as_ref(),
            Some(coin)
        );
    }
    assert!(rt
        .chainstate
        .coins
        .get_coin(&OutPoint::new(Hash256([0xFF; 32]), 0))
        .unwrap()
        .is_none());
    assert_eq!(rt.chainstate.coins.coin_count().unwrap(), 3);
    assert!(!rt.loading);
}

#[tokio::test]
async fn concurrent_apply_is_rejected_without_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = Shutdown::new();
    let (cs, blocks) = three_coin_chain(dir.path());
    let state = snapshot::build(&cs, 2, &dir.path().join("states"), &shutdown).unwrap();

    let joiner_dir = tempfile::tempdir().unwrap();
    let mut joiner = Runtime::open(
        joiner_dir.path(),
        CompactionConfig::default(),
        Shutdown::new(),
        Metrics::new(),
    )
    .unwrap();
    for b in &blocks {
        joiner.chainstate.chain.add_header(b.hash());
    }
    joiner.loading = true; // simulate an apply already in flight
    let runtime = lifecycle::shared(joiner);

    let err = loader::apply(&runtime, &state).await.unwrap_err();
    assert!(err.to_string().contains("Aborting"));

    let rt = runtime.lock().await;
    assert_eq!(rt.chainstate.coins.coin_count().unwrap(), 0);
    assert!(rt.loading, "the flag of the real load must survive");
}
