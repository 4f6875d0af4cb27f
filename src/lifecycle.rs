//! State lifecycle: the tentative `current`, the confirmed `prev`, and the
//! `downloaded` staging slot, plus the rotation that happens when the chain
//! confirms a state.

use crate::chainstate::{ChainState, ChainStateStore};
use crate::confirm::{self, ConfirmationTracker};
use crate::core::types::{
    Block, BlockIndex, INITIAL_STATE_HEIGHT, REQUIRED_CONFIRMATIONS, SERVE_TAIL_LENGTH,
};
use crate::metrics::Metrics;
use crate::quiesce::{QuiesceCoordinator, TargetSlot};
use crate::shutdown::Shutdown;
use crate::snapshot::{self, StateHandle};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything below the chainstate lock: the store, the state slots, and
/// the confirmation bookkeeping. One mutex guards the lot.
pub type SharedRuntime = Arc<Mutex<Runtime>>;

#[derive(Clone, Debug, Default)]
pub struct CompactionConfig {
    /// Join via a downloaded state instead of replaying history.
    pub compaction: bool,
    /// Serve states to peers and embed confirmations when mining.
    pub provide_state: bool,
    /// Load this local state file at startup instead of asking the network.
    pub statename: Option<String>,
    /// Delete block files below the last confirmed state.
    pub prune: bool,
}

pub struct Runtime {
    pub chainstate: ChainState,
    pub state_dir: PathBuf,
    pub config: CompactionConfig,

    /// Tentative state awaiting confirmations.
    pub current: Option<Box<StateHandle>>,
    /// Last confirmed state; its files are served to joining peers.
    pub prev: Option<Box<StateHandle>>,
    /// Staging slot for a peer-provided state during join.
    pub downloaded: Option<Box<StateHandle>>,

    pub confirmations: ConfirmationTracker,

    /// True once at least one state is confirmed (or the chain was already
    /// long enough at startup).
    pub sync_complete: bool,
    /// One-way flag: the node has handed off to normal block sync.
    pub full_sync_mode: bool,
    /// A state is being applied; concurrent applies are rejected.
    pub loading: bool,
    /// Best header height learned from peers.
    pub header_best_known: u32,

    pub shutdown: Shutdown,
    pub metrics: Metrics,
}

impl Runtime {
    pub fn open(
        data_dir: &std::path::Path,
        config: CompactionConfig,
        shutdown: Shutdown,
        metrics: Metrics,
    ) -> Result<Self> {
        let chainstate = ChainState::open(data_dir)?;
        let state_dir = data_dir.join("compaction_states");

        Ok(Self {
            chainstate,
            state_dir,
            config,
            current: None,
            prev: None,
            downloaded: None,
            confirmations: ConfirmationTracker::new(REQUIRED_CONFIRMATIONS),
            sync_complete: false,
            full_sync_mode: false,
            loading: false,
            header_best_known: 0,
            shutdown,
            metrics,
        })
    }

    /// Startup: create directories, decide between join-via-state and full
    /// sync, and rebuild the provider state from the chain if we serve.
    pub fn initialize(&mut self) -> Result<()> {
        tracing::info!("Initializing compaction mode");
        std::fs::create_dir_all(self.state_dir.join("chunks"))?;

        let tip = self.chainstate.chain.tip_height();
        self.sync_complete = tip.is_some_and(|h| h >= INITIAL_STATE_HEIGHT);
        tracing::info!(
            "Synchronization is {} complete on this peer",
            if self.sync_complete { "already" } else { "NOT" }
        );

        if !self.sync_complete {
            if self.config.compaction {
                // Joining via a state requires a virgin UTXO database.
                if !self.chainstate.coins.best_block()?.is_zero() {
                    tracing::error!(
                        "UTXO database is not empty at synchronization start up, shutting down"
                    );
                    self.shutdown.request();
                    return Ok(());
                }

                match self.config.statename.clone() {
                    Some(file_name) => {
                        tracing::info!("Loading locally provided state {}", file_name);
                        let state =
                            StateHandle::load(&self.state_dir, &file_name, &self.shutdown)?;
                        self.downloaded = Some(Box::new(state));
                    }
                    None => {
                        // The state is requested from peers on version-ack.
                        tracing::info!("No local state given, downloading from peers");
                    }
                }
            } else {
                self.enter_full_sync();
                tracing::info!("Slow synchronization, consider restarting with --compaction");
            }
        } else {
            self.enter_full_sync();
        }

        if self.config.provide_state && self.sync_complete {
            self.initialize_provider_state()?;
        }
        Ok(())
    }

    /// Reconstruct the last confirmed state from our own chain so we can
    /// serve it. A mismatch against the on-chain confirmation is fatal.
    fn initialize_provider_state(&mut self) -> Result<()> {
        let (height, confirmed_hash) = confirm::last_confirmed_in_active_chain(
            &mut self.confirmations,
            &self.chainstate.chain,
            &self.chainstate.blocks,
            INITIAL_STATE_HEIGHT,
            &self.shutdown,
        )?;
        tracing::info!("Found last confirmed state at block height {}", height);

        let tip = self.chainstate.chain.tip_height().unwrap_or(0);
        if tip < height {
            return Ok(());
        }

        // No peer traffic yet, so the view is stable without pausing.
        self.chainstate.coins.flush()?;
        let state = snapshot::build(&self.chainstate, height, &self.state_dir, &self.shutdown)?;
        self.metrics.inc_states_built();

        if let Some(confirmed) = confirmed_hash {
            if confirmed != state.state_hash() && state.height() != INITIAL_STATE_HEIGHT {
                tracing::error!(
                    "The confirmed state {} does not match our own {}, shutting down",
                    confirmed,
                    state.state_hash()
                );
                self.shutdown.request();
                return Ok(());
            }
        }
        self.current = Some(Box::new(state));
        Ok(())
    }

    /// Scan a freshly connected block for a confirmation and rotate the
    /// state slots when the tally reaches the threshold. Safe to call twice
    /// with the same block's outcome: a hash whose state already rotated is
    /// a no-op.
    pub fn handle_new_block(
        &mut self,
        block: &Block,
        index: &BlockIndex,
        quiesce: &mut QuiesceCoordinator,
    ) -> Result<()> {
        let Some(hash) = confirm::scan_block(block) else {
            return Ok(());
        };
        tracing::info!("Found confirmation for state {}", hash);
        self.confirmations.record(hash);
        self.metrics.inc_confirmations_seen();

        if !self.confirmations.is_confirmed(&hash) {
            return Ok(());
        }
        tracing::info!("State {} is sufficiently confirmed", hash);

        match &self.current {
            Some(current) if current.state_hash() != hash => {
                tracing::error!(
                    "WARNING: current state {} does not match confirmed {}. Consider resynchronizing!",
                    current.state_hash(),
                    hash
                );
                self.shutdown.request();
                return Ok(());
            }
            None => {
                // Already rotated for this hash while the next build is
                // still pending; extra confirmations change nothing.
                if self.prev.as_ref().is_some_and(|p| p.state_hash() == hash) {
                    return Ok(());
                }
                tracing::error!(
                    "Network confirmed state {} which we do not hold. Consider resynchronizing!",
                    hash
                );
                self.shutdown.request();
                return Ok(());
            }
            Some(_) => {}
        }

        // Rotate: the old confirmed state's files go away exactly once.
        if let Some(old_prev) = self.prev.take() {
            old_prev.delete_files()?;
        }
        let mut current = self.current.take().expect("checked above");
        current.set_confirmed();
        current.clear_previous();
        self.prev = Some(current);

        quiesce.set_want_to_build(index.height, TargetSlot::Current, true);

        if self.config.prune {
            // Keep blocks from prev on so its confirmations stay collectable.
            let keep_from = self.prev.as_ref().expect("just rotated").height();
            self.chainstate.prune_blocks_up_to(keep_from)?;
        }

        self.sync_complete = true;
        Ok(())
    }

    /// One-way switch into normal block sync. Without a downloaded state
    /// this is just the legacy fall-through.
    pub fn enter_full_sync(&mut self) -> bool {
        if self.full_sync_mode {
            return false;
        }
        self.full_sync_mode = true;
        true
    }

    /// The script a miner should confirm with, if we have a state to confirm.
    pub fn confirmation_script(&self, coinbase_script: &[u8]) -> Option<Vec<u8>> {
        let current = self.current.as_ref()?;
        let mut script = coinbase_script.to_vec();
        confirm::embed_confirmation(&mut script, &current.state_hash());
        Some(script)
    }

    /// True when this node can usefully serve states: synced, holding a
    /// confirmed state with a sufficient block tail, and not mid-load.
    pub fn ready_to_serve(&self) -> bool {
        if !self.sync_complete || self.loading {
            return false;
        }
        let Some(prev) = &self.prev else {
            return false;
        };
        let Some(tip) = self.chainstate.chain.tip_height() else {
            return false;
        };
        tip >= prev.height() + SERVE_TAIL_LENGTH
    }

    /// Last confirmed state hash, if any. What `GetState` gets answered with.
    pub fn served_state(&self) -> Option<&StateHandle> {
        self.prev.as_deref().filter(|state| state.is_confirmed())
    }
}

pub fn shared(runtime: Runtime) -> SharedRuntime {
    Arc::new(Mutex::new(runtime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BlockHeader, Hash256, OutPoint, Transaction, TxIn};

    fn test_runtime(dir: &std::path::Path) -> Runtime {
        Runtime::open(
            dir,
            CompactionConfig::default(),
            Shutdown::new(),
            Metrics::new(),
        )
        .unwrap()
    }

    fn confirming_block(state_hash: Hash256) -> Block {
        let mut script = Vec::new();
        crate::confirm::embed_confirmation(&mut script, &state_hash);
        Block {
            header: BlockHeader {
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                time: 0,
            },
            txs: vec![Transaction {
                inputs: vec![TxIn {
                    prevout: OutPoint::new(Hash256::ZERO, u32::MAX),
                    script_sig: script,
                }],
                outputs: Vec::new(),
            }],
        }
    }

    #[test]
    fn unconfirmed_hash_does_not_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = test_runtime(dir.path());
        let mut quiesce = QuiesceCoordinator::new();

        let block = confirming_block(Hash256([1u8; 32]));
        let index = BlockIndex {
            height: 1,
            hash: block.hash(),
        };
        rt.handle_new_block(&block, &index, &mut quiesce).unwrap();

        assert!(rt.prev.is_none());
        assert!(!rt.shutdown.requested());
        assert!(!quiesce.wants_to_build());
    }

    #[test]
    fn foreign_confirmed_state_requests_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = test_runtime(dir.path());
        rt.confirmations = ConfirmationTracker::new(2);
        let mut quiesce = QuiesceCoordinator::new();

        let hash = Hash256([7u8; 32]);
        for height in 1..=2 {
            let block = confirming_block(hash);
            let index = BlockIndex {
                height,
                hash: block.hash(),
            };
            rt.handle_new_block(&block, &index, &mut quiesce).unwrap();
        }

        assert!(rt.shutdown.requested());
        assert!(rt.prev.is_none());
    }
}
