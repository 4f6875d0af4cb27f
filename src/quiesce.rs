//! Cooperative pause around state creation.
//!
//! Serializing the UTXO set needs a stable view: every peer must stop
//! talking to us and all in-flight block responses must have drained. The
//! coordinator latches a build request, pauses peers one main-loop tick at
//! a time, and runs the builder only once the node is fully quiet.

use crate::lifecycle::Runtime;
use crate::network::PeerManager;
use crate::snapshot;
use anyhow::Result;

/// Which lifecycle slot receives the finished state. Slots are resolved
/// under the runtime lock when the build completes, never held as pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetSlot {
    Current,
    Downloaded,
    /// Build purely as a creation trigger (operator tooling); the handle is
    /// dropped once the files are on disk.
    Discard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Wanted,
    Pausing,
    Ready,
    Building,
}

pub struct QuiesceCoordinator {
    phase: Phase,
    height: u32,
    target: TargetSlot,
    attach_prev: bool,
    /// Pessimistically true until the block downloader acks otherwise.
    blocks_in_flight: bool,
}

impl QuiesceCoordinator {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            height: 0,
            target: TargetSlot::Discard,
            attach_prev: false,
            blocks_in_flight: true,
        }
    }

    /// Latch a build request. The build itself runs at a later main-loop
    /// tick, once every peer is paused.
    pub fn set_want_to_build(&mut self, height: u32, target: TargetSlot, attach_prev: bool) {
        if self.phase != Phase::Idle {
            tracing::warn!(
                "Replacing pending build (phase {:?}) with new request for height {}",
                self.phase,
                height
            );
        }
        self.phase = Phase::Wanted;
        self.height = height;
        self.target = target;
        self.attach_prev = attach_prev;
        self.blocks_in_flight = true;
        tracing::info!("Scheduled state creation for height {}", height);
    }

    pub fn wants_to_build(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Ack from the block downloader that nothing more is in flight.
    pub fn set_no_more_blocks_in_flight(&mut self, done: bool) {
        self.blocks_in_flight = !done;
    }

    /// Drive the pause one tick forward. Returns true when the node is
    /// quiescent and the build may run now.
    pub fn poll(&mut self, peers: &mut PeerManager) -> bool {
        match self.phase {
            Phase::Idle | Phase::Building => false,
            Phase::Wanted => {
                peers.halt_all();
                self.phase = Phase::Pausing;
                false
            }
            Phase::Pausing => {
                if !self.blocks_in_flight {
                    peers.mark_recv_effective();
                }
                if peers.all_quiesced() {
                    tracing::info!("All peers paused, ready to create state");
                    self.phase = Phase::Ready;
                    true
                } else {
                    false
                }
            }
            Phase::Ready => true,
        }
    }

    /// Run the latched build. Must be called with the runtime locked and
    /// only after `poll` returned true. Peers are resumed on every exit
    /// path, with their activity clocks bumped so the idle watchdog does
    /// not cut them off for the pause.
    pub fn run_build(&mut self, rt: &mut Runtime, peers: &mut PeerManager) -> Result<()> {
        debug_assert_eq!(self.phase, Phase::Ready);
        self.phase = Phase::Building;

        let result = self.build_into_slot(rt);

        self.phase = Phase::Idle;
        self.height = 0;
        self.target = TargetSlot::Discard;
        self.attach_prev = false;
        self.blocks_in_flight = true;
        peers.resume_all();
        result
    }

    fn build_into_slot(&self, rt: &mut Runtime) -> Result<()> {
        use crate::chainstate::ChainStateStore;

        rt.chainstate.coins.flush()?;
        let state = snapshot::build(&rt.chainstate, self.height, &rt.state_dir, &rt.shutdown)?;
        rt.metrics.inc_states_built();
        rt.metrics.add_chunks_written(state.chunks().len() as u64);

        match self.target {
            TargetSlot::Discard => {
                tracing::info!(
                    "State {} written for external use, not retained",
                    state.state_hash()
                );
            }
            TargetSlot::Current => {
                let mut state = Box::new(state);
                if self.attach_prev {
                    if let Some(prev) = &rt.prev {
                        state.set_previous(prev.clone());
                    }
                }
                rt.current = Some(state);
            }
            TargetSlot::Downloaded => {
                rt.downloaded = Some(Box::new(state));
            }
        }
        Ok(())
    }
}

impl Default for QuiesceCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
