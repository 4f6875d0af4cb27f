use crate::acquire::{self, Acquisition, ChunkOutcome};
use crate::lifecycle::{self, CompactionConfig, Runtime, SharedRuntime};
use crate::metrics::Metrics;
use crate::network::{Message, PeerIndex, PeerManager, PeerStatus};
use crate::quiesce::{QuiesceCoordinator, TargetSlot};
use crate::shutdown::Shutdown;
use crate::snapshot::{loader, StateHandle};
use anyhow::{bail, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

pub struct NodeOptions {
    pub data_dir: PathBuf,
    pub listen_addr: SocketAddr,
    pub bootstrap_peers: Vec<SocketAddr>,
    pub compaction: CompactionConfig,
}

pub enum NodeCommand {
    CreateState {
        max_height: u32,
        reply: oneshot::Sender<String>,
    },
}

pub struct Node {
    runtime: SharedRuntime,
    peers: PeerManager,
    peer_rx: mpsc::UnboundedReceiver<(PeerIndex, Result<Message>)>,
    quiesce: QuiesceCoordinator,
    /// Present while this node is still acquiring a state from peers.
    acquisition: Option<Acquisition>,
    metrics: Metrics,
    shutdown: Shutdown,
    listen_addr: SocketAddr,
    bootstrap_peers: Vec<SocketAddr>,
}

/// Cloneable access point for the RPC layer: shares the runtime lock and a
/// command channel into the main loop.
#[derive(Clone)]
pub struct NodeHandle {
    pub runtime: SharedRuntime,
    cmd_tx: mpsc::UnboundedSender<NodeCommand>,
    pub shutdown: Shutdown,
}

impl NodeHandle {
    /// Ask the main loop to schedule a state build. Returns the status
    /// string the RPC reports back.
    pub async fn create_state(&self, max_height: u32) -> Result<String> {
        {
            let rt = self.runtime.lock().await;
            if rt.loading {
                return Ok("State is currently being loaded. Aborting.".to_string());
            }
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(NodeCommand::CreateState {
            max_height,
            reply: reply_tx,
        })?;
        Ok(reply_rx.await?)
    }

    /// Load a state file from the state directory and apply it.
    pub async fn load_state(&self, file_name: &str) -> Result<String> {
        let (state_dir, shutdown) = {
            let rt = self.runtime.lock().await;
            if rt.loading {
                return Ok("Another state is currently being loaded. Aborting.".to_string());
            }
            (rt.state_dir.clone(), rt.shutdown.clone())
        };

        // Hashing the files can take a while; do it outside the lock.
        let state = StateHandle::load(&state_dir, file_name, &shutdown)?;
        loader::apply(&self.runtime, &state).await?;

        Ok(format!(
            "Successfully read state from file '{}'\nHash: {}",
            state.file().display(),
            state.state_hash()
        ))
    }

    pub async fn ready_to_serve(&self) -> bool {
        self.runtime.lock().await.ready_to_serve()
    }
}

impl Node {
    pub fn new(opts: NodeOptions) -> Result<Self> {
        let shutdown = Shutdown::new();
        let metrics = Metrics::new();

        let mut runtime = Runtime::open(
            &opts.data_dir,
            opts.compaction.clone(),
            shutdown.clone(),
            metrics.clone(),
        )?;
        runtime.initialize()?;

        // A node that is still joining acquires a state from the network
        // unless one was supplied locally.
        let acquisition = (runtime.config.compaction
            && !runtime.sync_complete
            && runtime.downloaded.is_none()
            && !runtime.shutdown.requested())
        .then(|| Acquisition::new(runtime.state_dir.clone()));

        let (peers, peer_rx) = PeerManager::new();

        Ok(Self {
            runtime: lifecycle::shared(runtime),
            peers,
            peer_rx,
            quiesce: QuiesceCoordinator::new(),
            acquisition,
            metrics,
            shutdown,
            listen_addr: opts.listen_addr,
            bootstrap_peers: opts.bootstrap_peers,
        })
    }

    pub fn create_handle(&self) -> (NodeHandle, mpsc::UnboundedReceiver<NodeCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            NodeHandle {
                runtime: self.runtime.clone(),
                cmd_tx,
                shutdown: self.shutdown.clone(),
            },
            cmd_rx,
        )
    }

    async fn our_best_height(&self) -> u32 {
        let rt = self.runtime.lock().await;
        rt.chainstate.chain.best_header_height().unwrap_or(0)
    }

    pub async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<NodeCommand>) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        tracing::info!("Listening on {}", self.listen_addr);

        let best_height = self.our_best_height().await;
        for addr in self.bootstrap_peers.clone() {
            match self.peers.connect_to_peer(addr, best_height).await {
                Ok(idx) => self.on_peer_ready(idx).await,
                Err(e) => tracing::warn!("Failed to connect to {}: {}", addr, e),
            }
        }

        let mut quiesce_interval = time::interval(Duration::from_millis(500));
        let mut acquire_interval = time::interval(Duration::from_secs(2));
        let mut ping_interval = time::interval(Duration::from_secs(30));
        let mut metrics_interval = time::interval(Duration::from_secs(30));
        let mut sweep_interval = time::interval(Duration::from_secs(60));

        loop {
            if self.shutdown.requested() {
                tracing::info!("Shutdown requested, leaving main loop");
                break;
            }

            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let best = self.our_best_height().await;
                            match self.peers.add_inbound_peer(stream, addr, best).await {
                                Ok(idx) => self.on_peer_ready(idx).await,
                                Err(e) => tracing::warn!("Inbound peer {} rejected: {}", addr, e),
                            }
                        }
                        Err(e) => tracing::warn!("Accept failed: {}", e),
                    }
                }
                Some((idx, result)) = self.peer_rx.recv() => {
                    match result {
                        Ok(msg) => {
                            if let Some(peer) = self.peers.get_mut(idx) {
                                peer.record_recv();
                            }
                            if let Err(e) = self.handle_message(idx, msg).await {
                                tracing::warn!("Error handling message from peer {}: {}", idx, e);
                            }
                        }
                        Err(e) => {
                            tracing::info!("Peer {} read error: {}", idx, e);
                            if let Some(acq) = self.acquisition.as_mut() {
                                acq.fail_peer(idx);
                            }
                            self.peers.remove_peer(idx);
                        }
                    }
                }
                Some(cmd) = cmd_rx.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = quiesce_interval.tick() => {
                    self.drive_quiescence().await;
                }
                _ = acquire_interval.tick() => {
                    if let Err(e) = self.drive_acquisition().await {
                        tracing::error!("Acquisition error: {}", e);
                    }
                }
                _ = ping_interval.tick() => {
                    self.peers.send_pings().await;
                }
                _ = metrics_interval.tick() => {
                    self.metrics.report();
                }
                _ = sweep_interval.tick() => {
                    // Paused peers look idle on purpose; leave them alone.
                    if !self.quiesce.wants_to_build() {
                        self.peers.remove_dead_peers();
                    }
                }
            }
        }
        Ok(())
    }

    /// Kick off the state request once a peer has completed its handshake.
    async fn on_peer_ready(&mut self, idx: PeerIndex) {
        {
            let mut rt = self.runtime.lock().await;
            rt.header_best_known = rt.header_best_known.max(self.peers.best_peer_height());
        }
        if self.acquisition.is_some() {
            self.request_state_from(idx).await;
        }
    }

    async fn request_state_from(&mut self, idx: PeerIndex) {
        let Some(peer) = self.peers.get_mut(idx) else {
            return;
        };
        if peer.status != PeerStatus::NotRequested {
            tracing::debug!("Not requesting state from peer {} in {:?}", idx, peer.status);
            return;
        }
        peer.status = PeerStatus::Requested;
        tracing::info!("Requesting state from peer {}", idx);
        self.peers.send_to(idx, &Message::GetState).await;
    }

    async fn handle_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::CreateState { max_height, reply } => {
                let loading = self.runtime.lock().await.loading;
                let response = if loading {
                    "State is currently being loaded. Aborting.".to_string()
                } else {
                    self.quiesce
                        .set_want_to_build(max_height, TargetSlot::Discard, false);
                    format!("Triggered state writing of height '{}'", max_height)
                };
                let _ = reply.send(response);
            }
        }
    }

    /// One tick of the pause state machine; runs the build when all peers
    /// are quiet.
    async fn drive_quiescence(&mut self) {
        if !self.quiesce.wants_to_build() {
            return;
        }
        // This node requests no blocks while a build is latched, so the
        // in-flight drain completes as soon as peers stop delivering.
        self.quiesce.set_no_more_blocks_in_flight(true);

        if self.quiesce.poll(&mut self.peers) {
            let mut rt = self.runtime.lock().await;
            if let Err(e) = self.quiesce.run_build(&mut rt, &mut self.peers) {
                tracing::error!("State creation failed: {}", e);
            }
        }
    }

    /// Schedule chunk downloads, finish the download when complete, and
    /// hand off to full sync once the header chain suffices.
    async fn drive_acquisition(&mut self) -> Result<()> {
        {
            let mut rt = self.runtime.lock().await;
            rt.header_best_known = rt.header_best_known.max(self.peers.best_peer_height());
        }

        if let Some(acq) = self.acquisition.as_mut() {
            for (idx, chunk_hashes) in acq.schedule(&mut self.peers) {
                self.peers
                    .send_to(idx, &Message::GetStateData { chunk_hashes })
                    .await;
            }

            let downloaded_pending = self.runtime.lock().await.downloaded.is_some();
            if acq.is_complete() && !downloaded_pending {
                let state = acq.assemble(&self.shutdown)?;
                tracing::info!(
                    "Download of state {} complete, waiting for header chain",
                    state.state_hash()
                );
                self.runtime.lock().await.downloaded = Some(Box::new(state));
            }
        }

        // Applies either a completed download or a state file supplied at
        // startup, as soon as the header chain has caught up.
        if acquire::try_switch_to_full_sync(&self.runtime).await? {
            tracing::info!("Switched to full synchronization for tail blocks");
            self.acquisition = None;
        }
        Ok(())
    }

    async fn handle_message(&mut self, idx: PeerIndex, msg: Message) -> Result<()> {
        match msg {
            Message::Ping { nonce } => {
                self.peers.send_to(idx, &Message::Pong { nonce }).await;
            }
            Message::Pong { .. } => {
                if let Some(peer) = self.peers.get_mut(idx) {
                    peer.handle_pong();
                }
            }
            Message::Version { best_height, .. } => {
                // Late version announce: refresh the peer's tip knowledge.
                if let Some(peer) = self.peers.get_mut(idx) {
                    peer.best_height = best_height;
                }
            }
            Message::Verack => {}
            Message::GetState => self.serve_state_offer(idx).await?,
            Message::StateOffer {
                state_hash,
                height,
                meta,
                chunk_hashes,
            } => {
                let Some(acq) = self.acquisition.as_mut() else {
                    tracing::debug!("Ignoring unsolicited state offer from peer {}", idx);
                    return Ok(());
                };
                if let Err(e) = acq.handle_offer(idx, state_hash, height, meta, chunk_hashes) {
                    tracing::warn!("Bad offer from peer {}: {}", idx, e);
                    if let Some(peer) = self.peers.get_mut(idx) {
                        peer.status = PeerStatus::Timeout;
                    }
                }
            }
            Message::GetStateData { chunk_hashes } => {
                self.serve_chunks(idx, chunk_hashes).await?;
            }
            Message::StateChunk { bytes } => self.accept_chunk(idx, bytes)?,
            Message::Block(block) => self.accept_block(block).await?,
        }
        Ok(())
    }

    /// Answer `GetState` with our last confirmed state, if we serve.
    async fn serve_state_offer(&mut self, idx: PeerIndex) -> Result<()> {
        let offer = {
            let rt = self.runtime.lock().await;
            if !rt.config.provide_state {
                tracing::debug!("Peer {} asked for a state but we do not provide", idx);
                None
            } else {
                match rt.served_state() {
                    Some(state) => Some(Message::StateOffer {
                        state_hash: state.state_hash(),
                        height: state.height(),
                        // The raw file bytes, so the requester hashes exactly
                        // what we hashed.
                        meta: std::fs::read(state.file())?,
                        chunk_hashes: state.chunk_hashes(),
                    }),
                    None => None,
                }
            }
        };
        if let Some(offer) = offer {
            self.peers.send_to(idx, &offer).await;
        }
        Ok(())
    }

    /// Stream requested chunks of the served state back to a peer.
    async fn serve_chunks(&mut self, idx: PeerIndex, chunk_hashes: Vec<crate::Hash256>) -> Result<()> {
        let mut payloads = Vec::new();
        {
            let rt = self.runtime.lock().await;
            if !rt.config.provide_state {
                return Ok(());
            }
            let Some(state) = rt.served_state() else {
                return Ok(());
            };
            for hash in &chunk_hashes {
                match state.chunk_by_hash(hash) {
                    Some(chunk) => payloads.push(std::fs::read(&chunk.file)?),
                    None => tracing::debug!("Peer {} requested unknown chunk {}", idx, hash),
                }
            }
        }
        for bytes in payloads {
            self.peers.send_to(idx, &Message::StateChunk { bytes }).await;
            self.metrics.inc_chunks_served();
        }
        Ok(())
    }

    fn accept_chunk(&mut self, idx: PeerIndex, bytes: Vec<u8>) -> Result<()> {
        let Some(acq) = self.acquisition.as_mut() else {
            tracing::debug!("Ignoring unsolicited chunk from peer {}", idx);
            return Ok(());
        };

        match acq.handle_chunk(idx, &bytes) {
            Ok(ChunkOutcome::Accepted) => {
                self.metrics.inc_chunks_received();
                if let Some(peer) = self.peers.get_mut(idx) {
                    peer.in_flight_chunks = peer.in_flight_chunks.saturating_sub(1);
                }
            }
            Ok(ChunkOutcome::Duplicate) => {
                if let Some(peer) = self.peers.get_mut(idx) {
                    peer.in_flight_chunks = peer.in_flight_chunks.saturating_sub(1);
                }
            }
            Ok(ChunkOutcome::Mismatch) => self.punish_chunk_peer(idx),
            Err(e) => {
                tracing::warn!("Chunk from peer {} unusable: {}", idx, e);
                self.punish_chunk_peer(idx);
            }
        }
        Ok(())
    }

    /// A peer delivered bytes that do not match any wanted chunk: time it
    /// out and requeue whatever it was carrying.
    fn punish_chunk_peer(&mut self, idx: PeerIndex) {
        self.metrics.inc_chunks_rejected();
        if let Some(acq) = self.acquisition.as_mut() {
            acq.fail_peer(idx);
        }
        if let Some(peer) = self.peers.get_mut(idx) {
            peer.status = PeerStatus::Timeout;
            peer.in_flight_chunks = 0;
        }
    }

    /// A new validated block: connect it and let the lifecycle check it for
    /// confirmations.
    async fn accept_block(&mut self, block: crate::Block) -> Result<()> {
        use crate::chainstate::ChainStateStore;

        let mut rt = self.runtime.lock().await;
        if !rt.full_sync_mode {
            tracing::debug!("Ignoring block announce while still acquiring a state");
            return Ok(());
        }
        if rt.loading {
            bail!("block arrived while a state is loading");
        }

        let index = rt.chainstate.connect_block(&block)?;
        rt.chainstate.coins.flush()?;
        rt.header_best_known = rt.header_best_known.max(index.height);

        rt.handle_new_block(&block, &index, &mut self.quiesce)?;
        Ok(())
    }
}
