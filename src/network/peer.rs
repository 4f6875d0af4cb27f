use super::protocol::{Message, PROTOCOL_VERSION};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub type PeerIndex = u64;

pub const MAX_PEERS: usize = 40;

const MAX_FRAME_SIZE: usize = 10_000_000;

/// Where a peer stands in the state-request handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    NotConnected,
    NotRequested,
    Requested,
    Timeout,
}

pub struct PeerConnection {
    index: Option<PeerIndex>,
    addr: SocketAddr,
    writer: Option<WriteHalf<TcpStream>>,
    msg_rx: Option<mpsc::UnboundedReceiver<Result<Message>>>,
    last_ping: SystemTime,
    last_pong: SystemTime,
    last_send: Instant,
    last_recv: Instant,
    handshake_complete: bool,
    inbound: bool,
    /// Remote best header height announced in its version message.
    pub best_height: u32,
    /// Chunk requests outstanding on this peer.
    pub in_flight_chunks: usize,
    pub status: PeerStatus,
    // Cooperative pause flags for state creation. Receiving is paused by the
    // read loop itself, which checks the shared flag between frames.
    halt_send: bool,
    halt_recv: Arc<AtomicBool>,
    halt_recv_effective: bool,
}

impl PeerConnection {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        tracing::info!("Connected to peer: {}", addr);
        Ok(Self::wire(stream, addr, false))
    }

    pub fn from_stream(stream: TcpStream, addr: SocketAddr) -> Self {
        Self::wire(stream, addr, true)
    }

    fn wire(stream: TcpStream, addr: SocketAddr, inbound: bool) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let halt_recv = Arc::new(AtomicBool::new(false));
        tokio::spawn(Self::read_loop(reader, msg_tx, Arc::clone(&halt_recv)));

        Self {
            index: None,
            addr,
            writer: Some(writer),
            msg_rx: Some(msg_rx),
            last_ping: SystemTime::now(),
            last_pong: SystemTime::now(),
            last_send: Instant::now(),
            last_recv: Instant::now(),
            handshake_complete: false,
            inbound,
            best_height: 0,
            in_flight_chunks: 0,
            status: PeerStatus::NotConnected,
            halt_send: false,
            halt_recv,
            halt_recv_effective: false,
        }
    }

    async fn read_loop(
        mut reader: ReadHalf<TcpStream>,
        tx: mpsc::UnboundedSender<Result<Message>>,
        halt_recv: Arc<AtomicBool>,
    ) {
        loop {
            // Pause between frames while communication is halted; a peer is
            // never cut off mid-message.
            while halt_recv.load(Ordering::Relaxed) {
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            let mut len_bytes = [0u8; 4];
            if let Err(e) = reader.read_exact(&mut len_bytes).await {
                let _ = tx.send(Err(e.into()));
                break;
            }
            let len = u32::from_le_bytes(len_bytes) as usize;

            if len > MAX_FRAME_SIZE {
                let _ = tx.send(Err(anyhow::anyhow!("Message too large: {} bytes", len)));
                break;
            }

            let mut msg_bytes = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut msg_bytes).await {
                let _ = tx.send(Err(e.into()));
                break;
            }

            match Message::deserialize(&msg_bytes) {
                Ok(msg) => {
                    if tx.send(Ok(msg)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    }

    pub async fn complete_handshake(&mut self, our_best_height: u32) -> Result<()> {
        if self.handshake_complete {
            return Ok(());
        }

        let version = Message::Version {
            version: PROTOCOL_VERSION,
            best_height: our_best_height,
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)?
                .as_secs(),
        };
        self.send_message(&version).await?;

        let msg = self.receive_message().await?;
        match msg {
            Message::Version {
                version,
                best_height,
                ..
            } => {
                if version != PROTOCOL_VERSION {
                    bail!("Protocol version mismatch");
                }
                self.best_height = best_height;
                self.send_message(&Message::Verack).await?;

                let msg2 = self.receive_message().await?;
                match msg2 {
                    Message::Verack => {
                        self.handshake_complete = true;
                        self.status = PeerStatus::NotRequested;
                        tracing::info!("Handshake complete with {}", self.addr);
                        Ok(())
                    }
                    _ => bail!("Expected Verack, got {:?}", msg2),
                }
            }
            _ => bail!("Expected Version, got {:?}", msg),
        }
    }

    /// Answer an incoming handshake on an inbound connection.
    pub async fn accept_handshake(&mut self, our_best_height: u32) -> Result<()> {
        let msg = self.receive_message().await?;
        match msg {
            Message::Version {
                version,
                best_height,
                ..
            } => {
                if version != PROTOCOL_VERSION {
                    bail!("Protocol version mismatch");
                }
                self.best_height = best_height;
            }
            _ => bail!("Expected Version, got {:?}", msg),
        }

        let version = Message::Version {
            version: PROTOCOL_VERSION,
            best_height: our_best_height,
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)?
                .as_secs(),
        };
        self.send_message(&version).await?;
        self.send_message(&Message::Verack).await?;

        match self.receive_message().await? {
            Message::Verack => {
                self.handshake_complete = true;
                self.status = PeerStatus::NotRequested;
                tracing::info!("Handshake complete with {}", self.addr);
                Ok(())
            }
            other => bail!("Expected Verack, got {:?}", other),
        }
    }

    pub async fn send_message(&mut self, msg: &Message) -> Result<()> {
        if self.halt_send {
            tracing::debug!("Send to {} suppressed, communication halted", self.addr);
            return Ok(());
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Not connected"))?;
        let bytes = msg.serialize();
        let len = bytes.len() as u32;
        writer.write_all(&len.to_le_bytes()).await?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        self.last_send = Instant::now();
        Ok(())
    }

    /// Receive a message directly (used during handshakes). Once registered
    /// with the manager, messages arrive via the shared channel instead.
    pub async fn receive_message(&mut self) -> Result<Message> {
        let rx = self
            .msg_rx
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("msg_rx taken"))?;
        match rx.recv().await {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => Err(e),
            None => Err(anyhow::anyhow!("Connection closed")),
        }
    }

    pub fn take_msg_rx(&mut self) -> Option<mpsc::UnboundedReceiver<Result<Message>>> {
        self.msg_rx.take()
    }

    pub async fn send_ping(&mut self) -> Result<()> {
        let nonce: u64 = rand::random();
        self.send_message(&Message::Ping { nonce }).await?;
        self.last_ping = SystemTime::now();
        Ok(())
    }

    pub fn handle_pong(&mut self) {
        self.last_pong = SystemTime::now();
    }

    pub fn is_alive(&self) -> bool {
        SystemTime::now()
            .duration_since(self.last_pong)
            .map(|d| d < Duration::from_secs(60))
            .unwrap_or(false)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some() && self.handshake_complete
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn disconnect(&mut self) {
        self.writer = None;
        self.handshake_complete = false;
        self.status = PeerStatus::NotConnected;
    }

    pub fn halt(&mut self) {
        self.halt_send = true;
        self.halt_recv.store(true, Ordering::Relaxed);
    }

    /// Effective only after the halt was requested; mirrors the two-step
    /// pause where in-flight responses drain first.
    pub fn mark_recv_effective(&mut self) {
        if self.halt_recv.load(Ordering::Relaxed) {
            self.halt_recv_effective = true;
        }
    }

    pub fn is_quiesced(&self) -> bool {
        self.halt_send && self.halt_recv.load(Ordering::Relaxed) && self.halt_recv_effective
    }

    pub fn resume(&mut self) {
        self.halt_send = false;
        self.halt_recv.store(false, Ordering::Relaxed);
        self.halt_recv_effective = false;
        // The pause must not look like idleness to the timeout watchdog.
        self.last_send = Instant::now();
        self.last_recv = Instant::now();
    }

    pub fn record_recv(&mut self) {
        self.last_recv = Instant::now();
    }
}

/// Forward messages from a peer's local channel to the shared channel.
async fn forward_messages(
    idx: PeerIndex,
    mut local_rx: mpsc::UnboundedReceiver<Result<Message>>,
    shared_tx: mpsc::UnboundedSender<(PeerIndex, Result<Message>)>,
) {
    loop {
        match local_rx.recv().await {
            Some(Ok(msg)) => {
                if shared_tx.send((idx, Ok(msg))).is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                let _ = shared_tx.send((idx, Err(e)));
                return;
            }
            None => break,
        }
    }
    let _ = shared_tx.send((idx, Err(anyhow::anyhow!("peer reader closed"))));
}

pub struct PeerManager {
    peers: HashMap<PeerIndex, PeerConnection>,
    next_index: PeerIndex,
    peer_msg_tx: mpsc::UnboundedSender<(PeerIndex, Result<Message>)>,
}

impl PeerManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(PeerIndex, Result<Message>)>) {
        let (peer_msg_tx, peer_msg_rx) = mpsc::unbounded_channel();
        let mgr = Self {
            peers: HashMap::new(),
            next_index: 0,
            peer_msg_tx,
        };
        (mgr, peer_msg_rx)
    }

    pub async fn connect_to_peer(
        &mut self,
        addr: SocketAddr,
        our_best_height: u32,
    ) -> Result<PeerIndex> {
        if self.peers.len() >= MAX_PEERS {
            bail!("peer limit reached ({}/{})", self.peers.len(), MAX_PEERS);
        }
        let mut peer = PeerConnection::connect(addr).await?;
        peer.complete_handshake(our_best_height).await?;
        let idx = self.register_peer(peer);
        tracing::info!("Connected to outbound peer {}: {} (total: {})", idx, addr, self.peers.len());
        Ok(idx)
    }

    pub async fn add_inbound_peer(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        our_best_height: u32,
    ) -> Result<PeerIndex> {
        if self.peers.len() >= MAX_PEERS {
            bail!("peer limit reached ({}/{})", self.peers.len(), MAX_PEERS);
        }
        let mut peer = PeerConnection::from_stream(stream, addr);
        peer.accept_handshake(our_best_height).await?;
        let idx = self.register_peer(peer);
        tracing::info!("Added inbound peer {}: {} (total: {})", idx, addr, self.peers.len());
        Ok(idx)
    }

    fn register_peer(&mut self, mut peer: PeerConnection) -> PeerIndex {
        let idx = self.next_index;
        self.next_index += 1;
        peer.index = Some(idx);

        if let Some(local_rx) = peer.take_msg_rx() {
            let shared_tx = self.peer_msg_tx.clone();
            tokio::spawn(forward_messages(idx, local_rx, shared_tx));
        }

        self.peers.insert(idx, peer);
        idx
    }

    pub async fn send_to(&mut self, idx: PeerIndex, msg: &Message) {
        if let Some(peer) = self.peers.get_mut(&idx) {
            if let Err(e) = peer.send_message(msg).await {
                tracing::warn!("Failed to send to peer {} ({}): {}", idx, peer.addr(), e);
                peer.disconnect();
            }
        }
    }

    pub async fn broadcast(&mut self, msg: &Message) {
        let mut dead = Vec::new();
        for (&idx, peer) in self.peers.iter_mut() {
            if !peer.is_connected() {
                continue;
            }
            if let Err(e) = peer.send_message(msg).await {
                tracing::warn!("Broadcast to peer {} failed: {}", idx, e);
                peer.disconnect();
                dead.push(idx);
            }
        }
        for idx in dead {
            self.remove_peer(idx);
        }
    }

    pub async fn send_pings(&mut self) {
        let mut dead = Vec::new();
        for (&idx, peer) in self.peers.iter_mut() {
            if peer.is_connected() && peer.send_ping().await.is_err() {
                dead.push(idx);
            }
        }
        for idx in dead {
            self.remove_peer(idx);
        }
    }

    pub fn remove_dead_peers(&mut self) {
        let dead: Vec<PeerIndex> = self
            .peers
            .iter()
            .filter(|(_, p)| !p.is_alive())
            .map(|(&idx, _)| idx)
            .collect();
        for idx in dead {
            tracing::info!("Removing dead peer {}", idx);
            self.remove_peer(idx);
        }
    }

    pub fn remove_peer(&mut self, idx: PeerIndex) {
        if let Some(mut peer) = self.peers.remove(&idx) {
            tracing::info!("Removed peer {} ({})", idx, peer.addr());
            peer.disconnect();
        }
    }

    pub fn get(&self, idx: PeerIndex) -> Option<&PeerConnection> {
        self.peers.get(&idx)
    }

    pub fn get_mut(&mut self, idx: PeerIndex) -> Option<&mut PeerConnection> {
        self.peers.get_mut(&idx)
    }

    pub fn connected_indices(&self) -> Vec<PeerIndex> {
        let mut indices: Vec<PeerIndex> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_connected())
            .map(|(&idx, _)| idx)
            .collect();
        indices.sort_unstable();
        indices
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected()).count()
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.peers.values().map(|p| p.addr()).collect()
    }

    /// Best header height any peer has announced.
    pub fn best_peer_height(&self) -> u32 {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.best_height)
            .max()
            .unwrap_or(0)
    }

    // ── quiescence support ──────────────────────────────────────────────

    /// Ask every peer to stop sending and receiving.
    pub fn halt_all(&mut self) {
        for peer in self.peers.values_mut() {
            peer.halt();
        }
    }

    /// Once no more block responses are expected, make the receive halt
    /// effective on every already-halted peer.
    pub fn mark_recv_effective(&mut self) {
        for peer in self.peers.values_mut() {
            peer.mark_recv_effective();
        }
    }

    /// True when every connected peer is fully paused.
    pub fn all_quiesced(&self) -> bool {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .all(|p| p.is_quiesced())
    }

    pub fn resume_all(&mut self) {
        for peer in self.peers.values_mut() {
            peer.resume();
        }
    }
}
