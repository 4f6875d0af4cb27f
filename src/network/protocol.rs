use crate::core::types::{Block, Hash256};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// Version handshake. `best_height` is the sender's best header height.
    Version {
        version: u32,
        best_height: u32,
        timestamp: u64,
    },

    /// Version acknowledgment
    Verack,

    /// Ping (heartbeat)
    Ping { nonce: u64 },

    /// Pong (heartbeat response)
    Pong { nonce: u64 },

    /// Ask a peer for its last confirmed state
    GetState,

    /// Offer of a state: its aggregate hash, height, raw metafile bytes,
    /// and the ordered chunk hash list
    StateOffer {
        state_hash: Hash256,
        height: u32,
        meta: Vec<u8>,
        chunk_hashes: Vec<Hash256>,
    },

    /// Request chunks of the offered state by content hash
    GetStateData { chunk_hashes: Vec<Hash256> },

    /// One chunk, as raw chunk-file bytes
    StateChunk { bytes: Vec<u8> },

    /// Announce a new validated block
    Block(Block),
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("Serialization failed")
    }

    pub fn deserialize(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

pub const PROTOCOL_VERSION: u32 = 1;
