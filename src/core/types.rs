use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum serialized size of a single chunk file, header included.
pub const MAX_CHUNK_SIZE: usize = 1_000_000;

/// Coinbase confirmations required before a state is trusted.
pub const REQUIRED_CONFIRMATIONS: u32 = 10;

/// Distinct peers that must offer the same state before we commit to it.
pub const REQUIRED_STATE_OFFERS: usize = 8;

/// In-flight chunk cap per peer, matching the block-download cap.
pub const MAX_DOWNLOADS_PER_PEER: usize = 16;

/// Height assumed for the first state when no confirmation is found on chain.
pub const INITIAL_STATE_HEIGHT: u32 = 10_000;

/// Tail of blocks past the served state a provider must hold before it
/// reports itself ready to serve.
pub const SERVE_TAIL_LENGTH: u32 = 100;

/// Tag prepended to the coinbase script when confirming a state.
pub const CONFIRMATION_TAG: &[u8] = b"CoinPrune";
pub const CONFIRMATION_SEPARATOR: u8 = b'/';

/// Consensus cap on the coinbase input script size.
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// 256-bit content hash. Printed as hex everywhere.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            anyhow::bail!("hash must be 32 bytes, got {}", bytes.len());
        }
        Ok(Self(<[u8; 32]>::try_from(bytes.as_slice()).unwrap()))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Reference to a transaction output. Ordering is lexicographic on
/// (txid, vout), which fixes the iteration order of every snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }
}

/// An unspent output as stored in the chainstate database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub amount: u64,
    pub script: Vec<u8>,
    pub is_coinbase: bool,
    pub height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub amount: u64,
    pub script: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        let bytes = bincode::serialize(self).expect("txid serialization");
        crate::core::hashing::hash_bytes(&bytes)
    }

    /// A coinbase spends the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.txid.is_zero()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        let bytes = bincode::serialize(&self.header).expect("header serialization");
        crate::core::hashing::hash_bytes(&bytes)
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.txs.first().filter(|tx| tx.is_coinbase())
    }
}

/// Position of a block in the active chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndex {
    pub height: u32,
    pub hash: Hash256,
}
