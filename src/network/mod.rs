pub mod peer;
pub mod protocol;

pub use peer::{PeerConnection, PeerIndex, PeerManager, PeerStatus, MAX_PEERS};
pub use protocol::{Message, PROTOCOL_VERSION};
