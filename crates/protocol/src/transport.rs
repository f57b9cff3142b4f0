//! The transport capability the engine is driven through.
//!
//! Implemented by the peer-messaging layer (and by in-memory doubles in
//! tests). All methods are non-blocking primitives: a send either succeeds,
//! is refused for now, or fails outright. Keeping the engine behind this
//! trait makes the registry and avatar logic testable with recording mocks.

use std::time::Duration;

use crate::control::ControlFrame;
use crate::types::{ContentHash, FileId, PeerId};

/// Errors reported by a transport primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("{0} is offline")]
    PeerOffline(PeerId),

    #[error("unknown {0}")]
    UnknownPeer(PeerId),

    #[error("unknown transfer {1} with {0}")]
    UnknownTransfer(PeerId, FileId),

    #[error("transport closed")]
    Closed,

    #[error("transport error: {0}")]
    Other(String),
}

/// Result of handing one chunk to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The chunk is queued; advance to the next one.
    Accepted,
    /// Send queue full. Wait `retry_in` and offer the same chunk again.
    Refused { retry_in: Duration },
}

/// Peer-messaging capability consumed by the transfer and avatar engines.
pub trait Transport: Send + Sync + 'static {
    /// Whether `peer` is currently reachable.
    fn is_peer_online(&self, peer: PeerId) -> bool;

    /// Stable identity string of `peer` (public key), used for cache file names.
    fn peer_stable_id(&self, peer: PeerId) -> Option<String>;

    /// Announces a new outbound file and returns the id the transport assigned.
    fn offer_file(&self, peer: PeerId, file_name: &str, size: u64) -> Result<FileId, TransportError>;

    /// Largest chunk the transport currently accepts for `peer`.
    fn current_chunk_size(&self, peer: PeerId) -> usize;

    /// Bytes the transport believes are still outstanding, if it tracks them.
    fn remaining_hint(&self, _peer: PeerId, _file: FileId) -> Option<u64> {
        None
    }

    fn send_chunk(&self, peer: PeerId, file: FileId, data: &[u8]) -> Result<SendOutcome, TransportError>;

    fn send_control(&self, peer: PeerId, file: FileId, frame: ControlFrame) -> Result<(), TransportError>;

    /// Advertises our avatar hash (`None`: avatar removed).
    fn send_avatar_hash(&self, peer: PeerId, hash: Option<ContentHash>) -> Result<(), TransportError>;

    fn request_avatar_hash(&self, peer: PeerId) -> Result<(), TransportError>;

    fn request_avatar_data(&self, peer: PeerId) -> Result<(), TransportError>;

    fn send_avatar_data(&self, peer: PeerId, data: &[u8]) -> Result<(), TransportError>;

    /// Content hash used for avatar deduplication.
    fn hash(&self, data: &[u8]) -> ContentHash {
        ContentHash::of(data)
    }
}
