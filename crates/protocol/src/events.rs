//! Inbound event stream delivered by the transport.
//!
//! The transport raises one [`InboundEvent`] per received frame or state
//! change and pushes them, in order, into the session's event channel. The
//! session consumes them one at a time, so ordering within a peer is exactly
//! the transport's delivery order.

use crate::control::ControlFrame;
use crate::types::{ContentHash, FileId, PeerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A peer offers to send us a file.
    FileOffer {
        peer: PeerId,
        file: FileId,
        file_name: String,
        size: u64,
    },
    /// A control frame for one transfer.
    Control {
        peer: PeerId,
        file: FileId,
        frame: ControlFrame,
    },
    /// A chunk of file data for an inbound transfer.
    Data {
        peer: PeerId,
        file: FileId,
        data: Vec<u8>,
    },
    /// A peer announced its current avatar hash (`None`: no avatar).
    AvatarHash {
        peer: PeerId,
        hash: Option<ContentHash>,
    },
    /// Avatar bytes from a peer, with the hash the peer claims for them.
    AvatarData {
        peer: PeerId,
        data: Vec<u8>,
        hash: ContentHash,
    },
    /// A peer asks for our avatar hash.
    AvatarHashRequested { peer: PeerId },
    /// A peer asks for our avatar bytes.
    AvatarDataRequested { peer: PeerId },
    /// A peer went online or offline.
    PeerStatus { peer: PeerId, online: bool },
}

impl InboundEvent {
    /// The peer this event originates from.
    pub fn peer(&self) -> PeerId {
        match self {
            InboundEvent::FileOffer { peer, .. }
            | InboundEvent::Control { peer, .. }
            | InboundEvent::Data { peer, .. }
            | InboundEvent::AvatarHash { peer, .. }
            | InboundEvent::AvatarData { peer, .. }
            | InboundEvent::AvatarHashRequested { peer }
            | InboundEvent::AvatarDataRequested { peer }
            | InboundEvent::PeerStatus { peer, .. } => *peer,
        }
    }
}
