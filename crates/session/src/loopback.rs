//! In-memory transport linking two sessions.
//!
//! Each end pushes [`InboundEvent`]s into the other end's bounded inbox.
//! Data chunks are refused while the inbox is nearly full, so the send
//! worker's retry path runs for real; a few slots stay reserved for control
//! and avatar messages. Control frames travel encoded and are decoded on
//! arrival, as they would on a real wire.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use peerline_protocol::{
    ContentHash, ControlFrame, FileId, InboundEvent, PeerId, SendOutcome, Transport,
    TransportError,
};

/// Slots kept free for non-data messages.
const CONTROL_RESERVE: usize = 4;

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub chunk_size: usize,
    pub queue_depth: usize,
    pub retry_in: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            queue_depth: 64,
            retry_in: Duration::from_millis(5),
        }
    }
}

/// One side of a loopback link: the transport to hand to a session and
/// the inbox that session consumes.
pub struct LoopbackEnd {
    pub transport: Arc<LoopbackTransport>,
    pub inbox: mpsc::Receiver<InboundEvent>,
}

pub struct LoopbackTransport {
    /// How this end addresses the other side.
    peer: PeerId,
    peer_stable_id: String,
    /// How the other side addresses this end.
    as_seen_by_peer: PeerId,
    outbox: mpsc::Sender<InboundEvent>,
    online: Arc<AtomicBool>,
    /// Shared by both ends so file ids never collide across directions.
    next_file: Arc<AtomicU32>,
    config: LoopbackConfig,
}

impl LoopbackTransport {
    /// Builds two connected ends. Each sees the other as `PeerId(0)`.
    ///
    /// The link starts offline; call [`set_online`](Self::set_online) on
    /// both ends to announce presence.
    pub fn pair(config: LoopbackConfig) -> (LoopbackEnd, LoopbackEnd) {
        let depth = config.queue_depth.max(CONTROL_RESERVE + 1);
        let (to_a, inbox_a) = mpsc::channel(depth);
        let (to_b, inbox_b) = mpsc::channel(depth);
        let online = Arc::new(AtomicBool::new(false));
        let next_file = Arc::new(AtomicU32::new(0));

        let a = LoopbackTransport {
            peer: PeerId(0),
            peer_stable_id: stable_id_for("b"),
            as_seen_by_peer: PeerId(0),
            outbox: to_b,
            online: Arc::clone(&online),
            next_file: Arc::clone(&next_file),
            config: config.clone(),
        };
        let b = LoopbackTransport {
            peer: PeerId(0),
            peer_stable_id: stable_id_for("a"),
            as_seen_by_peer: PeerId(0),
            outbox: to_a,
            online,
            next_file,
            config,
        };

        (
            LoopbackEnd {
                transport: Arc::new(a),
                inbox: inbox_a,
            },
            LoopbackEnd {
                transport: Arc::new(b),
                inbox: inbox_b,
            },
        )
    }

    /// The id this end uses for the other side.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Marks the link up or down and tells the other side about this end.
    pub fn set_online(&self, online: bool) -> Result<(), TransportError> {
        self.online.store(online, Ordering::SeqCst);
        self.deliver(InboundEvent::PeerStatus {
            peer: self.as_seen_by_peer,
            online,
        })
    }

    fn check_peer(&self, peer: PeerId) -> Result<(), TransportError> {
        if peer != self.peer {
            return Err(TransportError::UnknownPeer(peer));
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::PeerOffline(peer));
        }
        Ok(())
    }

    fn deliver(&self, event: InboundEvent) -> Result<(), TransportError> {
        self.outbox.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Other("loopback queue full".into()),
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

fn stable_id_for(label: &str) -> String {
    ContentHash::of(format!("loopback-{label}").as_bytes())
        .to_hex()
        .to_uppercase()
}

impl Transport for LoopbackTransport {
    fn is_peer_online(&self, peer: PeerId) -> bool {
        peer == self.peer && self.online.load(Ordering::SeqCst)
    }

    fn peer_stable_id(&self, peer: PeerId) -> Option<String> {
        (peer == self.peer).then(|| self.peer_stable_id.clone())
    }

    fn offer_file(&self, peer: PeerId, file_name: &str, size: u64) -> Result<FileId, TransportError> {
        self.check_peer(peer)?;
        let file = FileId(self.next_file.fetch_add(1, Ordering::Relaxed));
        self.deliver(InboundEvent::FileOffer {
            peer: self.as_seen_by_peer,
            file,
            file_name: file_name.to_string(),
            size,
        })?;
        debug!(%peer, %file, name = file_name, size, "file offered over loopback");
        Ok(file)
    }

    fn current_chunk_size(&self, _peer: PeerId) -> usize {
        self.config.chunk_size
    }

    fn send_chunk(&self, peer: PeerId, file: FileId, data: &[u8]) -> Result<SendOutcome, TransportError> {
        self.check_peer(peer)?;
        let refused = SendOutcome::Refused {
            retry_in: self.config.retry_in,
        };
        if self.outbox.capacity() <= CONTROL_RESERVE {
            trace!(%peer, %file, "loopback queue nearly full, refusing chunk");
            return Ok(refused);
        }
        let event = InboundEvent::Data {
            peer: self.as_seen_by_peer,
            file,
            data: data.to_vec(),
        };
        match self.outbox.try_send(event) {
            Ok(()) => Ok(SendOutcome::Accepted),
            Err(TrySendError::Full(_)) => Ok(refused),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn send_control(&self, peer: PeerId, file: FileId, frame: ControlFrame) -> Result<(), TransportError> {
        self.check_peer(peer)?;
        let frame = ControlFrame::decode(&frame.encode())
            .ok_or_else(|| TransportError::Other(format!("unencodable control frame {frame}")))?;
        self.deliver(InboundEvent::Control {
            peer: self.as_seen_by_peer,
            file,
            frame,
        })
    }

    fn send_avatar_hash(&self, peer: PeerId, hash: Option<ContentHash>) -> Result<(), TransportError> {
        self.check_peer(peer)?;
        self.deliver(InboundEvent::AvatarHash {
            peer: self.as_seen_by_peer,
            hash,
        })
    }

    fn request_avatar_hash(&self, peer: PeerId) -> Result<(), TransportError> {
        self.check_peer(peer)?;
        self.deliver(InboundEvent::AvatarHashRequested {
            peer: self.as_seen_by_peer,
        })
    }

    fn request_avatar_data(&self, peer: PeerId) -> Result<(), TransportError> {
        self.check_peer(peer)?;
        self.deliver(InboundEvent::AvatarDataRequested {
            peer: self.as_seen_by_peer,
        })
    }

    fn send_avatar_data(&self, peer: PeerId, data: &[u8]) -> Result<(), TransportError> {
        self.check_peer(peer)?;
        self.deliver(InboundEvent::AvatarData {
            peer: self.as_seen_by_peer,
            data: data.to_vec(),
            hash: self.hash(data),
        })
    }
}
