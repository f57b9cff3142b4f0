//! Hash-based avatar propagation.
//!
//! Three inbound events drive a peer's cache entry:
//!
//! 1. a hash advertisement, which either confirms the cache, loads a
//!    matching file from disk, or triggers one data request;
//! 2. avatar data, which is verified against the claimed and the pending
//!    hash, decoded, persisted and cached;
//! 3. "no avatar", which drops the entry and its file.
//!
//! Local avatar changes are persisted and announced to every online peer.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use peerline_protocol::constants::{AVATAR_MAX_BYTES, AVATAR_RESCALE_SIZE};
use peerline_protocol::{ContentHash, PeerId, Transport};

use crate::decode::{ImageDecoder, ImageInfo, PngDecoder};
use crate::error::AvatarError;
use crate::store::AvatarStore;

/// A cached, verified avatar. `peer` is `None` for the local avatar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarEntry {
    pub peer: Option<PeerId>,
    pub hash: ContentHash,
    pub bytes: Vec<u8>,
    pub info: ImageInfo,
    pub path: Option<PathBuf>,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvatarEvent {
    /// A new avatar is cached (`peer: None` for ours).
    Updated {
        peer: Option<PeerId>,
        hash: ContentHash,
        info: ImageInfo,
    },
    /// The avatar was removed; show the placeholder.
    Reset { peer: Option<PeerId> },
}

pub struct AvatarSyncEngine {
    transport: Arc<dyn Transport>,
    store: AvatarStore,
    decoder: Box<dyn ImageDecoder>,
    local: Option<AvatarEntry>,
    peers: HashMap<PeerId, AvatarEntry>,
    /// Advertised hashes whose data has been requested but not yet accepted.
    pending: HashMap<PeerId, ContentHash>,
    online: BTreeSet<PeerId>,
    events_tx: mpsc::Sender<AvatarEvent>,
    events_rx: Option<mpsc::Receiver<AvatarEvent>>,
}

impl AvatarSyncEngine {
    pub fn new(transport: Arc<dyn Transport>, store: AvatarStore, event_buffer: usize) -> Self {
        let (events_tx, events_rx) = mpsc::channel(event_buffer.max(1));
        Self {
            transport,
            store,
            decoder: Box::new(PngDecoder),
            local: None,
            peers: HashMap::new(),
            pending: HashMap::new(),
            online: BTreeSet::new(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Replaces the default PNG decoder.
    pub fn with_decoder(mut self, decoder: impl ImageDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<AvatarEvent>> {
        self.events_rx.take()
    }

    pub fn store(&self) -> &AvatarStore {
        &self.store
    }

    pub fn local(&self) -> Option<&AvatarEntry> {
        self.local.as_ref()
    }

    pub fn local_hash(&self) -> Option<ContentHash> {
        self.local.as_ref().map(|e| e.hash)
    }

    pub fn entry(&self, peer: PeerId) -> Option<&AvatarEntry> {
        self.peers.get(&peer)
    }

    pub fn pending_hash(&self, peer: PeerId) -> Option<ContentHash> {
        self.pending.get(&peer).copied()
    }

    pub fn online_peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.online.iter().copied()
    }

    // -----------------------------------------------------------------------
    // Peer events
    // -----------------------------------------------------------------------

    /// A peer announced its avatar hash, or that it has none.
    pub fn on_hash_advertised(
        &mut self,
        peer: PeerId,
        hash: Option<ContentHash>,
    ) -> Result<(), AvatarError> {
        let Some(hash) = hash else {
            return self.forget_peer(peer);
        };

        if self.peers.get(&peer).is_some_and(|e| e.hash == hash) {
            self.pending.remove(&peer);
            debug!(%peer, ?hash, "avatar up to date");
            return Ok(());
        }

        if !self.peers.contains_key(&peer) && self.load_cached_file(peer, hash) {
            self.pending.remove(&peer);
            return Ok(());
        }

        debug!(%peer, ?hash, "requesting avatar data");
        self.pending.insert(peer, hash);
        self.transport.request_avatar_data(peer)?;
        Ok(())
    }

    /// Avatar bytes arrived. Returns whether they replaced the cache.
    pub fn on_data_received(
        &mut self,
        peer: PeerId,
        data: Vec<u8>,
        claimed: ContentHash,
    ) -> Result<bool, AvatarError> {
        let actual = self.transport.hash(&data);

        if self.peers.get(&peer).is_some_and(|e| e.hash == actual) {
            debug!(%peer, ?actual, "redundant avatar data discarded");
            return Ok(false);
        }
        if actual != claimed {
            warn!(%peer, ?actual, ?claimed, "avatar data does not match its hash, discarded");
            return Ok(false);
        }
        if let Some(expected) = self.pending.get(&peer)
            && *expected != actual
        {
            warn!(%peer, ?actual, ?expected, "avatar data is not the advertised one, discarded");
            return Ok(false);
        }

        let info = match self.decoder.decode(&data) {
            Ok(info) => info,
            Err(e) => {
                warn!(%peer, error = %e, "undecodable avatar discarded");
                return Ok(false);
            }
        };

        let path = match self.transport.peer_stable_id(peer) {
            Some(stable_id) => Some(self.store.write_peer(&stable_id, &data)?),
            None => {
                warn!(%peer, "peer has no stable id, avatar kept in memory only");
                None
            }
        };

        self.pending.remove(&peer);
        info!(%peer, hash = ?actual, width = info.width, height = info.height, "peer avatar updated");
        self.insert_peer(peer, data, actual, info, path);
        Ok(true)
    }

    /// A peer asked for our avatar hash.
    pub fn on_hash_requested(&self, peer: PeerId) -> Result<(), AvatarError> {
        self.transport.send_avatar_hash(peer, self.local_hash())?;
        Ok(())
    }

    /// A peer asked for our avatar bytes.
    pub fn on_data_requested(&self, peer: PeerId) -> Result<(), AvatarError> {
        match &self.local {
            Some(entry) => self.transport.send_avatar_data(peer, &entry.bytes)?,
            None => debug!(%peer, "avatar data requested but we have none"),
        }
        Ok(())
    }

    /// Tracks presence. A peer coming online is asked for its hash.
    pub fn on_peer_status(&mut self, peer: PeerId, online: bool) -> Result<(), AvatarError> {
        if online {
            self.online.insert(peer);
            self.transport.request_avatar_hash(peer)?;
        } else {
            self.online.remove(&peer);
            self.pending.remove(&peer);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Local avatar
    // -----------------------------------------------------------------------

    /// Replaces our avatar and announces it to every online peer.
    ///
    /// Images over [`AVATAR_MAX_BYTES`] are first rescaled to
    /// [`AVATAR_RESCALE_SIZE`] pixels square and rejected only if they are
    /// still too large.
    pub fn set_local_avatar(&mut self, data: Vec<u8>) -> Result<ContentHash, AvatarError> {
        let data = if data.len() > AVATAR_MAX_BYTES {
            let scaled = self
                .decoder
                .rescale(&data, AVATAR_RESCALE_SIZE, AVATAR_RESCALE_SIZE)?;
            if scaled.len() > AVATAR_MAX_BYTES {
                return Err(AvatarError::TooLarge {
                    size: scaled.len(),
                    max: AVATAR_MAX_BYTES,
                });
            }
            info!(
                original = data.len(),
                scaled = scaled.len(),
                "oversized local avatar rescaled"
            );
            scaled
        } else {
            data
        };
        let info = self.decoder.decode(&data)?;
        let hash = self.transport.hash(&data);
        let path = self.store.write_self(&data)?;

        info!(?hash, width = info.width, height = info.height, "local avatar changed");
        self.local = Some(AvatarEntry {
            peer: None,
            hash,
            bytes: data,
            info,
            path: Some(path),
        });
        self.emit(AvatarEvent::Updated {
            peer: None,
            hash,
            info,
        });
        self.broadcast(Some(hash));
        Ok(hash)
    }

    /// Deletes our avatar and announces "none" to every online peer.
    pub fn remove_local_avatar(&mut self) -> Result<(), AvatarError> {
        self.store.remove_self()?;
        if self.local.take().is_some() {
            info!("local avatar removed");
        }
        self.emit(AvatarEvent::Reset { peer: None });
        self.broadcast(None);
        Ok(())
    }

    /// Loads our avatar and the cached avatar of each of `peers`.
    ///
    /// Unreadable or undecodable files are skipped. Returns how many
    /// avatars were loaded.
    pub fn load_from_disk(&mut self, peers: &[PeerId]) -> Result<usize, AvatarError> {
        let mut loaded = 0;

        if let Some(data) = self.store.read_self()? {
            match self.decoder.decode(&data) {
                Ok(info) => {
                    let hash = self.transport.hash(&data);
                    self.local = Some(AvatarEntry {
                        peer: None,
                        hash,
                        bytes: data,
                        info,
                        path: Some(self.store.self_path()),
                    });
                    self.emit(AvatarEvent::Updated {
                        peer: None,
                        hash,
                        info,
                    });
                    loaded += 1;
                }
                Err(e) => warn!(error = %e, "stored local avatar is not a valid image"),
            }
        }

        for &peer in peers {
            let Some(stable_id) = self.transport.peer_stable_id(peer) else {
                continue;
            };
            let data = match self.store.read_peer(&stable_id) {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%peer, error = %e, "failed to read cached avatar");
                    continue;
                }
            };
            let hash = self.transport.hash(&data);
            match self.decoder.decode(&data) {
                Ok(info) => {
                    let path = self.store.peer_path(&stable_id).ok();
                    self.insert_peer(peer, data, hash, info, path);
                    loaded += 1;
                }
                Err(e) => warn!(%peer, error = %e, "cached avatar is not a valid image"),
            }
        }

        debug!(loaded, "avatars loaded from disk");
        Ok(loaded)
    }

    // -----------------------------------------------------------------------
    // internals
    // -----------------------------------------------------------------------

    fn forget_peer(&mut self, peer: PeerId) -> Result<(), AvatarError> {
        self.pending.remove(&peer);
        let had_entry = self.peers.remove(&peer).is_some();
        let had_file = match self.transport.peer_stable_id(peer) {
            Some(stable_id) => self.store.remove_peer(&stable_id)?,
            None => false,
        };
        if had_entry || had_file {
            info!(%peer, "peer removed their avatar");
        }
        self.emit(AvatarEvent::Reset { peer: Some(peer) });
        Ok(())
    }

    /// Uses the on-disk copy when it already has the advertised hash.
    fn load_cached_file(&mut self, peer: PeerId, hash: ContentHash) -> bool {
        let Some(stable_id) = self.transport.peer_stable_id(peer) else {
            return false;
        };
        let data = match self.store.read_peer(&stable_id) {
            Ok(Some(data)) => data,
            Ok(None) => return false,
            Err(e) => {
                warn!(%peer, error = %e, "failed to read cached avatar");
                return false;
            }
        };
        if self.transport.hash(&data) != hash {
            return false;
        }
        match self.decoder.decode(&data) {
            Ok(info) => {
                debug!(%peer, ?hash, "avatar loaded from disk cache");
                let path = self.store.peer_path(&stable_id).ok();
                self.insert_peer(peer, data, hash, info, path);
                true
            }
            Err(e) => {
                warn!(%peer, error = %e, "cached avatar is not a valid image");
                false
            }
        }
    }

    fn insert_peer(
        &mut self,
        peer: PeerId,
        bytes: Vec<u8>,
        hash: ContentHash,
        info: ImageInfo,
        path: Option<PathBuf>,
    ) {
        self.peers.insert(
            peer,
            AvatarEntry {
                peer: Some(peer),
                hash,
                bytes,
                info,
                path,
            },
        );
        self.emit(AvatarEvent::Updated {
            peer: Some(peer),
            hash,
            info,
        });
    }

    fn broadcast(&self, hash: Option<ContentHash>) {
        let mut sent = 0;
        for &peer in &self.online {
            if !self.transport.is_peer_online(peer) {
                continue;
            }
            match self.transport.send_avatar_hash(peer, hash) {
                Ok(()) => sent += 1,
                Err(e) => warn!(%peer, error = %e, "failed to announce avatar"),
            }
        }
        debug!(sent, "avatar hash announced");
    }

    fn emit(&self, event: AvatarEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            if self.events_rx.is_some() {
                debug!("no avatar event consumer, dropping: {e}");
            } else {
                warn!("failed to deliver avatar event: {e}");
            }
        }
    }
}
