use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use peerline_avatar::{AvatarEntry, AvatarEvent, AvatarStore, AvatarSyncEngine};
use peerline_protocol::{
    ContentHash, ControlFrame, ControlSignal, Direction, FileId, InboundEvent, PeerId,
    TransferKey, Transport,
};
use peerline_transfer::{
    ChunkSink, ChunkSource, TransferEvent, TransferId, TransferRegistry, TransferSnapshot,
    TransferStatus, destination_for, validate_offer_name,
};

use crate::config::SessionConfig;
use crate::error::SessionError;

/// One peer-messaging session: the transfer registry and avatar engine
/// sharing a transport, fed by a single inbound event stream.
pub struct Session {
    transport: Arc<dyn Transport>,
    transfers: TransferRegistry,
    avatars: Mutex<AvatarSyncEngine>,
    download_dir: PathBuf,
}

impl Session {
    /// Resolves and creates the data and download directories, then builds
    /// the registry and avatar engine around `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: &SessionConfig) -> Result<Self, SessionError> {
        let data_dir = config.resolve_data_dir()?;
        let download_dir = config.resolve_download_dir(&data_dir);
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&download_dir)?;

        let transfers = TransferRegistry::new(Arc::clone(&transport), config.registry_config());
        let avatars = AvatarSyncEngine::new(
            Arc::clone(&transport),
            AvatarStore::new(&data_dir),
            config.event_buffer,
        );

        info!(
            data_dir = %data_dir.display(),
            download_dir = %download_dir.display(),
            "session created"
        );

        Ok(Self {
            transport,
            transfers,
            avatars: Mutex::new(avatars),
            download_dir,
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn transfers(&self) -> &TransferRegistry {
        &self.transfers
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Takes the transfer event receiver. Can only be called once.
    pub fn take_transfer_events(&self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.transfers.take_events()
    }

    /// Takes the avatar event receiver. Can only be called once.
    pub fn take_avatar_events(&self) -> Option<mpsc::Receiver<AvatarEvent>> {
        self.avatars().take_events()
    }

    fn avatars(&self) -> MutexGuard<'_, AvatarSyncEngine> {
        self.avatars.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Outbound transfers
    // -----------------------------------------------------------------------

    /// Offers the file at `path` to `peer`.
    pub async fn send_file(&self, peer: PeerId, path: &Path) -> Result<TransferId, SessionError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SessionError::InvalidPath(path.display().to_string()))?;
        let source = ChunkSource::open(path).await?;
        self.offer(peer, &name, source)
    }

    /// Offers an in-memory buffer (a pasted image, say) under `name`.
    pub fn send_bytes(&self, peer: PeerId, name: &str, data: Vec<u8>) -> Result<TransferId, SessionError> {
        validate_offer_name(name)?;
        self.offer(peer, name, ChunkSource::from_bytes(data))
    }

    fn offer(&self, peer: PeerId, name: &str, source: ChunkSource) -> Result<TransferId, SessionError> {
        let file = self.transport.offer_file(peer, name, source.len())?;
        match self.transfers.register_outbound(peer, file, name, source) {
            Ok(id) => Ok(id),
            Err(e) => {
                // The peer already has the offer; withdraw it.
                self.withdraw_offer(peer, file);
                Err(e.into())
            }
        }
    }

    fn withdraw_offer(&self, peer: PeerId, file: FileId) {
        let frame = ControlFrame::from_local(Direction::Sending, ControlSignal::Kill);
        if let Err(e) = self.transport.send_control(peer, file, frame) {
            debug!(%peer, %file, error = %e, "failed to withdraw offer");
        }
    }

    // -----------------------------------------------------------------------
    // Inbound transfers
    // -----------------------------------------------------------------------

    /// Accepts an inbound offer, writing to `destination` or, when `None`,
    /// to the offered name inside the download directory.
    pub async fn accept_transfer(
        &self,
        key: TransferKey,
        destination: Option<PathBuf>,
    ) -> Result<PathBuf, SessionError> {
        let snapshot = self
            .transfers
            .snapshot(key)
            .ok_or(SessionError::UnknownTransfer(key))?;
        if snapshot.direction != Direction::Receiving || snapshot.status != TransferStatus::Offered {
            return Err(SessionError::NotAwaitingAcceptance {
                key,
                status: snapshot.status,
            });
        }

        let path = match destination {
            Some(path) => path,
            None => destination_for(&self.download_dir, &snapshot.file_name)?,
        };
        let sink = ChunkSink::create(&path)?;
        match self.transfers.accept(key, sink).await {
            Ok(true) => {
                info!(%key, path = %path.display(), "receiving file");
                Ok(path)
            }
            Ok(false) => {
                discard_destination(&path);
                let status = self
                    .transfers
                    .snapshot_by_id(snapshot.id)
                    .map_or(snapshot.status, |s| s.status);
                Err(SessionError::NotAwaitingAcceptance { key, status })
            }
            Err(e) => {
                discard_destination(&path);
                Err(e.into())
            }
        }
    }

    /// Declines an offer or cancels a running transfer.
    pub async fn decline(&self, key: TransferKey) {
        self.transfers.decline(key).await;
    }

    /// Removes a finished record from the list.
    pub fn dismiss(&self, id: TransferId) -> Option<TransferSnapshot> {
        self.transfers.dismiss(id)
    }

    // -----------------------------------------------------------------------
    // Avatars
    // -----------------------------------------------------------------------

    /// Loads our avatar and the cached avatars of `peers` from disk.
    pub fn load_avatars(&self, peers: &[PeerId]) -> Result<usize, SessionError> {
        Ok(self.avatars().load_from_disk(peers)?)
    }

    pub fn set_avatar(&self, data: Vec<u8>) -> Result<ContentHash, SessionError> {
        Ok(self.avatars().set_local_avatar(data)?)
    }

    pub fn remove_avatar(&self) -> Result<(), SessionError> {
        Ok(self.avatars().remove_local_avatar()?)
    }

    pub fn local_avatar_hash(&self) -> Option<ContentHash> {
        self.avatars().local_hash()
    }

    pub fn avatar_hash(&self, peer: PeerId) -> Option<ContentHash> {
        self.avatars().entry(peer).map(|e| e.hash)
    }

    pub fn avatar(&self, peer: PeerId) -> Option<AvatarEntry> {
        self.avatars().entry(peer).cloned()
    }

    pub fn online_peers(&self) -> Vec<PeerId> {
        self.avatars().online_peers().collect()
    }

    // -----------------------------------------------------------------------
    // Inbound event loop
    // -----------------------------------------------------------------------

    /// Routes one inbound event to its owner.
    pub async fn dispatch(&self, event: InboundEvent) {
        let peer = event.peer();
        match event {
            InboundEvent::FileOffer {
                peer,
                file,
                file_name,
                size,
            } => {
                if let Err(e) = self.transfers.register_offer(peer, file, &file_name, size) {
                    warn!(%peer, %file, error = %e, "file offer rejected");
                }
            }
            InboundEvent::Control { peer, file, frame } => {
                self.transfers.on_control_signal(peer, file, frame).await;
            }
            InboundEvent::Data { peer, file, data } => {
                self.transfers.on_data_chunk(peer, file, &data).await;
            }
            InboundEvent::AvatarHash { peer, hash } => {
                if let Err(e) = self.avatars().on_hash_advertised(peer, hash) {
                    warn!(%peer, error = %e, "failed to handle avatar hash");
                }
            }
            InboundEvent::AvatarData { peer, data, hash } => {
                if let Err(e) = self.avatars().on_data_received(peer, data, hash) {
                    error!(%peer, error = %e, "failed to store avatar");
                }
            }
            InboundEvent::AvatarHashRequested { peer } => {
                if let Err(e) = self.avatars().on_hash_requested(peer) {
                    debug!(%peer, error = %e, "failed to answer avatar hash request");
                }
            }
            InboundEvent::AvatarDataRequested { peer } => {
                if let Err(e) = self.avatars().on_data_requested(peer) {
                    debug!(%peer, error = %e, "failed to answer avatar data request");
                }
            }
            InboundEvent::PeerStatus { peer, online } => {
                info!(%peer, online, "peer status changed");
                let queried = self.avatars().on_peer_status(peer, online);
                if let Err(e) = queried {
                    debug!(%peer, error = %e, "failed to query avatar on connect");
                }
                if !online {
                    self.fail_transfers_with(peer).await;
                }
            }
        }
        debug!(%peer, "inbound event handled");
    }

    /// The transport drops a peer's transfers when it disconnects.
    async fn fail_transfers_with(&self, peer: PeerId) {
        let keys: Vec<_> = self
            .transfers
            .snapshots()
            .into_iter()
            .filter(|s| s.key.peer == peer && !s.status.is_terminal())
            .map(|s| s.key)
            .collect();
        for key in keys {
            if self.transfers.mark_terminal(key, TransferStatus::Failed).await {
                warn!(%key, "transfer failed: peer went offline");
            }
        }
    }

    /// Consumes `inbox` until it closes or `cancel` fires, then shuts down.
    pub async fn run(&self, mut inbox: mpsc::Receiver<InboundEvent>, cancel: CancellationToken) {
        info!("session event loop started");
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("session event loop cancelled");
                    break;
                }
                event = inbox.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        info!("inbound stream closed");
                        break;
                    }
                },
            }
        }
        self.shutdown().await;
    }

    /// Kills every live transfer and joins its worker.
    pub async fn shutdown(&self) {
        self.transfers.shutdown().await;
        info!("session shut down");
    }
}

/// Removes a destination file that no transfer will write to.
fn discard_destination(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to remove unused destination");
    }
}
