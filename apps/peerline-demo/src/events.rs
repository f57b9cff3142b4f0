//! Per-node event watcher: logs what the engine reports and plays the
//! part of a user who accepts every incoming file.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use peerline_avatar::AvatarEvent;
use peerline_protocol::Direction;
use peerline_session::Session;
use peerline_transfer::{TransferEvent, TransferStatus};

pub async fn event_loop(
    node: &'static str,
    session: Arc<Session>,
    mut transfers: mpsc::Receiver<TransferEvent>,
    mut avatars: mpsc::Receiver<AvatarEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = transfers.recv() => on_transfer_event(node, &session, event).await,
            Some(event) = avatars.recv() => on_avatar_event(node, event),
            else => break,
        }
    }
}

async fn on_transfer_event(node: &'static str, session: &Session, event: TransferEvent) {
    match event {
        TransferEvent::StatusChanged(snap) => {
            info!(
                node,
                id = %snap.id,
                name = %snap.file_name,
                direction = %snap.direction,
                status = %snap.status,
                "transfer status"
            );
            if snap.direction == Direction::Receiving && snap.status == TransferStatus::Offered {
                match session.accept_transfer(snap.key, None).await {
                    Ok(path) => info!(node, path = %path.display(), "accepted incoming file"),
                    Err(e) => warn!(node, key = %snap.key, error = %e, "failed to accept file"),
                }
            }
        }
        TransferEvent::Progress {
            id,
            direction,
            transferred,
            total,
            percent,
            ..
        } => {
            info!(node, %id, %direction, transferred, total, percent, "progress");
        }
    }
}

fn on_avatar_event(node: &'static str, event: AvatarEvent) {
    match event {
        AvatarEvent::Updated { peer, hash, info } => match peer {
            Some(peer) => info!(node, %peer, %hash, width = info.width, height = info.height, "peer avatar"),
            None => info!(node, %hash, "own avatar set"),
        },
        AvatarEvent::Reset { peer: Some(peer) } => info!(node, %peer, "peer avatar cleared"),
        AvatarEvent::Reset { peer: None } => info!(node, "own avatar cleared"),
    }
}
