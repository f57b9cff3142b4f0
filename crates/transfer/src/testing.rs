//! Recording transport double shared by the unit tests.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};

use peerline_protocol::{
    ContentHash, ControlFrame, FileId, PeerId, SendOutcome, TransferKey, Transport,
    TransportError,
};

/// Something that reached the wire.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Sent {
    Chunk { key: TransferKey, data: Vec<u8> },
    Control { key: TransferKey, frame: ControlFrame },
}

#[derive(Default)]
struct Inner {
    log: Vec<Sent>,
    attempts: Vec<Vec<u8>>,
    chunk_plan: VecDeque<usize>,
    refuse_next: u32,
    refuse_after: Option<usize>,
    retry_in: Duration,
    accepted: usize,
}

pub(crate) struct RecordingTransport {
    chunk_size: AtomicUsize,
    online: AtomicBool,
    inner: Mutex<Inner>,
}

impl RecordingTransport {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: AtomicUsize::new(chunk_size),
            online: AtomicBool::new(true),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Chunk sizes to report before falling back to the fixed size.
    pub(crate) fn plan_chunk_sizes(&self, sizes: &[usize]) {
        self.inner.lock().unwrap().chunk_plan.extend(sizes);
    }

    /// Refuses the next `n` send attempts.
    pub(crate) fn refuse_next(&self, n: u32, retry_in: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.refuse_next = n;
        inner.retry_in = retry_in;
    }

    /// Accepts `n` chunks, then refuses forever.
    pub(crate) fn refuse_after(&self, n: usize, retry_in: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.refuse_after = Some(n);
        inner.retry_in = retry_in;
    }

    pub(crate) fn log(&self) -> Vec<Sent> {
        self.inner.lock().unwrap().log.clone()
    }

    /// Every chunk handed to `send_chunk`, refused or not.
    pub(crate) fn attempts(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().attempts.clone()
    }

    /// Sizes of accepted chunks, in order.
    pub(crate) fn chunk_sizes(&self) -> Vec<usize> {
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Chunk { data, .. } => Some(data.len()),
                Sent::Control { .. } => None,
            })
            .collect()
    }

    pub(crate) fn sent_bytes(&self, key: TransferKey) -> Vec<u8> {
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Chunk { key: k, data } if k == key => Some(data),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub(crate) fn controls(&self) -> Vec<(TransferKey, ControlFrame)> {
        self.log()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Control { key, frame } => Some((key, frame)),
                Sent::Chunk { .. } => None,
            })
            .collect()
    }

    fn check_online(&self, peer: PeerId) -> Result<(), TransportError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::PeerOffline(peer))
        }
    }
}

impl Transport for RecordingTransport {
    fn is_peer_online(&self, _peer: PeerId) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn peer_stable_id(&self, peer: PeerId) -> Option<String> {
        Some(format!("{:064X}", peer.0))
    }

    fn offer_file(&self, peer: PeerId, _file_name: &str, _size: u64) -> Result<FileId, TransportError> {
        self.check_online(peer)?;
        Ok(FileId(0))
    }

    fn current_chunk_size(&self, _peer: PeerId) -> usize {
        let planned = self.inner.lock().unwrap().chunk_plan.pop_front();
        planned.unwrap_or_else(|| self.chunk_size.load(Ordering::SeqCst))
    }

    fn send_chunk(&self, peer: PeerId, file: FileId, data: &[u8]) -> Result<SendOutcome, TransportError> {
        self.check_online(peer)?;
        let mut inner = self.inner.lock().unwrap();
        inner.attempts.push(data.to_vec());

        if inner.refuse_next > 0 {
            inner.refuse_next -= 1;
            return Ok(SendOutcome::Refused {
                retry_in: inner.retry_in,
            });
        }
        if inner.refuse_after.is_some_and(|n| inner.accepted >= n) {
            return Ok(SendOutcome::Refused {
                retry_in: inner.retry_in,
            });
        }

        inner.accepted += 1;
        inner.log.push(Sent::Chunk {
            key: TransferKey::new(peer, file),
            data: data.to_vec(),
        });
        Ok(SendOutcome::Accepted)
    }

    fn send_control(&self, peer: PeerId, file: FileId, frame: ControlFrame) -> Result<(), TransportError> {
        self.check_online(peer)?;
        self.inner.lock().unwrap().log.push(Sent::Control {
            key: TransferKey::new(peer, file),
            frame,
        });
        Ok(())
    }

    fn send_avatar_hash(&self, _peer: PeerId, _hash: Option<ContentHash>) -> Result<(), TransportError> {
        Ok(())
    }

    fn request_avatar_hash(&self, _peer: PeerId) -> Result<(), TransportError> {
        Ok(())
    }

    fn request_avatar_data(&self, _peer: PeerId) -> Result<(), TransportError> {
        Ok(())
    }

    fn send_avatar_data(&self, _peer: PeerId, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }
}

/// In-memory reader that raises a flag when dropped.
pub(crate) struct DropFlag {
    inner: std::io::Cursor<Vec<u8>>,
    dropped: Arc<AtomicBool>,
}

impl DropFlag {
    pub(crate) fn new(data: Vec<u8>, dropped: Arc<AtomicBool>) -> Self {
        Self {
            inner: std::io::Cursor::new(data),
            dropped,
        }
    }
}

impl AsyncRead for DropFlag {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}
