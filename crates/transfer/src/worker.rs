//! Send loop for one outbound transfer.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use peerline_protocol::constants::DEFAULT_RETRY_INTERVAL;
use peerline_protocol::{ControlFrame, ControlSignal, Direction, SendOutcome, TransferKey};

use crate::TransferError;
use crate::chunked::ChunkSource;
use crate::registry::Shared;
use crate::types::TransferId;

enum StreamOutcome {
    Completed,
    Cancelled,
}

/// Streams one source to the peer, chunk by chunk.
///
/// The worker owns the source exclusively and drops it on its own control
/// flow, whether it completes, fails or is cancelled.
pub(crate) struct TransferWorker {
    shared: Arc<Shared>,
    key: TransferKey,
    id: TransferId,
    total: u64,
    source: ChunkSource,
    cancel: CancellationToken,
}

impl TransferWorker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        key: TransferKey,
        id: TransferId,
        total: u64,
        source: ChunkSource,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            key,
            id,
            total,
            source,
            cancel,
        }
    }

    pub(crate) async fn run(self) {
        let TransferWorker {
            shared,
            key,
            id,
            total,
            source,
            cancel,
        } = self;
        let ctx = WorkerContext {
            shared: &shared,
            key,
            id,
            cancel: &cancel,
        };

        match ctx.stream_chunks(source, total).await {
            Ok(StreamOutcome::Completed) => ctx.finish().await,
            Ok(StreamOutcome::Cancelled) => debug!(%key, "send worker cancelled"),
            Err(e) => shared.fail_from_worker(key, id, &e),
        }
    }
}

struct WorkerContext<'a> {
    shared: &'a Shared,
    key: TransferKey,
    id: TransferId,
    cancel: &'a CancellationToken,
}

impl WorkerContext<'_> {
    /// Sends every byte of `source`. The source is dropped on return.
    async fn stream_chunks(
        &self,
        mut source: ChunkSource,
        total: u64,
    ) -> Result<StreamOutcome, TransferError> {
        let transport = &self.shared.transport;
        let (peer, file) = (self.key.peer, self.key.file);
        let mut remaining = total;
        let mut buf = Vec::new();

        while remaining > 0 {
            if self.cancel.is_cancelled() {
                return Ok(StreamOutcome::Cancelled);
            }

            let chunk_size = transport.current_chunk_size(peer).max(1);
            let want = remaining.min(chunk_size as u64) as usize;
            buf.resize(want, 0);
            let n = source.read_chunk(&mut buf).await?;
            if n < want {
                return Err(TransferError::SourceExhausted { remaining });
            }

            loop {
                match transport.send_chunk(peer, file, &buf)? {
                    SendOutcome::Accepted => break,
                    SendOutcome::Refused { retry_in } => {
                        if !self.shared.note_refusal(self.key, self.id) {
                            return Ok(StreamOutcome::Cancelled);
                        }
                        let wait = if retry_in.is_zero() {
                            DEFAULT_RETRY_INTERVAL
                        } else {
                            retry_in
                        };
                        trace!(key = %self.key, ?wait, "chunk refused, retrying");
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }

            remaining -= want as u64;
            self.shared.note_sent(self.key, self.id, remaining);
        }

        Ok(StreamOutcome::Completed)
    }

    /// Announces completion and parks until the registry releases us.
    async fn finish(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let frame = ControlFrame::from_local(Direction::Sending, ControlSignal::Finished);
        if let Err(e) = self
            .shared
            .transport
            .send_control(self.key.peer, self.key.file, frame)
        {
            self.shared
                .fail_from_worker(self.key, self.id, &TransferError::Transport(e));
            return;
        }
        info!(key = %self.key, "all chunks sent, waiting for peer confirmation");
        self.cancel.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::registry::{RegistryConfig, TransferRegistry};
    use crate::testing::RecordingTransport;
    use crate::types::TransferStatus;
    use peerline_protocol::{FileId, PeerId};

    const PEER: PeerId = PeerId(2);
    const FILE: FileId = FileId(5);

    fn accept() -> ControlFrame {
        ControlFrame::from_local(Direction::Receiving, ControlSignal::Accept)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn chunk_size_is_read_per_chunk() {
        let transport = Arc::new(RecordingTransport::new(5));
        transport.plan_chunk_sizes(&[3]);
        let reg = TransferRegistry::new(transport.clone(), RegistryConfig::default());
        reg.register_outbound(PEER, FILE, "a", ChunkSource::from_bytes(vec![9; 12]))
            .unwrap();
        reg.on_control_signal(PEER, FILE, accept()).await;
        settle().await;

        assert_eq!(transport.chunk_sizes(), vec![3, 5, 4]);
    }

    #[tokio::test]
    async fn exhausted_source_fails_transfer() {
        let transport = Arc::new(RecordingTransport::new(4));
        let reg = TransferRegistry::new(transport.clone(), RegistryConfig::default());
        // claims 10 bytes, has 6
        let source = ChunkSource::from_reader(std::io::Cursor::new(vec![1u8; 6]), 10);
        let id = reg.register_outbound(PEER, FILE, "short", source).unwrap();
        reg.on_control_signal(PEER, FILE, accept()).await;
        settle().await;

        let snap = reg.snapshot_by_id(id).unwrap();
        assert_eq!(snap.status, TransferStatus::Failed);
        assert_eq!(snap.bytes_remaining, 6);
        assert!(snap.error.unwrap().contains("6 bytes still to send"));
        assert_eq!(transport.chunk_sizes(), vec![4]);
        let controls = transport.controls();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].1.signal, ControlSignal::Kill);
        assert_eq!(controls[0].1.speaker, Direction::Sending);
    }

    #[tokio::test]
    async fn hard_transport_error_fails_transfer() {
        let transport = Arc::new(RecordingTransport::new(4));
        let reg = TransferRegistry::new(transport.clone(), RegistryConfig::default());
        let id = reg
            .register_outbound(PEER, FILE, "a", ChunkSource::from_bytes(vec![0; 8]))
            .unwrap();
        transport.set_online(false);
        reg.on_control_signal(PEER, FILE, accept()).await;
        settle().await;

        let snap = reg.snapshot_by_id(id).unwrap();
        assert_eq!(snap.status, TransferStatus::Failed);
        assert!(snap.error.unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn empty_source_sends_only_finished() {
        let transport = Arc::new(RecordingTransport::new(4));
        let reg = TransferRegistry::new(transport.clone(), RegistryConfig::default());
        let id = reg
            .register_outbound(PEER, FILE, "empty", ChunkSource::from_bytes(Vec::new()))
            .unwrap();
        reg.on_control_signal(PEER, FILE, accept()).await;
        settle().await;

        assert!(transport.chunk_sizes().is_empty());
        assert_eq!(transport.controls().len(), 1);

        let ack = ControlFrame::from_local(Direction::Receiving, ControlSignal::Finished);
        reg.on_control_signal(PEER, FILE, ack).await;
        assert_eq!(
            reg.snapshot_by_id(id).unwrap().status,
            TransferStatus::Finished
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retry_interval_falls_back_to_default() {
        let transport = Arc::new(RecordingTransport::new(16));
        transport.refuse_next(1, Duration::ZERO);
        let reg = TransferRegistry::new(transport.clone(), RegistryConfig::default());
        reg.register_outbound(PEER, FILE, "a", ChunkSource::from_bytes(vec![3; 4]))
            .unwrap();

        let start = tokio::time::Instant::now();
        reg.on_control_signal(PEER, FILE, accept()).await;
        while transport.controls().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(start.elapsed() >= DEFAULT_RETRY_INTERVAL);
        assert_eq!(transport.attempts().len(), 2);
    }
}
