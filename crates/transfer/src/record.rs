use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use peerline_protocol::{Direction, TransferKey};

use crate::chunked::{ChunkSink, ChunkSource};
use crate::types::{TransferId, TransferSnapshot, TransferStatus, progress_percent};

/// The open local stream of a record.
#[derive(Debug)]
pub(crate) enum TransferStream {
    Source(ChunkSource),
    Sink(ChunkSink),
}

/// Cancellation handle of a running send worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub(crate) cancel: CancellationToken,
    pub(crate) join: JoinHandle<()>,
}

/// What a record gives up when it reaches a terminal state.
#[derive(Debug, Default)]
pub(crate) struct Released {
    pub(crate) stream: Option<TransferStream>,
    pub(crate) worker: Option<WorkerHandle>,
}

/// State of one file transfer, owned by the registry.
#[derive(Debug)]
pub struct TransferRecord {
    pub(crate) id: TransferId,
    pub(crate) key: TransferKey,
    pub(crate) direction: Direction,
    pub(crate) file_name: String,
    pub(crate) total_size: u64,
    pub(crate) bytes_remaining: u64,
    pub(crate) status: TransferStatus,
    pub(crate) retries: u32,
    pub(crate) error: Option<String>,
    pub(crate) stream: Option<TransferStream>,
    pub(crate) worker: Option<WorkerHandle>,
}

impl TransferRecord {
    /// A file we offered. The source stays here until the peer accepts.
    pub(crate) fn outbound(
        id: TransferId,
        key: TransferKey,
        file_name: String,
        source: ChunkSource,
    ) -> Self {
        let total_size = source.len();
        Self::new(
            id,
            key,
            Direction::Sending,
            file_name,
            total_size,
            Some(TransferStream::Source(source)),
        )
    }

    /// A file a peer offered us. No sink until the user accepts.
    pub(crate) fn inbound(id: TransferId, key: TransferKey, file_name: String, size: u64) -> Self {
        Self::new(id, key, Direction::Receiving, file_name, size, None)
    }

    fn new(
        id: TransferId,
        key: TransferKey,
        direction: Direction,
        file_name: String,
        total_size: u64,
        stream: Option<TransferStream>,
    ) -> Self {
        Self {
            id,
            key,
            direction,
            file_name,
            total_size,
            bytes_remaining: total_size,
            status: TransferStatus::Offered,
            retries: 0,
            error: None,
            stream,
            worker: None,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn key(&self) -> TransferKey {
        self.key
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            key: self.key,
            direction: self.direction,
            file_name: self.file_name.clone(),
            total_size: self.total_size,
            bytes_remaining: self.bytes_remaining,
            status: self.status,
            percent: progress_percent(self.bytes_remaining, self.total_size),
            retries: self.retries,
            error: self.error.clone(),
        }
    }

    /// Applies a status change if the lifecycle allows it.
    pub(crate) fn advance(&mut self, next: TransferStatus) -> bool {
        if !self.status.can_become(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Moves the record into a terminal state and hands back its stream and
    /// worker so the caller can stop them outside the registry lock.
    pub(crate) fn terminate(&mut self, status: TransferStatus, error: Option<String>) -> Released {
        debug_assert!(status.is_terminal());
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        Released {
            stream: self.stream.take(),
            worker: self.worker.take(),
        }
    }

    pub(crate) fn take_source(&mut self) -> Option<ChunkSource> {
        match self.stream.take() {
            Some(TransferStream::Source(source)) => Some(source),
            other => {
                self.stream = other;
                None
            }
        }
    }

    pub(crate) fn take_sink(&mut self) -> Option<ChunkSink> {
        match self.stream.take() {
            Some(TransferStream::Sink(sink)) => Some(sink),
            other => {
                self.stream = other;
                None
            }
        }
    }

    /// Returns a sink taken with [`take_sink`](Self::take_sink).
    pub(crate) fn put_sink(&mut self, sink: ChunkSink) {
        self.stream = Some(TransferStream::Sink(sink));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerline_protocol::{FileId, PeerId};

    fn key() -> TransferKey {
        TransferKey::new(PeerId(1), FileId(0))
    }

    #[test]
    fn outbound_record_holds_source_until_taken() {
        let source = ChunkSource::from_bytes(vec![0; 32]);
        let mut record = TransferRecord::outbound(TransferId(1), key(), "a.bin".into(), source);

        assert_eq!(record.direction(), Direction::Sending);
        assert_eq!(record.status(), TransferStatus::Offered);
        assert_eq!(record.bytes_remaining(), 32);
        assert!(record.take_sink().is_none());
        assert!(record.stream.is_some());

        let source = record.take_source().unwrap();
        assert_eq!(source.len(), 32);
        assert!(record.stream.is_none());
    }

    #[test]
    fn inbound_record_starts_without_stream() {
        let mut record = TransferRecord::inbound(TransferId(2), key(), "b.bin".into(), 100);
        assert_eq!(record.direction(), Direction::Receiving);
        assert!(record.take_sink().is_none());

        record.put_sink(ChunkSink::from_writer(Vec::new()));
        let mut sink = record.take_sink().unwrap();
        sink.write_chunk(b"abc").unwrap();
        record.put_sink(sink);
        assert_eq!(record.take_sink().unwrap().written(), 3);
        assert!(record.stream.is_none());
    }

    #[test]
    fn advance_rejects_illegal_transitions() {
        let mut record = TransferRecord::inbound(TransferId(3), key(), "c".into(), 1);
        assert!(!record.advance(TransferStatus::Transferring));
        assert!(record.advance(TransferStatus::Accepted));
        assert!(record.advance(TransferStatus::Transferring));
        assert!(!record.advance(TransferStatus::Accepted));
        assert_eq!(record.status(), TransferStatus::Transferring);
    }

    #[test]
    fn terminate_releases_stream_and_keeps_error() {
        let source = ChunkSource::from_bytes(vec![1, 2, 3]);
        let mut record = TransferRecord::outbound(TransferId(4), key(), "d".into(), source);

        let released = record.terminate(TransferStatus::Failed, Some("disk full".into()));
        assert!(matches!(released.stream, Some(TransferStream::Source(_))));
        assert!(released.worker.is_none());
        assert!(record.stream.is_none());

        let snap = record.snapshot();
        assert_eq!(snap.status, TransferStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("disk full"));
        assert_eq!(snap.percent, 0);
    }
}
