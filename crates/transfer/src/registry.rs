//! Owner of every transfer record.
//!
//! Records are keyed by `(peer, file)` while live. Terminal records move to
//! a separate list where they stay, without stream or worker, until the UI
//! dismisses them. All mutations happen under one lock; workers are joined
//! and streams dropped only after the lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use peerline_protocol::constants::DEFAULT_CANCEL_GRACE;
use peerline_protocol::{
    ControlFrame, ControlSignal, Direction, FileId, PeerId, TransferKey, Transport,
};

use crate::TransferError;
use crate::chunked::{ChunkSink, ChunkSource};
use crate::record::{Released, TransferRecord, WorkerHandle};
use crate::types::{TransferEvent, TransferId, TransferSnapshot, TransferStatus, progress_percent};
use crate::worker::TransferWorker;

/// Tunables for a [`TransferRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a cancelled worker gets to stop before it is aborted.
    pub cancel_grace: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cancel_grace: DEFAULT_CANCEL_GRACE,
            event_buffer: 256,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    live: HashMap<TransferKey, TransferRecord>,
    finished: Vec<TransferRecord>,
}

impl RegistryState {
    fn live_matching(&mut self, key: TransferKey, id: TransferId) -> Option<&mut TransferRecord> {
        self.live.get_mut(&key).filter(|r| r.id == id)
    }

    /// Moves a live record to the finished list. `id` guards against a
    /// newer record that reused the key.
    fn retire(
        &mut self,
        key: TransferKey,
        id: Option<TransferId>,
        status: TransferStatus,
        error: Option<String>,
    ) -> Option<(Released, TransferSnapshot)> {
        let matches = self
            .live
            .get(&key)
            .is_some_and(|r| id.is_none_or(|id| r.id == id));
        if !matches {
            return None;
        }
        let mut record = self.live.remove(&key)?;
        let released = record.terminate(status, error);
        let snapshot = record.snapshot();
        self.finished.push(record);
        Some((released, snapshot))
    }
}

/// State shared between the registry handle and its workers.
pub(crate) struct Shared {
    pub(crate) transport: Arc<dyn Transport>,
    state: Mutex<RegistryState>,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransferEvent>>>,
    next_id: AtomicU64,
    cancel_grace: Duration,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            if self.events_unclaimed() {
                debug!("no transfer event consumer, dropping: {e}");
            } else {
                warn!("failed to deliver transfer event: {e}");
            }
        }
    }

    /// True until [`TransferRegistry::take_events`] has handed out the receiver.
    fn events_unclaimed(&self) -> bool {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Records a refused chunk. Returns `false` once the record is gone.
    pub(crate) fn note_refusal(&self, key: TransferKey, id: TransferId) -> bool {
        match self.state().live_matching(key, id) {
            Some(record) => {
                record.retries += 1;
                true
            }
            None => false,
        }
    }

    /// Records bytes the transport has taken.
    pub(crate) fn note_sent(&self, key: TransferKey, id: TransferId, remaining: u64) {
        let event = {
            let mut state = self.state();
            let Some(record) = state.live_matching(key, id) else {
                return;
            };
            record.bytes_remaining = remaining;
            progress_event(record)
        };
        self.emit(event);
    }

    /// Fails a record from inside its own worker.
    ///
    /// The worker's handle is detached rather than joined; the caller is
    /// that worker and returns right after.
    pub(crate) fn fail_from_worker(&self, key: TransferKey, id: TransferId, error: &TransferError) {
        let retired = self
            .state()
            .retire(key, Some(id), TransferStatus::Failed, Some(error.to_string()));
        let Some((released, snapshot)) = retired else {
            return;
        };
        drop(released);
        warn!(%key, error = %error, "outbound transfer failed");
        self.emit(TransferEvent::StatusChanged(snapshot));

        if self.transport.is_peer_online(key.peer) {
            let frame = ControlFrame::from_local(Direction::Sending, ControlSignal::Kill);
            if let Err(e) = self.transport.send_control(key.peer, key.file, frame) {
                debug!(%key, error = %e, "failed to send kill after failure");
            }
        }
    }
}

fn progress_event(record: &TransferRecord) -> TransferEvent {
    TransferEvent::Progress {
        id: record.id,
        key: record.key,
        direction: record.direction,
        transferred: record.total_size - record.bytes_remaining,
        total: record.total_size,
        percent: progress_percent(record.bytes_remaining, record.total_size),
    }
}

/// Cancels and joins a released worker, then drops the stream.
async fn stop_released(key: TransferKey, released: Released, grace: Duration) {
    if let Some(WorkerHandle { cancel, mut join }) = released.worker {
        cancel.cancel();
        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(())) => debug!(%key, "transfer worker stopped"),
            Ok(Err(e)) => warn!(%key, error = %e, "transfer worker ended abnormally"),
            Err(_) => {
                warn!(%key, ?grace, "transfer worker did not stop in time, aborting");
                join.abort();
                let _ = join.await;
            }
        }
    }
    drop(released.stream);
}

/// Registry of all file transfers for one session.
///
/// Cheap to clone; clones share the same records.
#[derive(Clone)]
pub struct TransferRegistry {
    shared: Arc<Shared>,
}

impl TransferRegistry {
    pub fn new(transport: Arc<dyn Transport>, config: RegistryConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                transport,
                state: Mutex::new(RegistryState::default()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                next_id: AtomicU64::new(1),
                cancel_grace: config.cancel_grace,
            }),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.shared
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Creates a Sending record in `Offered` for a file the transport has
    /// already announced as `file`.
    pub fn register_outbound(
        &self,
        peer: PeerId,
        file: FileId,
        file_name: &str,
        source: ChunkSource,
    ) -> Result<TransferId, TransferError> {
        let key = TransferKey::new(peer, file);
        self.insert(key, |id| {
            TransferRecord::outbound(id, key, file_name.to_string(), source)
        })
    }

    /// Creates a Receiving record in `Offered` for a peer's offer.
    pub fn register_offer(
        &self,
        peer: PeerId,
        file: FileId,
        file_name: &str,
        size: u64,
    ) -> Result<TransferId, TransferError> {
        let key = TransferKey::new(peer, file);
        self.insert(key, |id| {
            TransferRecord::inbound(id, key, file_name.to_string(), size)
        })
    }

    fn insert(
        &self,
        key: TransferKey,
        build: impl FnOnce(TransferId) -> TransferRecord,
    ) -> Result<TransferId, TransferError> {
        let snapshot = {
            let mut state = self.shared.state();
            if state.live.contains_key(&key) {
                warn!(%key, "rejecting duplicate registration of a live transfer");
                return Err(TransferError::DuplicateTransfer(key));
            }
            let id = TransferId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
            let record = build(id);
            let snapshot = record.snapshot();
            state.live.insert(key, record);
            snapshot
        };

        info!(
            %key,
            id = %snapshot.id,
            direction = %snapshot.direction,
            name = %snapshot.file_name,
            size = snapshot.total_size,
            "transfer registered"
        );
        let id = snapshot.id;
        self.shared.emit(TransferEvent::StatusChanged(snapshot));
        Ok(id)
    }

    /// Accepts an inbound offer: installs `sink` and sends Accept.
    ///
    /// Returns `false`, dropping `sink`, when the record is unknown,
    /// terminal or already accepted.
    pub async fn accept(&self, key: TransferKey, sink: ChunkSink) -> Result<bool, TransferError> {
        let snapshot = {
            let mut state = self.shared.state();
            let Some(record) = state.live.get_mut(&key) else {
                debug!(%key, "accept for unknown or finished transfer ignored");
                return Ok(false);
            };
            if record.direction != Direction::Receiving {
                return Err(TransferError::WrongDirection {
                    key,
                    expected: Direction::Receiving,
                    actual: record.direction,
                });
            }
            if !record.advance(TransferStatus::Accepted) {
                debug!(%key, status = %record.status, "transfer already accepted");
                return Ok(false);
            }
            record.put_sink(sink);
            record.snapshot()
        };
        self.shared.emit(TransferEvent::StatusChanged(snapshot.clone()));

        let frame = ControlFrame::from_local(Direction::Receiving, ControlSignal::Accept);
        if let Err(e) = self
            .shared
            .transport
            .send_control(key.peer, key.file, frame)
        {
            warn!(%key, error = %e, "failed to send accept");
            self.terminate(key, Some(snapshot.id), TransferStatus::Failed, Some(e.to_string()))
                .await;
            return Err(e.into());
        }
        info!(%key, "inbound transfer accepted");
        Ok(true)
    }

    /// Declines or cancels a transfer in either direction.
    ///
    /// The worker is stopped before Kill goes out, so no chunk follows it.
    pub async fn decline(&self, key: TransferKey) {
        let Some((id, direction)) = self.live_identity(key) else {
            debug!(%key, "decline for unknown or finished transfer ignored");
            return;
        };
        if !self
            .terminate(key, Some(id), TransferStatus::Killed, None)
            .await
        {
            return;
        }
        info!(%key, %direction, "transfer cancelled locally");
        self.send_kill(key, direction);
    }

    /// Moves a live record to a terminal `status`, stopping its worker and
    /// releasing its stream. Returns whether anything changed.
    pub async fn mark_terminal(&self, key: TransferKey, status: TransferStatus) -> bool {
        if !status.is_terminal() {
            debug!(%key, %status, "mark_terminal called with a non-terminal status");
            return false;
        }
        self.terminate(key, None, status, None).await
    }

    /// Applies a control frame received from the peer.
    pub async fn on_control_signal(&self, peer: PeerId, file: FileId, frame: ControlFrame) {
        let key = TransferKey::new(peer, file);
        let Some((id, direction)) = self.live_identity(key) else {
            debug!(%key, %frame, "control frame for unknown or finished transfer ignored");
            return;
        };
        if frame.addressed_direction() != direction {
            debug!(%key, %frame, %direction, "control frame addresses the other direction, ignored");
            return;
        }

        match (direction, frame.signal) {
            (_, ControlSignal::Kill) => {
                if self
                    .terminate(key, Some(id), TransferStatus::Killed, None)
                    .await
                {
                    info!(%key, %direction, "transfer killed by peer");
                }
            }
            (Direction::Sending, ControlSignal::Accept) => self.start_worker(key, id),
            (Direction::Sending, ControlSignal::Finished) => self.confirm_outbound(key, id).await,
            (Direction::Receiving, ControlSignal::Finished) => self.complete_inbound(key, id).await,
            (Direction::Receiving, ControlSignal::Accept) => {
                debug!(%key, "accept from the sending side ignored");
            }
        }
    }

    /// Appends a chunk to an accepted inbound transfer.
    ///
    /// The sink leaves the record while the chunk is written, so disk I/O
    /// never runs under the registry lock. Callers deliver one transfer's
    /// chunks sequentially.
    pub async fn on_data_chunk(&self, peer: PeerId, file: FileId, data: &[u8]) {
        let key = TransferKey::new(peer, file);
        let received = data.len() as u64;
        let taken = {
            let mut state = self.shared.state();
            let Some(record) = state.live.get_mut(&key) else {
                debug!(%key, len = data.len(), "data for unknown or finished transfer ignored");
                return;
            };
            if record.direction != Direction::Receiving {
                debug!(%key, "data for an outbound transfer ignored");
                return;
            }
            if !matches!(
                record.status,
                TransferStatus::Accepted | TransferStatus::Transferring
            ) {
                debug!(%key, status = %record.status, "data before accept ignored");
                return;
            }

            let remaining = record.bytes_remaining;
            if received > remaining {
                Err((
                    record.id,
                    TransferError::Overrun {
                        received,
                        remaining,
                    },
                ))
            } else {
                match record.take_sink() {
                    Some(sink) => Ok((record.id, sink)),
                    None => Err((record.id, TransferError::NoStream(key))),
                }
            }
        };

        let (id, sink) = match taken {
            Ok(taken) => taken,
            Err((id, e)) => return self.fail_inbound(key, id, e).await,
        };
        let sink = match sink.append(data.to_vec()).await {
            Ok(sink) => sink,
            Err(e) => return self.fail_inbound(key, id, e).await,
        };

        let updated = {
            let mut state = self.shared.state();
            state.live_matching(key, id).map(|record| {
                record.put_sink(sink);
                record.bytes_remaining -= received;
                let changed = record
                    .advance(TransferStatus::Transferring)
                    .then(|| record.snapshot());
                (changed, progress_event(record))
            })
        };
        let Some((changed, progress)) = updated else {
            debug!(%key, "transfer ended while a chunk was being written");
            return;
        };

        if let Some(snapshot) = changed {
            self.shared.emit(TransferEvent::StatusChanged(snapshot));
        }
        self.check_remaining_hint(key, &progress);
        self.shared.emit(progress);
    }

    async fn fail_inbound(&self, key: TransferKey, id: TransferId, error: TransferError) {
        warn!(%key, error = %error, "failed to store inbound chunk");
        if self
            .terminate(key, Some(id), TransferStatus::Failed, Some(error.to_string()))
            .await
        {
            self.send_kill(key, Direction::Receiving);
        }
    }

    /// Removes a terminal record after the UI has acknowledged it.
    pub fn dismiss(&self, id: TransferId) -> Option<TransferSnapshot> {
        let mut state = self.shared.state();
        let index = state.finished.iter().position(|r| r.id == id)?;
        let record = state.finished.remove(index);
        debug!(%id, key = %record.key, "transfer dismissed");
        Some(record.snapshot())
    }

    /// Kills every live transfer and joins every worker.
    pub async fn shutdown(&self) {
        let live: Vec<(TransferKey, TransferId, Direction)> = self
            .shared
            .state()
            .live
            .values()
            .map(|r| (r.key, r.id, r.direction))
            .collect();
        if live.is_empty() {
            return;
        }

        info!(count = live.len(), "stopping live transfers");
        for (key, id, direction) in live {
            if self
                .terminate(key, Some(id), TransferStatus::Killed, None)
                .await
                && self.shared.transport.is_peer_online(key.peer)
            {
                self.send_kill(key, direction);
            }
        }
    }

    /// Snapshot of the live record for `key`.
    pub fn snapshot(&self, key: TransferKey) -> Option<TransferSnapshot> {
        self.shared.state().live.get(&key).map(TransferRecord::snapshot)
    }

    /// Snapshot of any record, live or finished.
    pub fn snapshot_by_id(&self, id: TransferId) -> Option<TransferSnapshot> {
        let state = self.shared.state();
        state
            .live
            .values()
            .chain(state.finished.iter())
            .find(|r| r.id == id)
            .map(TransferRecord::snapshot)
    }

    /// All records, ordered by creation.
    pub fn snapshots(&self) -> Vec<TransferSnapshot> {
        let state = self.shared.state();
        let mut all: Vec<_> = state
            .live
            .values()
            .chain(state.finished.iter())
            .map(TransferRecord::snapshot)
            .collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn live_count(&self) -> usize {
        self.shared.state().live.len()
    }

    // -----------------------------------------------------------------------
    // internals
    // -----------------------------------------------------------------------

    fn live_identity(&self, key: TransferKey) -> Option<(TransferId, Direction)> {
        self.shared
            .state()
            .live
            .get(&key)
            .map(|r| (r.id, r.direction))
    }

    /// Retires the record and stops whatever it owned.
    async fn terminate(
        &self,
        key: TransferKey,
        id: Option<TransferId>,
        status: TransferStatus,
        error: Option<String>,
    ) -> bool {
        let Some((released, snapshot)) = self.shared.state().retire(key, id, status, error) else {
            return false;
        };
        stop_released(key, released, self.shared.cancel_grace).await;
        debug!(%key, %status, "transfer record retired");
        self.shared.emit(TransferEvent::StatusChanged(snapshot));
        true
    }

    fn send_kill(&self, key: TransferKey, direction: Direction) {
        let frame = ControlFrame::from_local(direction, ControlSignal::Kill);
        if let Err(e) = self
            .shared
            .transport
            .send_control(key.peer, key.file, frame)
        {
            warn!(%key, error = %e, "failed to send kill");
        }
    }

    /// Peer accepted our offer: hand the source to a new worker.
    fn start_worker(&self, key: TransferKey, id: TransferId) {
        let snapshots = {
            let mut state = self.shared.state();
            let Some(record) = state.live_matching(key, id) else {
                return;
            };
            if !record.advance(TransferStatus::Accepted) {
                debug!(%key, status = %record.status, "duplicate accept ignored");
                return;
            }
            let accepted = record.snapshot();
            let Some(source) = record.take_source() else {
                warn!(%key, "accepted outbound transfer has no source");
                drop(state);
                self.shared
                    .fail_from_worker(key, id, &TransferError::NoStream(key));
                return;
            };

            let cancel = CancellationToken::new();
            let worker = TransferWorker::new(
                Arc::clone(&self.shared),
                key,
                id,
                record.total_size,
                source,
                cancel.clone(),
            );
            let join = tokio::spawn(worker.run());
            record.worker = Some(WorkerHandle { cancel, join });
            record.advance(TransferStatus::Transferring);
            [accepted, record.snapshot()]
        };

        info!(%key, "peer accepted, streaming");
        for snapshot in snapshots {
            self.shared.emit(TransferEvent::StatusChanged(snapshot));
        }
    }

    /// Peer confirmed it has every byte of an outbound transfer.
    async fn confirm_outbound(&self, key: TransferKey, id: TransferId) {
        let remaining = self
            .shared
            .state()
            .live_matching(key, id)
            .map(|r| r.bytes_remaining);
        match remaining {
            Some(0) => {
                if self
                    .terminate(key, Some(id), TransferStatus::Finished, None)
                    .await
                {
                    info!(%key, "outbound transfer finished");
                }
            }
            Some(remaining) => {
                warn!(%key, remaining, "peer reported finished before all bytes were sent, ignored");
            }
            None => {}
        }
    }

    /// Sender says it is done: close the sink and acknowledge.
    async fn complete_inbound(&self, key: TransferKey, id: TransferId) {
        let outcome = {
            let mut state = self.shared.state();
            let Some(record) = state.live_matching(key, id) else {
                return;
            };
            if record.bytes_remaining > 0 {
                Err(format!(
                    "sender finished with {} bytes outstanding",
                    record.bytes_remaining
                ))
            } else {
                record
                    .take_sink()
                    .ok_or_else(|| TransferError::NoStream(key).to_string())
            }
        };
        let outcome = match outcome {
            Ok(sink) => sink.finish().await.map(|_| ()).map_err(|e| e.to_string()),
            Err(reason) => Err(reason),
        };

        match outcome {
            Ok(()) => {
                if self
                    .terminate(key, Some(id), TransferStatus::Finished, None)
                    .await
                {
                    info!(%key, "inbound transfer finished");
                    let ack = ControlFrame::from_local(Direction::Receiving, ControlSignal::Finished);
                    if let Err(e) = self.shared.transport.send_control(key.peer, key.file, ack) {
                        warn!(%key, error = %e, "failed to acknowledge finished transfer");
                    }
                }
            }
            Err(reason) => {
                warn!(%key, %reason, "inbound transfer incomplete");
                self.terminate(key, Some(id), TransferStatus::Failed, Some(reason))
                    .await;
            }
        }
    }

    fn check_remaining_hint(&self, key: TransferKey, progress: &TransferEvent) {
        let TransferEvent::Progress {
            transferred, total, ..
        } = progress
        else {
            return;
        };
        if let Some(hint) = self.shared.transport.remaining_hint(key.peer, key.file) {
            let remaining = total - transferred;
            if hint != remaining {
                debug!(%key, hint, remaining, "transport remaining hint disagrees");
            }
        }
    }
}
