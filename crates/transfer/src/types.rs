use std::fmt;

use serde::{Deserialize, Serialize};

use peerline_protocol::{Direction, TransferKey};

/// Local, never-reused identifier of a transfer record.
///
/// Transport file ids may be recycled once a transfer ends; this one is
/// not, so finished records can still be addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer#{}", self.0)
    }
}

/// Lifecycle of a transfer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Offered,
    Accepted,
    Transferring,
    Finished,
    Killed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Finished | TransferStatus::Killed | TransferStatus::Failed
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_become(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Offered, Accepted) => true,
            (Accepted, Transferring | Finished) => true,
            (Transferring, Finished) => true,
            (from, Killed | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Offered => "offered",
            TransferStatus::Accepted => "accepted",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Finished => "finished",
            TransferStatus::Killed => "killed",
            TransferStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a transfer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub key: TransferKey,
    pub direction: Direction,
    pub file_name: String,
    pub total_size: u64,
    pub bytes_remaining: u64,
    pub status: TransferStatus,
    pub percent: u8,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferSnapshot {
    pub fn transferred(&self) -> u64 {
        self.total_size - self.bytes_remaining
    }
}

/// Notifications raised by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A record was created or changed status.
    StatusChanged(TransferSnapshot),
    /// Bytes moved on a record.
    Progress {
        id: TransferId,
        key: TransferKey,
        direction: Direction,
        transferred: u64,
        total: u64,
        percent: u8,
    },
}

/// Integer completion percentage: `100 - floor(100 * remaining / total)`.
///
/// An empty transfer counts as complete.
pub fn progress_percent(remaining: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let remaining = u128::from(remaining.min(total));
    let pending = remaining * 100 / u128::from(total);
    (100 - pending) as u8
}
