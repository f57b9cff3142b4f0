//! Chunked file transfers between peers.
//!
//! A [`TransferRegistry`] owns every live transfer record. Outbound
//! transfers stream through a background worker that retries refused
//! chunks; inbound transfers are written as data events arrive. Both
//! directions are driven by the per-transfer control frames from
//! [`peerline_protocol::control`].

mod chunked;
mod record;
mod registry;
mod types;
mod validation;
mod worker;

#[cfg(test)]
mod testing;

pub use chunked::{ChunkSink, ChunkSource, StreamOrigin};
pub use record::TransferRecord;
pub use registry::{RegistryConfig, TransferRegistry};
pub use types::{TransferEvent, TransferId, TransferSnapshot, TransferStatus, progress_percent};
pub use validation::{destination_for, validate_offer_name};

use peerline_protocol::{Direction, TransferKey, TransportError};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("transfer {0} is already active")]
    DuplicateTransfer(TransferKey),

    #[error("transfer {key} is {actual}, expected {expected}")]
    WrongDirection {
        key: TransferKey,
        expected: Direction,
        actual: Direction,
    },

    #[error("source ended with {remaining} bytes still to send")]
    SourceExhausted { remaining: u64 },

    #[error("peer sent {received} bytes with only {remaining} outstanding")]
    Overrun { received: u64, remaining: u64 },

    #[error("transfer {0} has no open stream")]
    NoStream(TransferKey),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
