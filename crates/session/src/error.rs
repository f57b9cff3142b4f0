use peerline_avatar::AvatarError;
use peerline_protocol::{TransferKey, TransportError};
use peerline_transfer::{TransferError, TransferStatus};

/// Errors produced by the session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("avatar error: {0}")]
    Avatar(#[from] AvatarError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no live transfer {0}")]
    UnknownTransfer(TransferKey),

    #[error("transfer {key} is {status}, not awaiting acceptance")]
    NotAwaitingAcceptance {
        key: TransferKey,
        status: TransferStatus,
    },

    #[error("config directory not available")]
    NoConfigDir,

    #[error("invalid file path: {0}")]
    InvalidPath(String),
}
