use peerline_protocol::{PeerId, TransportError};

use crate::decode::DecodeError;

/// Errors produced by the avatar crate.
#[derive(Debug, thiserror::Error)]
pub enum AvatarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("avatar is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("invalid image: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid stable id: {0:?}")]
    InvalidStableId(String),

    #[error("no stable id for {0}")]
    NoStableId(PeerId),
}
