//! Avatar synchronisation.
//!
//! Peers advertise the hash of their current avatar; bytes only travel when
//! the advertised hash differs from what we already hold. The local avatar
//! and every peer's cached avatar are persisted as plain files.

pub mod decode;
pub mod engine;
pub mod error;
pub mod store;

pub use decode::{DecodeError, ImageDecoder, ImageInfo, PngDecoder, placeholder_png};
pub use engine::{AvatarEntry, AvatarEvent, AvatarSyncEngine};
pub use error::AvatarError;
pub use store::AvatarStore;
