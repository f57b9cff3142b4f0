//! Shared vocabulary for the peerline transfer engine.
//!
//! Everything the transfer registry, the avatar engine and the session
//! dispatcher exchange lives here: peer and file identifiers, the two-byte
//! control frame, content hashes, the typed inbound event stream, and the
//! [`Transport`] capability the engine is driven through.

pub mod constants;
pub mod control;
pub mod events;
pub mod transport;
pub mod types;

// Re-export primary types for convenience.
pub use control::{ControlFrame, ControlSignal, Direction};
pub use events::InboundEvent;
pub use transport::{SendOutcome, Transport, TransportError};
pub use types::{ContentHash, FileId, HashParseError, PeerId, TransferKey};
