//! A peer session: one inbound event stream, one transfer registry, one
//! avatar engine.
//!
//! [`Session::run`] consumes [`InboundEvent`]s in delivery order and routes
//! each to the component that owns it. The presentation layer drives the
//! outbound side (send, accept, decline, avatar changes) through the same
//! [`Session`].
//!
//! [`InboundEvent`]: peerline_protocol::InboundEvent

pub mod config;
pub mod error;
pub mod logging;
pub mod loopback;
mod session;

pub use config::SessionConfig;
pub use error::SessionError;
pub use loopback::{LoopbackConfig, LoopbackEnd, LoopbackTransport};
pub use session::Session;
