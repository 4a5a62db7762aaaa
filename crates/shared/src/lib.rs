//! Shared wire types for the draftsync real-time layer.
//!
//! The push-event collaborator on the server produces [`EventEnvelope`]s;
//! the client crate consumes them.

pub mod error;
pub mod protocol;

pub use error::*;
pub use protocol::*;
