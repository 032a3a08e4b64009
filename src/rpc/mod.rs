//! Request/response multiplexing over a transport.
//!
//! - `correlator`: pending-call table keyed by correlation identifier.
//! - `connection`: inbound pump, routing and the caller-facing API.

pub mod connection;
pub mod correlator;

pub use connection::{Connection, ConnectionSettings};
pub use correlator::{Correlator, PendingReply, Routed};
