//! Wire protocol: framing and message classification.
//!
//! - `framer`: newline framing over chunked byte streams.
//! - `message`: JSON-RPC / stream-json envelope classification and builders.

pub mod framer;
pub mod message;

pub use framer::{Framer, Frames, MAX_LINE_BYTES};
pub use message::{Message, RequestId, RpcError};
