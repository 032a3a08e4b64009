#![forbid(unsafe_code)]

//! Client-side transport and message-stream runtime for a coding-assistant
//! peer, reachable either as a local child process (NDJSON over stdio) or as
//! a remote JSON-RPC service over HTTP.

pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod process;
pub mod protocol;
pub mod rpc;
pub mod transport;

pub use client::{query, AgentClient};
pub use config::ConduitConfig;
pub use errors::{ErrorCategory, Result, SdkError};
