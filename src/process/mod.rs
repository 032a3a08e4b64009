//! Child process lifecycle.
//!
//! - `stderr`: bounded, line-oriented stderr capture.
//! - `supervisor`: spawn, exit watching, graceful/forced termination.

pub mod stderr;
pub mod supervisor;

pub use stderr::StderrBuffer;
pub use supervisor::{ExitState, ProcessSupervisor, SpawnedProcess};
