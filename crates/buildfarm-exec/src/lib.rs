//! Command runner implementations.
//!
//! The coordinator drives workers exclusively through the
//! [`CommandRunner`] seam; this crate provides the process-based
//! implementation used by the daemon.

mod local;

pub use buildfarm_core::runner::{CommandOutcome, CommandRunner, CommandSpec};
pub use local::LocalRunner;
