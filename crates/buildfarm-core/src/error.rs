//! Error types for the buildfarm coordinator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A source checkout failed in a way worth retrying.
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    /// A step command exited non-zero.
    #[error("step '{step}' failed")]
    StepFailed {
        step: String,
        exit_code: Option<i32>,
    },

    /// An artifact glob matched nothing usable. Always halting.
    #[error("no artifact matched '{0}'")]
    NoArtifact(String),

    #[error("unknown builder: {0}")]
    UnknownBuilder(String),

    #[error("unknown build: {0}")]
    UnknownBuild(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("build aborted")]
    Aborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
