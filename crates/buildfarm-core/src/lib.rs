//! Core domain types for the buildfarm coordinator.
//!
//! This crate defines the vocabulary shared by every other crate:
//! change events, builder and worker definitions, build requests and
//! runs, step sequences, the error taxonomy, and the [`runner`]
//! execution seam the coordinator drives workers through.

pub mod build;
pub mod builder;
pub mod change;
pub mod error;
pub mod id;
pub mod runner;
pub mod step;
pub mod worker;

pub use error::{Error, Result};
pub use id::BuildId;
