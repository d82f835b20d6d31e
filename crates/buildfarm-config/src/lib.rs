//! KDL configuration parsing for the buildfarm coordinator.
//!
//! A farm is described by one `farm.kdl` document (workers, locks,
//! change sources, builders with their step sequences, schedulers)
//! plus an optional credentials document it names. The two are merged
//! into a single immutable [`FarmConfig`] value at load time;
//! reconfiguration builds a fresh value and swaps it in, never
//! mutating the old one.

pub mod error;
pub mod farm;
mod parse;

pub use error::{ConfigError, ConfigResult};
pub use farm::{FarmConfig, SchedulerConfig, SchedulerKind, SourceConfig};
