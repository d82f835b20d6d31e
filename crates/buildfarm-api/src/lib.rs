//! HTTP surface of the coordinator.
//!
//! Start/stop/reconfigure is all the process offers beyond this:
//! force-build, status queries, stop-build, and reload. No UI, no
//! authentication; put it behind something that has both.

pub mod error;
mod routes;
mod state;

pub use routes::router;
pub use state::AppState;
