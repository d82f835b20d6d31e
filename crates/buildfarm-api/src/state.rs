//! Application state.

use std::path::PathBuf;

use buildfarm_dispatch::DispatcherHandle;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: DispatcherHandle,
    /// Where the configuration was loaded from; reload re-reads it.
    pub config_path: PathBuf,
}

impl AppState {
    pub fn new(dispatcher: DispatcherHandle, config_path: impl Into<PathBuf>) -> Self {
        Self {
            dispatcher,
            config_path: config_path.into(),
        }
    }
}
