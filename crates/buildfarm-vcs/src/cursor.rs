//! Last-seen revision cursors, persisted between polls.

use std::collections::HashMap;
use std::path::PathBuf;

use buildfarm_core::{Error, Result};

/// On-disk map of project -> branch -> last delivered revision.
///
/// Written only after a poll's events have been handed downstream, so
/// a crash between delivery and persist re-emits the tail instead of
/// dropping it. Downstream handling is idempotent to compensate.
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    cursors: HashMap<String, HashMap<String, String>>,
}

impl CursorStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cursors = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| Error::Internal(format!("corrupt cursor file {path:?}: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, cursors })
    }

    pub fn get(&self, project: &str, branch: &str) -> Option<&str> {
        self.cursors
            .get(project)
            .and_then(|branches| branches.get(branch))
            .map(String::as_str)
    }

    /// Record `revision` as delivered and persist atomically.
    pub fn advance(&mut self, project: &str, branch: &str, revision: &str) -> Result<()> {
        self.cursors
            .entry(project.to_string())
            .or_default()
            .insert(branch.to_string(), revision.to_string());
        let text = serde_json::to_string_pretty(&self.cursors)
            .map_err(|e| Error::Internal(format!("encode cursors: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
