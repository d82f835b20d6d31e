//! Artifact resolution and publication.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use url::Url;

use buildfarm_core::build::Artifact;
use buildfarm_core::{Error, Result};

/// Resolve `pattern` (relative to `workdir`) to exactly one file.
///
/// Multiple stale artifacts from prior runs may coexist in a shared
/// working directory, so candidates are ordered newest-first by
/// modification time and anything with "debuginfo" in its path is
/// ignored. The newest survivor wins; an empty survivor list is
/// [`Error::NoArtifact`], which halts the run.
pub fn locate(workdir: &Path, pattern: &str) -> Result<PathBuf> {
    let full = workdir.join(pattern);
    let matches = glob::glob(&full.to_string_lossy())
        .map_err(|e| Error::Internal(format!("bad artifact pattern '{pattern}': {e}")))?;

    let mut candidates: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in matches {
        let Ok(path) = entry else { continue };
        if path.to_string_lossy().contains("debuginfo") {
            continue;
        }
        // Entries that vanish between glob and stat are stale noise.
        let Ok(modified) = std::fs::metadata(&path).and_then(|m| m.modified()) else {
            continue;
        };
        candidates.push((modified, path));
    }

    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates
        .into_iter()
        .map(|(_, path)| path)
        .next()
        .ok_or_else(|| Error::NoArtifact(pattern.to_string()))
}

/// Copy a located artifact into `<upload_base>/<channel>/` and return
/// its destination path plus the public URL
/// `<upload_url>/<channel>/<filename>`. The mapping is part of the
/// farm's external contract.
pub async fn publish(
    artifact: &Path,
    upload_base: &Path,
    upload_url: &Url,
    channel: &str,
) -> Result<Artifact> {
    let filename = artifact
        .file_name()
        .ok_or_else(|| Error::Internal(format!("artifact path '{}' has no filename", artifact.display())))?
        .to_string_lossy()
        .into_owned();

    let dest_dir = upload_base.join(channel);
    tokio::fs::create_dir_all(&dest_dir).await?;
    let dest = dest_dir.join(&filename);
    tokio::fs::copy(artifact, &dest).await?;

    let url = format!(
        "{}/{}/{}",
        upload_url.as_str().trim_end_matches('/'),
        channel,
        filename
    );
    Ok(Artifact { path: dest, url })
}
