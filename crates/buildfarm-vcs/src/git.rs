//! Polling git change source.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use buildfarm_core::change::ChangeEvent;
use buildfarm_core::{Error, Result};

use crate::ChangeSource;
use crate::cursor::CursorStore;

// Unit-separator-delimited: sha, author, unix timestamp, subject.
const LOG_FORMAT: &str = "%H%x1f%an <%ae>%x1f%at%x1f%s";

/// Polls one branch of one git repository by fetching into a local
/// mirror under the state directory.
#[derive(Debug)]
pub struct GitPoller {
    project: String,
    url: Url,
    branch: String,
    interval: Duration,
    workdir: PathBuf,
    store: CursorStore,
}

impl GitPoller {
    /// Create a poller. Mirrors and cursors live under `state_dir`.
    pub fn new(
        project: impl Into<String>,
        url: Url,
        branch: impl Into<String>,
        interval: Duration,
        state_dir: &Path,
    ) -> Result<Self> {
        let project = project.into();
        let store = CursorStore::open(state_dir.join(format!("gitpoller_{project}.json")))?;
        Ok(Self {
            workdir: state_dir.join(format!("gitpoller_{project}")),
            project,
            url,
            branch: branch.into(),
            interval,
            store,
        })
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let out = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await?;
        if !out.status.success() {
            return Err(Error::TransientFetch(format!(
                "git {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    async fn ensure_mirror(&self) -> Result<()> {
        if !self.workdir.join(".git").exists() {
            tokio::fs::create_dir_all(&self.workdir).await?;
            self.git(&["init", "--quiet"]).await?;
        }
        Ok(())
    }

    fn change_from_log(&self, revision: String, line: &str) -> Result<ChangeEvent> {
        let (author, at, comment) = parse_log_line(line)
            .ok_or_else(|| Error::Internal(format!("unparseable git log line: {line:?}")))?;
        Ok(ChangeEvent {
            project: self.project.clone(),
            branch: self.branch.clone(),
            revision,
            author,
            comment,
            at,
        })
    }
}

#[async_trait]
impl ChangeSource for GitPoller {
    fn project(&self) -> &str {
        &self.project
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll(&mut self) -> Result<Vec<ChangeEvent>> {
        self.ensure_mirror().await?;
        self.git(&["fetch", "--quiet", self.url.as_str(), &self.branch])
            .await?;
        let head = self.git(&["rev-parse", "FETCH_HEAD"]).await?;

        let last = self.store.get(&self.project, &self.branch);
        if last == Some(head.as_str()) {
            return Ok(Vec::new());
        }

        let revisions: Vec<String> = match last {
            Some(last) => {
                let range = format!("{last}..FETCH_HEAD");
                match self.git(&["rev-list", "--reverse", &range]).await {
                    Ok(listing) => listing.lines().map(str::to_string).collect(),
                    // History rewritten out from under the cursor:
                    // restart from the new head.
                    Err(_) => vec![head.clone()],
                }
            }
            // First poll ever: report only the current head, not the
            // whole history.
            None => vec![head.clone()],
        };

        let mut events = Vec::with_capacity(revisions.len());
        for revision in revisions {
            let format = format!("--pretty=format:{LOG_FORMAT}");
            let line = self.git(&["log", "-1", &format, &revision]).await?;
            events.push(self.change_from_log(revision, &line)?);
        }
        Ok(events)
    }

    async fn commit(&mut self, revision: &str) -> Result<()> {
        self.store.advance(&self.project, &self.branch, revision)
    }
}

/// Split one `git log --pretty` line into (author, timestamp, subject).
fn parse_log_line(line: &str) -> Option<(String, DateTime<Utc>, String)> {
    let mut parts = line.split('\x1f');
    let _sha = parts.next()?;
    let author = parts.next()?.to_string();
    let at = DateTime::from_timestamp(parts.next()?.trim().parse().ok()?, 0)?;
    let comment = parts.next().unwrap_or("").to_string();
    Some((author, at, comment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_log_line() {
        let line = "deadbeef\x1fDavid <d@example.org>\x1f1700000000\x1fFix the moodbar";
        let (author, at, comment) = parse_log_line(line).unwrap();
        assert_eq!(author, "David <d@example.org>");
        assert_eq!(at.timestamp(), 1_700_000_000);
        assert_eq!(comment, "Fix the moodbar");
    }

    #[test]
    fn rejects_garbage_log_lines() {
        assert!(parse_log_line("").is_none());
        assert!(parse_log_line("sha\x1fauthor\x1fnot-a-timestamp\x1fsubject").is_none());
    }

    #[test]
    fn tolerates_empty_subject() {
        let line = "deadbeef\x1fA <a@b>\x1f1700000000\x1f";
        let (_, _, comment) = parse_log_line(line).unwrap();
        assert_eq!(comment, "");
    }
}
