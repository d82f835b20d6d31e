//! Change detection: repository pollers and their persisted cursors.

pub mod cursor;
pub mod git;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use buildfarm_core::Result;
use buildfarm_core::change::ChangeEvent;

pub use cursor::CursorStore;
pub use git::GitPoller;

/// A watched repository that can report new revisions.
#[async_trait]
pub trait ChangeSource: Send {
    /// Project key changes from this source are tagged with.
    fn project(&self) -> &str;

    /// How often to poll.
    fn interval(&self) -> Duration;

    /// Fetch upstream and return revisions not seen before, oldest
    /// first. Empty when nothing changed.
    async fn poll(&mut self) -> Result<Vec<ChangeEvent>>;

    /// Record that everything up to `revision` has been delivered
    /// downstream. Until this is called, the same revisions may be
    /// returned again by a later poll (at-least-once delivery).
    async fn commit(&mut self, revision: &str) -> Result<()>;
}

/// Drive one source on its interval, fanning events out to schedulers.
///
/// The cursor is committed per event, after the send: a crash between
/// the two re-emits that revision on restart rather than losing it.
/// Poll failures are logged and retried next tick, never fatal.
pub async fn run_poller<S: ChangeSource>(mut source: S, tx: broadcast::Sender<ChangeEvent>) {
    let mut ticker = tokio::time::interval(source.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match source.poll().await {
            Ok(events) => {
                for event in events {
                    let revision = event.revision.clone();
                    // A send error just means no scheduler is listening.
                    let _ = tx.send(event);
                    if let Err(error) = source.commit(&revision).await {
                        warn!(project = %source.project(), %error, "failed to persist cursor");
                    }
                }
            }
            Err(error) => {
                warn!(project = %source.project(), %error, "poll failed");
            }
        }
    }
}
