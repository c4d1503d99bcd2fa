use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;

use crate::snapshot::SnapshotDiff;

/// How a reconciliation attempt ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Not attempted: synced recently, or another pass was already running.
    Skipped,
    Succeeded,
    /// The remote could not provide a snapshot; the local store was left as it was.
    Failed,
}

/// Emitted once for every reconciliation attempt.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncEvent {
    pub status: SyncStatus,
    pub forced: bool,
    pub duration: Duration,
    /// Number of features installed; only set on success.
    pub feature_count: Option<usize>,
    /// What the installed snapshot changed; only set on success.
    pub diff: Option<SnapshotDiff>,
    pub error: Option<String>,
}

/// Trait used by the synchronizer to report every reconciliation attempt.
///
/// Recording is never required for correctness; implementations should return quickly since
/// they run on the thread that triggered the reconciliation.
pub trait Instrumenter: Send + Sync {
    /// Record the outcome of one reconciliation attempt.
    fn record(&self, event: SyncEvent);
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopInstrumenter;

impl Instrumenter for NoopInstrumenter {
    fn record(&self, _event: SyncEvent) {}
}

/// Writes every event to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogInstrumenter;

impl Instrumenter for LogInstrumenter {
    fn record(&self, event: SyncEvent) {
        match event.status {
            SyncStatus::Failed => warn!(
                "sync failed after {:?}: {}",
                event.duration,
                event.error.as_deref().unwrap_or("unknown error")
            ),
            SyncStatus::Succeeded => debug!(
                "sync succeeded in {:?} with {} features",
                event.duration,
                event.feature_count.unwrap_or_default()
            ),
            SyncStatus::Skipped => debug!("sync skipped"),
        }
    }
}
