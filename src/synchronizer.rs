use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::instrument::{Instrumenter, NoopInstrumenter, SyncEvent, SyncStatus};
use crate::snapshot::SnapshotDiff;
use crate::store::FlagStore;

/// Default minimum time between two unforced reconciliations.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Source of monotonic time for the interval guard.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The real monotonic clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Knobs shared by the composite stores when they build their synchronizer.
#[derive(Clone)]
pub struct SyncOptions {
    pub interval: Duration,
    pub instrumenter: Arc<dyn Instrumenter>,
    pub clock: Arc<dyn Clock>,
}

impl SyncOptions {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    pub fn instrumenter(mut self, instrumenter: Arc<dyn Instrumenter>) -> Self {
        self.instrumenter = instrumenter;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            instrumenter: Arc::new(NoopInstrumenter),
            clock: Arc::new(SystemClock),
        }
    }
}

/// The result of [Synchronizer::reconcile].
#[derive(Clone, Debug, PartialEq)]
pub enum SyncOutcome {
    /// Synced within the interval, or another reconciliation was in flight.
    Skipped,
    /// The remote snapshot was installed locally.
    Succeeded {
        feature_count: usize,
        diff: SnapshotDiff,
    },
    /// The remote failed; the local store still serves the previous snapshot.
    Failed(Error),
}

impl SyncOutcome {
    pub fn status(&self) -> SyncStatus {
        match self {
            SyncOutcome::Skipped => SyncStatus::Skipped,
            SyncOutcome::Succeeded { .. } => SyncStatus::Succeeded,
            SyncOutcome::Failed(_) => SyncStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Succeeded { .. })
    }
}

/// Brings a local store in line with a remote one.
///
/// At most one reconciliation runs at a time; callers that arrive while one is in flight are
/// told it was skipped instead of queuing behind it. Unforced calls are also skipped until the
/// interval has passed since the last attempt, successful or not, so remote traffic stays
/// bounded by the interval even while the remote is failing.
pub struct Synchronizer {
    local: Arc<dyn FlagStore>,
    remote: Arc<dyn FlagStore>,
    interval: Duration,
    instrumenter: Arc<dyn Instrumenter>,
    clock: Arc<dyn Clock>,
    last_synced_at: Mutex<Option<Instant>>,
    last_attempt_at: Mutex<Option<Instant>>,
    in_progress: AtomicBool,
}

// Clears the in-progress flag however the pass ends, including by panic.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Synchronizer {
    /// Fails if the interval is zero.
    pub fn new(
        local: Arc<dyn FlagStore>,
        remote: Arc<dyn FlagStore>,
        options: SyncOptions,
    ) -> Result<Self> {
        if options.interval.is_zero() {
            return Err(Error::Configuration(
                "sync interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            local,
            remote,
            interval: options.interval,
            instrumenter: options.instrumenter,
            clock: options.clock,
            last_synced_at: Mutex::new(None),
            last_attempt_at: Mutex::new(None),
            in_progress: AtomicBool::new(false),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When the last successful reconciliation finished, or `None` if none has.
    pub fn last_synced_at(&self) -> Option<Instant> {
        *self.last_synced_at.lock()
    }

    /// When the last remote fetch started, whatever its outcome.
    pub fn last_attempt_at(&self) -> Option<Instant> {
        *self.last_attempt_at.lock()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn is_due(&self, now: Instant) -> bool {
        match *self.last_attempt_at.lock() {
            Some(at) => now.saturating_duration_since(at) >= self.interval,
            None => true,
        }
    }

    /// Run one reconciliation pass.
    ///
    /// Remote failures are absorbed and reported as [SyncOutcome::Failed]. Only a failure of the
    /// local store while installing the snapshot is returned as an error.
    pub fn reconcile(&self, force: bool) -> Result<SyncOutcome> {
        let started = self.clock.now();

        if !force && !self.is_due(started) {
            return Ok(self.finish(force, started, SyncOutcome::Skipped));
        }

        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync already in progress, skipping");
            return Ok(self.finish(force, started, SyncOutcome::Skipped));
        }
        let _guard = InProgress(&self.in_progress);

        // another caller may have started a pass between the first check and taking the flag
        if !force && !self.is_due(self.clock.now()) {
            return Ok(self.finish(force, started, SyncOutcome::Skipped));
        }
        *self.last_attempt_at.lock() = Some(self.clock.now());

        let snapshot = match self.remote.get_all() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    "unable to fetch snapshot from {}, keeping local state: {}",
                    self.remote.name(),
                    e
                );
                return Ok(self.finish(force, started, SyncOutcome::Failed(e)));
            }
        };

        let previous = match self.local.get_all() {
            Ok(previous) => previous,
            Err(e) => return Err(self.fail_local(force, started, e)),
        };
        let diff = previous.diff(&snapshot);

        if let Err(e) = self.local.import(&snapshot) {
            return Err(self.fail_local(force, started, e));
        }

        *self.last_synced_at.lock() = Some(self.clock.now());

        if !diff.is_empty() {
            info!("synced {} from {}: {}", self.local.name(), self.remote.name(), diff);
        }

        let outcome = SyncOutcome::Succeeded {
            feature_count: snapshot.len(),
            diff,
        };
        Ok(self.finish(force, started, outcome))
    }

    fn fail_local(&self, force: bool, started: Instant, e: Error) -> Error {
        let e = match e {
            Error::Storage(_) => e,
            other => Error::Storage(other.to_string()),
        };
        warn!("unable to install snapshot into {}: {}", self.local.name(), e);
        self.finish(force, started, SyncOutcome::Failed(e.clone()));
        e
    }

    fn finish(&self, force: bool, started: Instant, outcome: SyncOutcome) -> SyncOutcome {
        let (feature_count, diff, error) = match &outcome {
            SyncOutcome::Succeeded {
                feature_count,
                diff,
            } => (Some(*feature_count), Some(diff.clone()), None),
            SyncOutcome::Failed(e) => (None, None, Some(e.to_string())),
            SyncOutcome::Skipped => (None, None, None),
        };
        self.instrumenter.record(SyncEvent {
            status: outcome.status(),
            forced: force,
            duration: self.clock.now().saturating_duration_since(started),
            feature_count,
            diff,
            error,
        });
        outcome
    }
}

/// Handle to a background thread that periodically reconciles.
///
/// The thread stops when [Poller::stop] is called or the handle is dropped.
pub struct Poller {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Starts a thread calling `tick` every `period` until stopped.
    pub(crate) fn spawn<F>(name: &str, period: Duration, mut tick: F) -> Result<Poller>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| Error::Configuration(format!("unable to start poller thread: {}", e)))?;

        Ok(Poller {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for an in-flight tick to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("poller thread panicked");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::test_common::{
        features_snapshot, search_and_history, FailingStore, ManualClock, RecordingInstrumenter,
        TestRemote,
    };
    use spectral::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    struct Fixture {
        local: Arc<MemoryStore>,
        remote: Arc<TestRemote>,
        clock: Arc<ManualClock>,
        events: Arc<RecordingInstrumenter>,
        synchronizer: Synchronizer,
    }

    fn fixture(interval: Duration) -> Fixture {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(TestRemote::new(search_and_history()));
        let clock = Arc::new(ManualClock::new());
        let events = Arc::new(RecordingInstrumenter::default());
        let synchronizer = Synchronizer::new(
            local.clone(),
            remote.clone(),
            SyncOptions::with_interval(interval)
                .clock(clock.clone())
                .instrumenter(events.clone()),
        )
        .unwrap();
        Fixture {
            local,
            remote,
            clock,
            events,
            synchronizer,
        }
    }

    #[test]
    fn zero_interval_is_rejected() {
        let result = Synchronizer::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            SyncOptions::with_interval(Duration::ZERO),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn first_reconcile_installs_remote_snapshot() {
        let f = fixture(Duration::from_secs(10));
        assert_that!(f.synchronizer.last_synced_at()).is_none();

        let outcome = f.synchronizer.reconcile(false).unwrap();

        assert!(outcome.is_success());
        assert_that!(f.local.get_all().unwrap()).is_equal_to(search_and_history());
        assert_that!(f.synchronizer.last_synced_at()).is_some();
        assert_that!(f.remote.fetches()).is_equal_to(1);
    }

    #[test]
    fn unforced_reconcile_within_interval_is_skipped() {
        let f = fixture(Duration::from_secs(10));
        f.synchronizer.reconcile(false).unwrap();
        f.clock.advance(Duration::from_secs(9));

        let outcome = f.synchronizer.reconcile(false).unwrap();

        assert_that!(outcome).is_equal_to(SyncOutcome::Skipped);
        assert_that!(f.remote.fetches()).is_equal_to(1);

        f.clock.advance(Duration::from_secs(1));
        assert!(f.synchronizer.reconcile(false).unwrap().is_success());
        assert_that!(f.remote.fetches()).is_equal_to(2);
    }

    #[test]
    fn forced_reconcile_ignores_interval() {
        let f = fixture(Duration::from_secs(10));
        f.synchronizer.reconcile(false).unwrap();
        assert!(f.synchronizer.reconcile(true).unwrap().is_success());
        assert_that!(f.remote.fetches()).is_equal_to(2);
    }

    #[test]
    fn remote_failure_keeps_local_state() {
        let f = fixture(Duration::from_secs(10));
        f.synchronizer.reconcile(true).unwrap();
        let synced_at = f.synchronizer.last_synced_at();

        f.remote.fail_with(Error::unreachable("get_all", "connection refused"));
        f.remote.set_snapshot(features_snapshot(&["billing"]));
        f.clock.advance(Duration::from_secs(30));

        let outcome = f.synchronizer.reconcile(false).unwrap();

        assert_that!(outcome.status()).is_equal_to(SyncStatus::Failed);
        assert_that!(f.local.get_all().unwrap()).is_equal_to(search_and_history());
        assert_that!(f.synchronizer.last_synced_at()).is_equal_to(synced_at);
        assert!(!f.synchronizer.is_in_progress());
    }

    #[test]
    fn failed_reconcile_retries_after_interval() {
        let f = fixture(Duration::from_secs(10));
        f.remote.fail_with(Error::UnexpectedStatus {
            operation: "get_all".into(),
            status: 503,
        });
        assert_that!(f.synchronizer.reconcile(false).unwrap().status())
            .is_equal_to(SyncStatus::Failed);
        assert_that!(f.synchronizer.last_synced_at()).is_none();
        assert_that!(f.synchronizer.last_attempt_at()).is_some();

        f.remote.recover();
        assert_that!(f.synchronizer.reconcile(false).unwrap()).is_equal_to(SyncOutcome::Skipped);
        assert_that!(f.remote.fetches()).is_equal_to(1);

        f.clock.advance(Duration::from_secs(10));
        assert!(f.synchronizer.reconcile(false).unwrap().is_success());
        assert_that!(f.remote.fetches()).is_equal_to(2);
    }

    #[test]
    fn forced_reconcile_ignores_failed_attempt() {
        let f = fixture(Duration::from_secs(10));
        f.remote.fail_with(Error::unreachable("get_all", "connection refused"));
        f.synchronizer.reconcile(false).unwrap();

        f.remote.recover();
        assert!(f.synchronizer.reconcile(true).unwrap().is_success());
    }

    #[test]
    fn removed_features_disappear_locally() {
        let f = fixture(Duration::from_secs(10));
        f.synchronizer.reconcile(true).unwrap();
        f.remote.set_snapshot(features_snapshot(&["search"]));

        let outcome = f.synchronizer.reconcile(true).unwrap();

        assert_that!(f.local.features().unwrap()).is_equal_to(vec!["search".to_string()]);
        match outcome {
            SyncOutcome::Succeeded {
                feature_count,
                diff,
            } => {
                assert_that!(feature_count).is_equal_to(1);
                assert_that!(diff.removed).is_equal_to(vec!["history".to_string()]);
                assert_that!(diff.updated).has_length(0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn local_storage_failure_is_propagated() {
        let remote = Arc::new(TestRemote::new(search_and_history()));
        let synchronizer = Synchronizer::new(
            Arc::new(FailingStore),
            remote,
            SyncOptions::default(),
        )
        .unwrap();

        let result = synchronizer.reconcile(true);

        assert!(matches!(result, Err(Error::Storage(_))));
        assert_that!(synchronizer.last_synced_at()).is_none();
        assert!(!synchronizer.is_in_progress());
    }

    #[test]
    fn every_attempt_is_instrumented() {
        let f = fixture(Duration::from_secs(10));
        f.synchronizer.reconcile(false).unwrap();
        f.synchronizer.reconcile(false).unwrap();
        f.remote.fail_with(Error::unreachable("get_all", "timed out"));
        f.synchronizer.reconcile(true).unwrap();

        let events = f.events.events();
        let statuses: Vec<_> = events.iter().map(|e| e.status).collect();
        assert_that!(statuses).is_equal_to(vec![
            SyncStatus::Succeeded,
            SyncStatus::Skipped,
            SyncStatus::Failed,
        ]);
        assert_that!(events[0].feature_count).is_equal_to(Some(2));
        assert_that!(events[0].diff.as_ref().map(|d| d.added.len())).is_equal_to(Some(2));
        assert_that!(events[2].error.as_deref().unwrap_or_default()).contains("timed out");
        assert!(events[2].forced);
    }

    #[test]
    fn concurrent_reconciles_coalesce() {
        let f = fixture(Duration::from_secs(10));
        let synchronizer = Arc::new(f.synchronizer);
        let gate = f.remote.block_fetches();

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let succeeded = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let synchronizer = Arc::clone(&synchronizer);
                let barrier = Arc::clone(&barrier);
                let succeeded = Arc::clone(&succeeded);
                thread::spawn(move || {
                    barrier.wait();
                    if synchronizer.reconcile(true).unwrap().is_success() {
                        succeeded.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        // let the first fetch start, then give the others time to bounce off the flag
        gate.wait_for_fetch();
        thread::sleep(Duration::from_millis(50));
        gate.release();

        for handle in handles {
            handle.join().expect("reconcile thread panicked");
        }

        assert_that!(f.remote.max_concurrent_fetches()).is_equal_to(1);
        assert_that!(succeeded.load(Ordering::SeqCst)).is_greater_than_or_equal_to(1);
        assert_that!(f.remote.fetches()).is_equal_to(succeeded.load(Ordering::SeqCst));
    }

    #[test]
    fn poller_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let poller = Poller::spawn("test-poller", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        poller.stop();
        let after_stop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));

        assert_that!(after_stop).is_greater_than(0);
        assert_that!(ticks.load(Ordering::SeqCst)).is_equal_to(after_stop);
    }
}
