use std::sync::Arc;

use log::{debug, warn};

use crate::error::Result;
use crate::feature::Feature;
use crate::gate::GateValue;
use crate::snapshot::Snapshot;
use crate::store::FlagStore;
use crate::synchronizer::{Poller, SyncOptions, SyncOutcome, Synchronizer};

/// Serves reads from a local store and keeps it fresh by pulling from a remote one.
///
/// Every read first asks the synchronizer for an unforced reconciliation, which is a cheap
/// no-op until the interval has passed. Writes only touch the local store; the authoritative
/// writer for the remote lives elsewhere.
pub struct PullSyncStore {
    local: Arc<dyn FlagStore>,
    synchronizer: Synchronizer,
}

impl PullSyncStore {
    /// Builds the store and performs one forced reconciliation.
    ///
    /// A remote failure during that first pass does not fail construction: the store starts
    /// with whatever the local store holds and retries on the next read. A local storage
    /// failure does.
    pub fn new(
        local: Arc<dyn FlagStore>,
        remote: Arc<dyn FlagStore>,
        options: SyncOptions,
    ) -> Result<Self> {
        let synchronizer = Synchronizer::new(Arc::clone(&local), remote, options)?;
        let store = Self {
            local,
            synchronizer,
        };
        if let SyncOutcome::Failed(e) = store.synchronizer.reconcile(true)? {
            warn!("initial sync failed, starting from local state: {}", e);
        }
        Ok(store)
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    /// Force a reconciliation now, regardless of the interval.
    pub fn sync(&self) -> Result<SyncOutcome> {
        self.synchronizer.reconcile(true)
    }

    /// Reconcile on a background thread every interval, in addition to read-triggered passes.
    pub fn spawn_poller(self: &Arc<Self>) -> Result<Poller> {
        let store = Arc::downgrade(self);
        Poller::spawn("flagsync-poller", self.synchronizer.interval(), move || {
            if let Some(store) = store.upgrade() {
                if let Err(e) = store.synchronizer.reconcile(false) {
                    warn!("background sync failed: {}", e);
                }
            }
        })
    }

    fn refresh(&self) -> Result<()> {
        if let SyncOutcome::Failed(e) = self.synchronizer.reconcile(false)? {
            debug!("serving stale flags: {}", e);
        }
        Ok(())
    }
}

impl FlagStore for PullSyncStore {
    fn name(&self) -> &str {
        "pull_sync"
    }

    fn get(&self, key: &str) -> Result<Option<Feature>> {
        self.refresh()?;
        self.local.get(key)
    }

    fn get_all(&self) -> Result<Snapshot> {
        self.refresh()?;
        self.local.get_all()
    }

    fn features(&self) -> Result<Vec<String>> {
        self.refresh()?;
        self.local.features()
    }

    fn add(&self, key: &str) -> Result<()> {
        self.local.add(key)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.local.remove(key)
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.local.clear(key)
    }

    fn enable(&self, key: &str, gate: &GateValue) -> Result<()> {
        self.local.enable(key, gate)
    }

    fn disable(&self, key: &str, gate: &GateValue) -> Result<()> {
        self.local.disable(key, gate)
    }

    fn import(&self, snapshot: &Snapshot) -> Result<()> {
        self.local.import(snapshot)
    }
}
