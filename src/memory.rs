use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::feature::Feature;
use crate::gate::GateValue;
use crate::snapshot::Snapshot;
use crate::store::FlagStore;

/// In-memory flag store, the default local store.
///
/// The current feature set is an immutable [Snapshot] behind a reference. Every write builds a
/// new snapshot off to the side and publishes it with a single swap, so readers only hold the
/// lock long enough to clone a pointer and never see a half-applied write. Writers are
/// serialized among themselves so concurrent gate changes are not lost.
pub struct MemoryStore {
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_snapshot(Snapshot::empty())
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        }
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    fn publish(&self, snapshot: Snapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    fn modify<F>(&self, key: &str, update: F)
    where
        F: FnOnce(&mut Feature),
    {
        let _writer = self.writer.lock();
        let next = self.snapshot().with_feature(key, update);
        self.publish(next);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlagStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<Feature>> {
        Ok(self.snapshot().get(key).cloned())
    }

    fn get_all(&self) -> Result<Snapshot> {
        Ok(self.snapshot().as_ref().clone())
    }

    fn add(&self, key: &str) -> Result<()> {
        let _writer = self.writer.lock();
        let current = self.snapshot();
        if !current.contains(key) {
            self.publish(current.with_feature(key, |_| ()));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _writer = self.writer.lock();
        let current = self.snapshot();
        if current.contains(key) {
            self.publish(current.without(key));
        }
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.modify(key, |feature| feature.gates.clear());
        Ok(())
    }

    fn enable(&self, key: &str, gate: &GateValue) -> Result<()> {
        gate.validate()?;
        self.modify(key, |feature| feature.gates.enable(gate));
        Ok(())
    }

    fn disable(&self, key: &str, gate: &GateValue) -> Result<()> {
        self.modify(key, |feature| feature.gates.disable(gate));
        Ok(())
    }

    fn import(&self, snapshot: &Snapshot) -> Result<()> {
        let _writer = self.writer.lock();
        self.publish(snapshot.clone());
        Ok(())
    }
}
