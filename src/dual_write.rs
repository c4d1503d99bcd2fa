use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::error::Result;
use crate::feature::Feature;
use crate::gate::GateValue;
use crate::snapshot::Snapshot;
use crate::store::FlagStore;
use crate::synchronizer::{SyncOptions, SyncOutcome, Synchronizer};

/// Serves reads from a local store and writes to both the remote and the local store.
///
/// Every write goes to the remote first. If the remote rejects it, the local store is not
/// touched and the error is returned, so the local store never holds a change the remote does
/// not. Reads never contact the remote: fresh state arrives when an external signal, such as a
/// verified webhook, calls [DualWriteStore::sync].
///
/// Writes and syncs are serialized, so both stores apply concurrent writes in the same order.
pub struct DualWriteStore {
    local: Arc<dyn FlagStore>,
    remote: Arc<dyn FlagStore>,
    synchronizer: Synchronizer,
    writer: Mutex<()>,
}

impl DualWriteStore {
    pub fn new(
        local: Arc<dyn FlagStore>,
        remote: Arc<dyn FlagStore>,
        options: SyncOptions,
    ) -> Result<Self> {
        let synchronizer = Synchronizer::new(Arc::clone(&local), Arc::clone(&remote), options)?;
        Ok(Self {
            local,
            remote,
            synchronizer,
            writer: Mutex::new(()),
        })
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    /// Pull the latest full snapshot from the remote, typically after a push notification.
    pub fn sync(&self) -> Result<SyncOutcome> {
        let _writer = self.writer.lock();
        self.synchronizer.reconcile(true)
    }

    fn write<F>(&self, operation: &str, key: &str, apply: F) -> Result<()>
    where
        F: Fn(&dyn FlagStore) -> Result<()>,
    {
        let _writer = self.writer.lock();
        if let Err(e) = apply(self.remote.as_ref()) {
            warn!("{} {} rejected by {}: {}", operation, key, self.remote.name(), e);
            return Err(e);
        }
        apply(self.local.as_ref())
    }
}

impl FlagStore for DualWriteStore {
    fn name(&self) -> &str {
        "dual_write"
    }

    fn get(&self, key: &str) -> Result<Option<Feature>> {
        self.local.get(key)
    }

    fn get_all(&self) -> Result<Snapshot> {
        self.local.get_all()
    }

    fn features(&self) -> Result<Vec<String>> {
        self.local.features()
    }

    fn add(&self, key: &str) -> Result<()> {
        self.write("add", key, |store| store.add(key))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write("remove", key, |store| store.remove(key))
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.write("clear", key, |store| store.clear(key))
    }

    fn enable(&self, key: &str, gate: &GateValue) -> Result<()> {
        gate.validate()?;
        self.write("enable", key, |store| store.enable(key, gate))
    }

    fn disable(&self, key: &str, gate: &GateValue) -> Result<()> {
        self.write("disable", key, |store| store.disable(key, gate))
    }

    fn import(&self, snapshot: &Snapshot) -> Result<()> {
        self.write("import", "snapshot", |store| store.import(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::feature::FeatureState;
    use crate::memory::MemoryStore;
    use crate::test_common::{
        features_snapshot, search_and_history, Journal, JournaledStore, TestRemote,
    };
    use spectral::prelude::*;

    struct Fixture {
        journal: Journal,
        local: Arc<JournaledStore>,
        remote: Arc<TestRemote>,
        store: DualWriteStore,
    }

    fn fixture() -> Fixture {
        let journal = Journal::default();
        let local = Arc::new(JournaledStore::new(journal.clone()));
        let remote = Arc::new(TestRemote::with_journal(
            search_and_history(),
            journal.clone(),
        ));
        let store =
            DualWriteStore::new(local.clone(), remote.clone(), SyncOptions::default()).unwrap();
        Fixture {
            journal,
            local,
            remote,
            store,
        }
    }

    #[test]
    fn construction_does_not_fetch() {
        let f = fixture();
        assert_that!(f.remote.fetches()).is_equal_to(0);
        assert!(f.store.get_all().unwrap().is_empty());
    }

    #[test]
    fn reads_never_reach_the_remote() {
        let f = fixture();
        f.store.get("search").unwrap();
        f.store.get_all().unwrap();
        f.store.features().unwrap();
        assert_that!(f.remote.fetches()).is_equal_to(0);
    }

    #[test]
    fn enable_writes_remote_then_local() {
        let f = fixture();

        f.store.enable("search", &GateValue::Boolean(true)).unwrap();

        assert_that!(f.journal.entries()).is_equal_to(vec![
            "remote:enable:search".to_string(),
            "local:enable:search".to_string(),
        ]);
        let search = f.store.get("search").unwrap().unwrap();
        assert_that!(search.state()).is_equal_to(FeatureState::On);
    }

    #[test]
    fn failed_remote_write_leaves_local_unchanged() {
        let f = fixture();
        f.store.enable("search", &GateValue::Actor("User;1".into())).unwrap();
        f.remote.fail_writes_with(Error::unreachable("enable", "connection reset"));

        let result = f.store.enable("search", &GateValue::Boolean(true));

        assert!(matches!(result, Err(Error::Unreachable { .. })));
        let search = f.local.get("search").unwrap().unwrap();
        assert_that!(search.state()).is_equal_to(FeatureState::Conditional);
        assert_that!(f.journal.entries()).has_length(2);
    }

    #[test]
    fn failed_remote_remove_and_import_do_not_apply() {
        let f = fixture();
        f.store.add("billing").unwrap();
        f.remote.fail_writes_with(Error::UnexpectedStatus {
            operation: "remove".into(),
            status: 500,
        });

        assert_that!(f.store.remove("billing")).is_err();
        assert_that!(f.store.import(&features_snapshot(&["reports"]))).is_err();
        assert_that!(f.store.features().unwrap()).is_equal_to(vec!["billing".to_string()]);
    }

    #[test]
    fn invalid_gate_is_rejected_before_any_write() {
        let f = fixture();
        let result = f.store.enable("search", &GateValue::PercentageOfActors(250.0));
        assert!(matches!(result, Err(Error::InvalidGate(_))));
        assert_that!(f.journal.entries()).has_length(0);
    }

    #[test]
    fn sync_pulls_full_snapshot() {
        let f = fixture();
        f.store.enable("local-only", &GateValue::Boolean(true)).unwrap();
        f.remote.set_snapshot(search_and_history());

        let outcome = f.store.sync().unwrap();

        assert!(outcome.is_success());
        assert_that!(f.store.get_all().unwrap()).is_equal_to(search_and_history());
        assert_that!(f.remote.fetches()).is_equal_to(1);
    }

    #[test]
    fn sync_failure_keeps_local_state() {
        let f = fixture();
        f.store.sync().unwrap();
        f.remote.fail_with(Error::unreachable("get_all", "timed out"));

        let outcome = f.store.sync().unwrap();

        assert_that!(outcome.status()).is_equal_to(crate::SyncStatus::Failed);
        assert_that!(f.store.get_all().unwrap()).is_equal_to(search_and_history());
    }

    #[test]
    fn concurrent_writes_apply_in_the_same_order_on_both_sides() {
        let f = fixture();
        let store = Arc::new(f.store);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..20u32 {
                        let gate = GateValue::PercentageOfTime(f64::from(i));
                        store.enable(&format!("feature-{}", t % 3), &gate).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = f.journal.entries();
        assert_that!(entries).has_length(8 * 20 * 2);
        for pair in entries.chunks(2) {
            assert_that!(pair[0].replacen("remote:", "local:", 1)).is_equal_to(pair[1].clone());
        }
        for key in ["feature-0", "feature-1", "feature-2"] {
            assert_that!(f.local.get(key).unwrap()).is_equal_to(f.remote.get(key).unwrap());
        }
    }

    #[test]
    fn writes_reach_both_stores() {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(TestRemote::new(features_snapshot(&[])));
        let store =
            DualWriteStore::new(local.clone(), remote.clone(), SyncOptions::default()).unwrap();

        store.enable("search", &GateValue::Group("admins".into())).unwrap();
        store.enable("search", &GateValue::PercentageOfTime(30.0)).unwrap();
        store.disable("search", &GateValue::Group("admins".into())).unwrap();

        assert_that!(local.get_all().unwrap()).is_equal_to(remote.snapshot());
        assert_that!(local.get("search").unwrap().unwrap().gates.percentage_of_time)
            .is_equal_to(30.0);
    }
}
