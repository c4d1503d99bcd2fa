#![cfg(test)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::feature::Feature;
use crate::gate::GateValue;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::instrument::{Instrumenter, SyncEvent};
use crate::memory::MemoryStore;
use crate::snapshot::Snapshot;
use crate::store::FlagStore;
use crate::synchronizer::Clock;

pub const SEARCH_AND_HISTORY: &str = r#"{
    "features": [
        {
            "key": "search",
            "state": "on",
            "gates": [
                {"key": "boolean", "name": "boolean", "value": true},
                {"key": "groups", "name": "group", "value": []},
                {"key": "actors", "name": "actor", "value": []},
                {"key": "percentage_of_actors", "name": "percentage_of_actors", "value": 0},
                {"key": "percentage_of_time", "name": "percentage_of_time", "value": 0}
            ]
        },
        {
            "key": "history",
            "state": "off",
            "gates": [
                {"key": "boolean", "name": "boolean", "value": false},
                {"key": "groups", "name": "group", "value": []},
                {"key": "actors", "name": "actor", "value": []},
                {"key": "percentage_of_actors", "name": "percentage_of_actors", "value": 0},
                {"key": "percentage_of_time", "name": "percentage_of_time", "value": 0}
            ]
        }
    ]
}"#;

pub fn search_and_history() -> Snapshot {
    serde_json::from_str(SEARCH_AND_HISTORY).unwrap()
}

/// A snapshot whose features are all fully on, in the given order.
pub fn features_snapshot(keys: &[&str]) -> Snapshot {
    Snapshot::new(
        keys.iter()
            .map(|key| Feature::new(*key).with_gate(GateValue::Boolean(true)))
            .collect(),
    )
    .unwrap()
}

/// Ordered log of store operations shared between several test stores.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// A memory store that writes every mutation to a journal.
pub struct JournaledStore {
    inner: MemoryStore,
    journal: Journal,
}

impl JournaledStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            inner: MemoryStore::new(),
            journal,
        }
    }
}

impl FlagStore for JournaledStore {
    fn name(&self) -> &str {
        "local"
    }

    fn get(&self, key: &str) -> Result<Option<Feature>> {
        self.inner.get(key)
    }

    fn get_all(&self) -> Result<Snapshot> {
        self.inner.get_all()
    }

    fn add(&self, key: &str) -> Result<()> {
        self.journal.record(format!("local:add:{}", key));
        self.inner.add(key)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.journal.record(format!("local:remove:{}", key));
        self.inner.remove(key)
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.journal.record(format!("local:clear:{}", key));
        self.inner.clear(key)
    }

    fn enable(&self, key: &str, gate: &GateValue) -> Result<()> {
        self.journal.record(format!("local:enable:{}", key));
        self.inner.enable(key, gate)
    }

    fn disable(&self, key: &str, gate: &GateValue) -> Result<()> {
        self.journal.record(format!("local:disable:{}", key));
        self.inner.disable(key, gate)
    }

    fn import(&self, snapshot: &Snapshot) -> Result<()> {
        self.journal.record("local:import".to_string());
        self.inner.import(snapshot)
    }
}

#[derive(Default)]
struct GateState {
    blocking: bool,
    entered: usize,
}

/// Lets a test hold remote fetches open.
#[derive(Default)]
pub struct FetchGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl FetchGate {
    fn pass(&self) {
        let mut state = self.state.lock();
        if !state.blocking {
            return;
        }
        state.entered += 1;
        self.changed.notify_all();
        while state.blocking {
            self.changed.wait(&mut state);
        }
    }

    /// Blocks until some fetch is being held.
    pub fn wait_for_fetch(&self) {
        let mut state = self.state.lock();
        while state.entered == 0 {
            self.changed.wait(&mut state);
        }
    }

    pub fn release(&self) {
        self.state.lock().blocking = false;
        self.changed.notify_all();
    }
}

/// A scriptable remote store: counts fetches, can fail on demand and can hold fetches open.
pub struct TestRemote {
    store: MemoryStore,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    read_failure: Mutex<Option<Error>>,
    write_failure: Mutex<Option<Error>>,
    gate: Arc<FetchGate>,
    journal: Journal,
}

impl TestRemote {
    pub fn new(snapshot: Snapshot) -> Self {
        Self::with_journal(snapshot, Journal::default())
    }

    pub fn with_journal(snapshot: Snapshot, journal: Journal) -> Self {
        Self {
            store: MemoryStore::with_snapshot(snapshot),
            fetches: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            read_failure: Mutex::new(None),
            write_failure: Mutex::new(None),
            gate: Arc::new(FetchGate::default()),
            journal,
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_snapshot(&self, snapshot: Snapshot) {
        self.store.import(&snapshot).unwrap();
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.get_all().unwrap()
    }

    pub fn fail_with(&self, error: Error) {
        *self.read_failure.lock() = Some(error);
    }

    pub fn fail_writes_with(&self, error: Error) {
        *self.write_failure.lock() = Some(error);
    }

    pub fn recover(&self) {
        *self.read_failure.lock() = None;
        *self.write_failure.lock() = None;
    }

    /// Holds every fetch until the returned gate is released.
    pub fn block_fetches(&self) -> Arc<FetchGate> {
        self.gate.state.lock().blocking = true;
        Arc::clone(&self.gate)
    }

    fn read_check(&self) -> Result<()> {
        match self.read_failure.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn write<F>(&self, op: &str, key: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&MemoryStore) -> Result<()>,
    {
        if let Some(e) = self.write_failure.lock().clone() {
            return Err(e);
        }
        self.journal.record(format!("remote:{}:{}", op, key));
        apply(&self.store)
    }
}

impl FlagStore for TestRemote {
    fn name(&self) -> &str {
        "remote"
    }

    fn get(&self, key: &str) -> Result<Option<Feature>> {
        self.read_check()?;
        self.store.get(key)
    }

    fn get_all(&self) -> Result<Snapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.gate.pass();
        let result = self.read_check().and_then(|_| self.store.get_all());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn add(&self, key: &str) -> Result<()> {
        self.write("add", key, |s| s.add(key))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write("remove", key, |s| s.remove(key))
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.write("clear", key, |s| s.clear(key))
    }

    fn enable(&self, key: &str, gate: &GateValue) -> Result<()> {
        self.write("enable", key, |s| s.enable(key, gate))
    }

    fn disable(&self, key: &str, gate: &GateValue) -> Result<()> {
        self.write("disable", key, |s| s.disable(key, gate))
    }

    fn import(&self, snapshot: &Snapshot) -> Result<()> {
        self.write("import", "*", |s| s.import(snapshot))
    }
}

/// A local store whose every operation fails.
pub struct FailingStore;

impl FailingStore {
    fn fail<T>() -> Result<T> {
        Err(Error::Storage("disk unavailable".to_string()))
    }
}

impl FlagStore for FailingStore {
    fn name(&self) -> &str {
        "failing"
    }

    fn get(&self, _key: &str) -> Result<Option<Feature>> {
        Self::fail()
    }

    fn get_all(&self) -> Result<Snapshot> {
        Self::fail()
    }

    fn add(&self, _key: &str) -> Result<()> {
        Self::fail()
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Self::fail()
    }

    fn clear(&self, _key: &str) -> Result<()> {
        Self::fail()
    }

    fn enable(&self, _key: &str, _gate: &GateValue) -> Result<()> {
        Self::fail()
    }

    fn disable(&self, _key: &str, _gate: &GateValue) -> Result<()> {
        Self::fail()
    }

    fn import(&self, _snapshot: &Snapshot) -> Result<()> {
        Self::fail()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[derive(Default)]
pub struct RecordingInstrumenter {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingInstrumenter {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }
}

impl Instrumenter for RecordingInstrumenter {
    fn record(&self, event: SyncEvent) {
        self.events.lock().push(event);
    }
}

type Reply = std::result::Result<HttpResponse, String>;

/// An HTTP client that records requests and plays back queued replies, answering `200 {}` once
/// the queue is empty.
#[derive(Default)]
pub struct MockHttpClient {
    requests: Mutex<Vec<HttpRequest>>,
    replies: Mutex<VecDeque<Reply>>,
}

impl MockHttpClient {
    pub fn reply(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn last_body(&self) -> serde_json::Value {
        let requests = self.requests();
        let body = requests.last().unwrap().body.as_ref().unwrap();
        serde_json::from_slice(body).unwrap()
    }
}

impl HttpClient for MockHttpClient {
    fn execute(&self, request: HttpRequest) -> Reply {
        self.requests.lock().push(request);
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::new(200, "{}")))
    }
}
