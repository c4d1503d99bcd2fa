use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::feature::Feature;

/// An immutable, ordered capture of every feature at a point in time.
///
/// Feature keys are unique within a snapshot. Cloning is cheap: the feature list is shared, so a
/// snapshot can be handed to readers while a newer one is being built.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(try_from = "WireSnapshot", into = "WireSnapshot")]
pub struct Snapshot {
    inner: Arc<Inner>,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    features: Vec<Feature>,
    index: HashMap<String, usize>,
}

impl Inner {
    fn new(features: Vec<Feature>) -> Result<Inner> {
        let mut index = HashMap::with_capacity(features.len());
        for (i, feature) in features.iter().enumerate() {
            if index.insert(feature.key.clone(), i).is_some() {
                return Err(Error::MalformedSnapshot(format!(
                    "duplicate feature key {}",
                    feature.key
                )));
            }
        }
        Ok(Inner { features, index })
    }
}

impl Snapshot {
    /// A snapshot with no features, stamped now.
    pub fn empty() -> Self {
        Snapshot {
            inner: Arc::new(Inner::default()),
            fetched_at: Utc::now(),
        }
    }

    /// Builds a snapshot stamped now. Fails if two features share a key.
    pub fn new(features: Vec<Feature>) -> Result<Self> {
        Ok(Snapshot {
            inner: Arc::new(Inner::new(features)?),
            fetched_at: Utc::now(),
        })
    }

    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn get(&self, key: &str) -> Option<&Feature> {
        self.inner
            .index
            .get(key)
            .and_then(|i| self.inner.features.get(*i))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.index.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.inner.features.iter()
    }

    /// Feature keys in snapshot order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.features.iter().map(|f| f.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.inner.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.features.is_empty()
    }

    /// What installing `newer` over `self` would add, change and remove.
    pub fn diff(&self, newer: &Snapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        for feature in newer.iter() {
            match self.get(&feature.key) {
                None => diff.added.push(feature.key.clone()),
                Some(existing) if existing != feature => diff.updated.push(feature.key.clone()),
                Some(_) => (),
            }
        }
        diff.removed = self
            .keys()
            .filter(|key| !newer.contains(key))
            .map(str::to_string)
            .collect();
        diff
    }

    /// A copy with `key` changed by `update`, appending a fresh feature if it is absent.
    pub(crate) fn with_feature<F>(&self, key: &str, update: F) -> Snapshot
    where
        F: FnOnce(&mut Feature),
    {
        let mut features = self.inner.features.clone();
        let index = match self.inner.index.get(key) {
            Some(i) => *i,
            None => {
                features.push(Feature::new(key));
                features.len() - 1
            }
        };
        update(&mut features[index]);
        self.rebuilt(features)
    }

    /// A copy without `key`.
    pub(crate) fn without(&self, key: &str) -> Snapshot {
        let features = self
            .inner
            .features
            .iter()
            .filter(|f| f.key != key)
            .cloned()
            .collect();
        self.rebuilt(features)
    }

    fn rebuilt(&self, features: Vec<Feature>) -> Snapshot {
        let index = features
            .iter()
            .enumerate()
            .map(|(i, f)| (f.key.clone(), i))
            .collect();
        Snapshot {
            inner: Arc::new(Inner { features, index }),
            fetched_at: self.fetched_at,
        }
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot::empty()
    }
}

// Two snapshots are equal when they hold the same features in the same order; when they were
// fetched does not matter.
impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.features == other.inner.features
    }
}

#[derive(Serialize, Deserialize)]
struct WireSnapshot {
    #[serde(default)]
    features: Vec<Feature>,
}

impl From<Snapshot> for WireSnapshot {
    fn from(snapshot: Snapshot) -> Self {
        WireSnapshot {
            features: snapshot.inner.features.clone(),
        }
    }
}

impl TryFrom<WireSnapshot> for Snapshot {
    type Error = Error;

    fn try_from(wire: WireSnapshot) -> Result<Self> {
        Snapshot::new(wire.features)
    }
}

/// Keys added, updated and removed between two snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

impl fmt::Display for SnapshotDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added [{}] updated [{}] removed [{}]",
            self.added.iter().join(", "),
            self.updated.iter().join(", "),
            self.removed.iter().join(", ")
        )
    }
}
