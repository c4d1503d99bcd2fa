use crate::actor::Actor;
use crate::error::Result;
use crate::feature::Feature;
use crate::gate::GateValue;
use crate::snapshot::Snapshot;

/// FlagStore is the capability every flag store provides: local leaves, remote leaves and the
/// composite stores that keep the two in sync.
///
/// Implementations must be safe to share between threads. A reader must never observe part of
/// an [FlagStore::import]: it sees either the whole previous feature set or the whole new one.
pub trait FlagStore: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Retrieve the feature with key `key`, if it exists.
    fn get(&self, key: &str) -> Result<Option<Feature>>;

    /// Retrieve every feature as one consistent snapshot.
    fn get_all(&self) -> Result<Snapshot>;

    /// Keys of every known feature, in snapshot order.
    fn features(&self) -> Result<Vec<String>> {
        Ok(self.get_all()?.keys().map(str::to_string).collect())
    }

    /// Register a feature with no gates set. Adding an existing feature leaves it untouched.
    fn add(&self, key: &str) -> Result<()>;

    /// Remove a feature and all of its gates.
    fn remove(&self, key: &str) -> Result<()>;

    /// Unset every gate of a feature while keeping it registered.
    fn clear(&self, key: &str) -> Result<()>;

    /// Open one gate of a feature, adding the feature if needed.
    fn enable(&self, key: &str, gate: &GateValue) -> Result<()>;

    /// Close one gate of a feature. Closing the boolean gate clears every gate.
    fn disable(&self, key: &str, gate: &GateValue) -> Result<()>;

    /// Replace the entire feature set with `snapshot`: add new features, update changed ones and
    /// remove the ones the snapshot no longer contains.
    fn import(&self, snapshot: &Snapshot) -> Result<()>;

    /// Whether `key` is enabled, optionally for an actor. Unknown features are disabled.
    fn is_enabled(&self, key: &str, actor: Option<&Actor>) -> Result<bool> {
        Ok(self
            .get(key)?
            .map(|feature| feature.is_enabled(actor))
            .unwrap_or(false))
    }
}
