use std::collections::BTreeSet;

use sha1::{Digest, Sha1};

const BUCKET_SCALE_INT: i64 = 0x0FFF_FFFF_FFFF_FFFF;
const BUCKET_SCALE: f64 = BUCKET_SCALE_INT as f64;

/// Something a feature can be enabled for, such as a user or an organization.
///
/// The id should be stable and unique across actor types, e.g. `User;42`. Group membership is
/// declared by the caller; a group gate matches when the actor belongs to one of its groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    id: String,
    groups: BTreeSet<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            groups: BTreeSet::new(),
        }
    }

    /// Adds the actor to a group.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    pub fn is_in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Deterministic position of this actor within `feature_key`'s rollout, in `[0, 1)`.
    ///
    /// The same actor lands in the same bucket for a feature every time, so raising a percentage
    /// only ever adds actors.
    pub(crate) fn bucket(&self, feature_key: &str) -> f64 {
        let mut hash = Sha1::new();
        hash.update(feature_key.as_bytes());
        hash.update(b".");
        hash.update(self.id.as_bytes());

        let digest = hash.finalize();
        let hexhash = base16ct::lower::encode_string(&digest);

        let hexhash_15 = &hexhash[..15]; // 15 hex chars fit in an i64 without the sign bit
        match i64::from_str_radix(hexhash_15, 16) {
            Ok(numhash) => numhash as f64 / BUCKET_SCALE,
            Err(_) => 0.0,
        }
    }
}

impl From<&str> for Actor {
    fn from(id: &str) -> Self {
        Actor::new(id)
    }
}

impl From<String> for Actor {
    fn from(id: String) -> Self {
        Actor::new(id)
    }
}
