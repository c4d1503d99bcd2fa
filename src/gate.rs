use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// The kinds of gate a feature can carry, in evaluation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Boolean,
    Groups,
    Actors,
    PercentageOfActors,
    PercentageOfTime,
}

impl GateKind {
    pub const ALL: [GateKind; 5] = [
        GateKind::Boolean,
        GateKind::Groups,
        GateKind::Actors,
        GateKind::PercentageOfActors,
        GateKind::PercentageOfTime,
    ];

    /// The key identifying this gate on the wire and in HTTP paths.
    pub fn key(&self) -> &'static str {
        match self {
            GateKind::Boolean => "boolean",
            GateKind::Groups => "groups",
            GateKind::Actors => "actors",
            GateKind::PercentageOfActors => "percentage_of_actors",
            GateKind::PercentageOfTime => "percentage_of_time",
        }
    }

    /// The singular display name sent alongside the key.
    pub fn name(&self) -> &'static str {
        match self {
            GateKind::Boolean => "boolean",
            GateKind::Groups => "group",
            GateKind::Actors => "actor",
            GateKind::PercentageOfActors => "percentage_of_actors",
            GateKind::PercentageOfTime => "percentage_of_time",
        }
    }

    /// Looks a kind up by either its key or its name.
    pub fn from_key(key: &str) -> Option<GateKind> {
        GateKind::ALL
            .into_iter()
            .find(|kind| kind.key() == key || kind.name() == key)
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A gate kind together with the value being enabled or disabled.
#[derive(Clone, Debug, PartialEq)]
pub enum GateValue {
    Boolean(bool),
    Group(String),
    Actor(String),
    PercentageOfActors(f64),
    PercentageOfTime(f64),
}

impl From<bool> for GateValue {
    fn from(b: bool) -> GateValue {
        GateValue::Boolean(b)
    }
}

impl GateValue {
    pub fn kind(&self) -> GateKind {
        match self {
            GateValue::Boolean(_) => GateKind::Boolean,
            GateValue::Group(_) => GateKind::Groups,
            GateValue::Actor(_) => GateKind::Actors,
            GateValue::PercentageOfActors(_) => GateKind::PercentageOfActors,
            GateValue::PercentageOfTime(_) => GateKind::PercentageOfTime,
        }
    }

    /// Rejects values no store can hold: percentages outside 0..=100 and empty identifiers.
    pub fn validate(&self) -> Result<()> {
        match self {
            GateValue::PercentageOfActors(p) | GateValue::PercentageOfTime(p) => {
                if !(0.0..=100.0).contains(p) {
                    return Err(Error::InvalidGate(format!(
                        "{} must be between 0 and 100, got {}",
                        self.kind(),
                        p
                    )));
                }
            }
            GateValue::Group(id) | GateValue::Actor(id) if id.is_empty() => {
                return Err(Error::InvalidGate(format!(
                    "{} identifier must not be empty",
                    self.kind().name()
                )));
            }
            _ => (),
        }
        Ok(())
    }

    /// Request body describing this gate value to a remote store.
    pub(crate) fn wire_body(&self) -> Value {
        match self {
            GateValue::Boolean(b) => json!({ "value": b }),
            GateValue::Group(name) => json!({ "name": name }),
            GateValue::Actor(id) => json!({ "flipper_id": id }),
            GateValue::PercentageOfActors(p) | GateValue::PercentageOfTime(p) => {
                json!({ "percentage": p.to_string() })
            }
        }
    }
}

/// Every gate setting of a single feature.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Gates {
    pub boolean: bool,
    pub groups: BTreeSet<String>,
    pub actors: BTreeSet<String>,
    pub percentage_of_actors: f64,
    pub percentage_of_time: f64,
}

impl Gates {
    /// True when no gate would enable the feature for anyone.
    pub fn is_empty(&self) -> bool {
        !self.boolean
            && self.groups.is_empty()
            && self.actors.is_empty()
            && self.percentage_of_actors == 0.0
            && self.percentage_of_time == 0.0
    }

    pub(crate) fn enable(&mut self, gate: &GateValue) {
        match gate {
            GateValue::Boolean(true) => self.boolean = true,
            GateValue::Boolean(false) => self.clear(),
            GateValue::Group(name) => {
                self.groups.insert(name.clone());
            }
            GateValue::Actor(id) => {
                self.actors.insert(id.clone());
            }
            GateValue::PercentageOfActors(p) => self.percentage_of_actors = *p,
            GateValue::PercentageOfTime(p) => self.percentage_of_time = *p,
        }
    }

    pub(crate) fn disable(&mut self, gate: &GateValue) {
        match gate {
            // turning the boolean gate off turns the whole feature off
            GateValue::Boolean(_) => self.clear(),
            GateValue::Group(name) => {
                self.groups.remove(name);
            }
            GateValue::Actor(id) => {
                self.actors.remove(id);
            }
            GateValue::PercentageOfActors(_) => self.percentage_of_actors = 0.0,
            GateValue::PercentageOfTime(_) => self.percentage_of_time = 0.0,
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Gates::default();
    }

    /// The wire value of one gate.
    pub(crate) fn wire_value(&self, kind: GateKind) -> Value {
        match kind {
            GateKind::Boolean => Value::Bool(self.boolean),
            GateKind::Groups => json!(self.groups),
            GateKind::Actors => json!(self.actors),
            GateKind::PercentageOfActors => json!(self.percentage_of_actors),
            GateKind::PercentageOfTime => json!(self.percentage_of_time),
        }
    }
}
