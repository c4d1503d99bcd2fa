use std::collections::BTreeSet;
use std::convert::TryFrom;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use crate::actor::Actor;
use crate::eval::{self, Detail};
use crate::gate::{GateKind, GateValue, Gates};

/// The coarse state of a feature, derived from its gates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureState {
    /// Enabled for everyone: the boolean gate is set or percentage of time is 100.
    On,
    /// No gate is set.
    Off,
    /// Enabled for some actors or some of the time.
    Conditional,
}

/// A named flag and its gates.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "WireFeature", into = "WireFeature")]
pub struct Feature {
    pub key: String,
    pub gates: Gates,
}

impl Feature {
    /// A feature with no gates set.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            gates: Gates::default(),
        }
    }

    pub fn with_gate(mut self, gate: GateValue) -> Self {
        self.gates.enable(&gate);
        self
    }

    pub fn state(&self) -> FeatureState {
        if self.gates.boolean || self.gates.percentage_of_time >= 100.0 {
            FeatureState::On
        } else if self.gates.is_empty() {
            FeatureState::Off
        } else {
            FeatureState::Conditional
        }
    }

    pub fn evaluate(&self, actor: Option<&Actor>) -> Detail {
        eval::evaluate(self, actor)
    }

    pub fn is_enabled(&self, actor: Option<&Actor>) -> bool {
        self.evaluate(actor).enabled
    }
}

// Features travel as a key, a redundant state and a list of gate objects. The gate list always
// carries every kind on the way out; on the way in, missing kinds default to unset and unknown
// kinds are skipped so newer remotes can add gates.
#[derive(Serialize, Deserialize)]
struct WireFeature {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<FeatureState>,
    #[serde(default)]
    gates: Vec<WireGate>,
}

#[derive(Serialize, Deserialize)]
struct WireGate {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    value: Value,
}

#[serde_as]
#[derive(Deserialize)]
struct WireBoolean(#[serde_as(as = "PickFirst<(_, DisplayFromStr)>")] bool);

#[serde_as]
#[derive(Deserialize)]
struct WirePercentage(#[serde_as(as = "PickFirst<(_, DisplayFromStr)>")] f64);

impl From<Feature> for WireFeature {
    fn from(feature: Feature) -> Self {
        let gates = GateKind::ALL
            .into_iter()
            .map(|kind| WireGate {
                key: kind.key().to_string(),
                name: Some(kind.name().to_string()),
                value: feature.gates.wire_value(kind),
            })
            .collect();
        WireFeature {
            state: Some(feature.state()),
            key: feature.key,
            gates,
        }
    }
}

impl TryFrom<WireFeature> for Feature {
    type Error = String;

    fn try_from(wire: WireFeature) -> Result<Self, Self::Error> {
        if wire.key.is_empty() {
            return Err("feature key must not be empty".to_string());
        }

        let mut gates = Gates::default();
        for gate in wire.gates {
            let kind = match GateKind::from_key(&gate.key) {
                Some(kind) => kind,
                None => {
                    warn!("skipping unknown gate {} on feature {}", gate.key, wire.key);
                    continue;
                }
            };
            if gate.value.is_null() {
                continue;
            }
            let invalid = |e: serde_json::Error| {
                format!("gate {} on feature {}: {}", kind, wire.key, e)
            };
            match kind {
                GateKind::Boolean => {
                    let WireBoolean(b) = serde_json::from_value(gate.value).map_err(invalid)?;
                    gates.boolean = b;
                }
                GateKind::Groups => {
                    gates.groups = serde_json::from_value::<BTreeSet<String>>(gate.value)
                        .map_err(invalid)?;
                }
                GateKind::Actors => {
                    gates.actors = serde_json::from_value::<BTreeSet<String>>(gate.value)
                        .map_err(invalid)?;
                }
                GateKind::PercentageOfActors | GateKind::PercentageOfTime => {
                    let WirePercentage(p) =
                        serde_json::from_value(gate.value).map_err(invalid)?;
                    let value = if kind == GateKind::PercentageOfActors {
                        GateValue::PercentageOfActors(p)
                    } else {
                        GateValue::PercentageOfTime(p)
                    };
                    value.validate().map_err(|e| e.to_string())?;
                    gates.enable(&value);
                }
            }
        }

        Ok(Feature {
            key: wire.key,
            gates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use maplit::btreeset;
    use serde_json::json;
    use spectral::prelude::*;
    use test_case::test_case;

    #[test]
    fn parses_full_gate_list() {
        let feature: Feature = serde_json::from_value(json!({
            "key": "search",
            "state": "on",
            "gates": [
                {"key": "boolean", "name": "boolean", "value": true},
                {"key": "groups", "name": "group", "value": ["admins"]},
                {"key": "actors", "name": "actor", "value": ["User;1", "User;2"]},
                {"key": "percentage_of_actors", "name": "percentage_of_actors", "value": 25},
                {"key": "percentage_of_time", "name": "percentage_of_time", "value": "12.5"}
            ]
        }))
        .unwrap();

        assert_that!(feature.key.as_str()).is_equal_to("search");
        assert!(feature.gates.boolean);
        assert_that!(feature.gates.groups).is_equal_to(btreeset! {"admins".to_string()});
        assert_that!(feature.gates.actors.len()).is_equal_to(2);
        assert_that!(feature.gates.percentage_of_actors).is_equal_to(25.0);
        assert_that!(feature.gates.percentage_of_time).is_equal_to(12.5);
        assert_that!(feature.state()).is_equal_to(FeatureState::On);
    }

    #[test_case(json!(true), true; "bool true")]
    #[test_case(json!("true"), true; "string true")]
    #[test_case(json!(false), false; "bool false")]
    #[test_case(json!("false"), false; "string false")]
    #[test_case(json!(null), false; "null")]
    fn boolean_gate_values(value: Value, expected: bool) {
        let feature: Feature = serde_json::from_value(json!({
            "key": "history",
            "gates": [{"key": "boolean", "value": value}]
        }))
        .unwrap();
        assert_that!(feature.gates.boolean).is_equal_to(expected);
    }

    #[test]
    fn missing_gates_default_to_off() {
        let feature: Feature = serde_json::from_value(json!({"key": "history"})).unwrap();
        assert_that!(feature.gates).is_equal_to(Gates::default());
        assert_that!(feature.state()).is_equal_to(FeatureState::Off);
    }

    #[test]
    fn unknown_gates_are_skipped() {
        let feature: Feature = serde_json::from_value(json!({
            "key": "search",
            "gates": [
                {"key": "expression", "value": {"Equal": [1, 1]}},
                {"key": "actors", "value": ["User;1"]}
            ]
        }))
        .unwrap();
        assert_that!(feature.state()).is_equal_to(FeatureState::Conditional);
    }

    #[test_case(json!({"key": "", "gates": []}); "empty key")]
    #[test_case(json!({"key": "f", "gates": [{"key": "actors", "value": 5}]}); "actors not a list")]
    #[test_case(json!({"key": "f", "gates": [{"key": "boolean", "value": "yes"}]}); "boolean not parseable")]
    #[test_case(json!({"key": "f", "gates": [{"key": "percentage_of_time", "value": 150}]}); "percentage out of range")]
    #[test_case(json!({"key": "f", "gates": [{"key": "percentage_of_actors", "value": "half"}]}); "percentage not numeric")]
    fn rejects_malformed_features(value: Value) {
        assert_that!(serde_json::from_value::<Feature>(value)).is_err();
    }

    #[test]
    fn serializes_every_gate_in_order() {
        let feature = Feature::new("search")
            .with_gate(GateValue::Actor("User;1".into()))
            .with_gate(GateValue::PercentageOfActors(10.0));

        assert_json_eq!(
            serde_json::to_value(&feature).unwrap(),
            json!({
                "key": "search",
                "state": "conditional",
                "gates": [
                    {"key": "boolean", "name": "boolean", "value": false},
                    {"key": "groups", "name": "group", "value": []},
                    {"key": "actors", "name": "actor", "value": ["User;1"]},
                    {"key": "percentage_of_actors", "name": "percentage_of_actors", "value": 10.0},
                    {"key": "percentage_of_time", "name": "percentage_of_time", "value": 0.0}
                ]
            })
        );
    }

    #[test]
    fn full_percentage_of_time_is_on() {
        let feature = Feature::new("search").with_gate(GateValue::PercentageOfTime(100.0));
        assert_that!(feature.state()).is_equal_to(FeatureState::On);
    }
}
