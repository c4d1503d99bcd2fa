use rand::Rng;
use serde::Serialize;

use crate::actor::Actor;
use crate::feature::Feature;

/// Evaluate a feature, optionally for a specific [Actor].
///
/// Gates are checked in order: boolean, actors, groups, percentage of actors, percentage of
/// time. The first open gate decides the result. Actor-dependent gates are skipped when no actor
/// is given.
pub fn evaluate(feature: &Feature, actor: Option<&Actor>) -> Detail {
    evaluate_with_rng(feature, actor, &mut rand::thread_rng())
}

pub(crate) fn evaluate_with_rng<R: Rng>(
    feature: &Feature,
    actor: Option<&Actor>,
    rng: &mut R,
) -> Detail {
    let gates = &feature.gates;

    if gates.boolean {
        return Detail::enabled(Reason::Boolean);
    }

    if let Some(actor) = actor {
        if gates.actors.contains(actor.id()) {
            return Detail::enabled(Reason::Actor);
        }

        if let Some(group) = gates.groups.iter().find(|g| actor.is_in_group(g)) {
            return Detail::enabled(Reason::Group {
                group: group.clone(),
            });
        }

        if gates.percentage_of_actors > 0.0
            && actor.bucket(&feature.key) * 100.0 < gates.percentage_of_actors
        {
            return Detail::enabled(Reason::PercentageOfActors);
        }
    }

    if gates.percentage_of_time > 0.0 && rng.gen::<f64>() * 100.0 < gates.percentage_of_time {
        return Detail::enabled(Reason::PercentageOfTime);
    }

    Detail {
        enabled: false,
        reason: Reason::Off,
    }
}

/// The result of evaluating a feature, with the gate that decided it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detail {
    pub enabled: bool,
    pub reason: Reason,
}

impl Detail {
    fn enabled(reason: Reason) -> Detail {
        Detail {
            enabled: true,
            reason,
        }
    }
}

/// Reason describes which gate produced an evaluation result.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// No gate was open for this evaluation.
    Off,
    /// The boolean gate is set, so the feature is on for everyone.
    Boolean,
    /// The actor is listed individually.
    Actor,
    /// The actor belongs to an enabled group.
    Group { group: String },
    /// The actor's bucket falls inside the enabled percentage.
    PercentageOfActors,
    /// The random roll for this call fell inside the enabled percentage.
    PercentageOfTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateValue;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use spectral::prelude::*;
    use test_case::test_case;

    #[test]
    fn off_without_gates() {
        let feature = Feature::new("search");
        let detail = evaluate(&feature, Some(&Actor::new("User;1")));
        assert_that!(detail.enabled).is_false();
        assert_that!(detail.reason).is_equal_to(Reason::Off);
    }

    #[test]
    fn boolean_wins_for_everyone() {
        let feature = Feature::new("search").with_gate(GateValue::Boolean(true));
        assert_that!(evaluate(&feature, None).reason).is_equal_to(Reason::Boolean);
        assert_that!(evaluate(&feature, Some(&Actor::new("User;1"))).reason)
            .is_equal_to(Reason::Boolean);
    }

    #[test]
    fn actor_and_group_gates() {
        let feature = Feature::new("search")
            .with_gate(GateValue::Actor("User;1".into()))
            .with_gate(GateValue::Group("admins".into()));

        let listed = Actor::new("User;1");
        let admin = Actor::new("User;2").in_group("admins");
        let other = Actor::new("User;3").in_group("customers");

        assert_that!(evaluate(&feature, Some(&listed)).reason).is_equal_to(Reason::Actor);
        assert_that!(evaluate(&feature, Some(&admin)).reason).is_equal_to(Reason::Group {
            group: "admins".into(),
        });
        assert_that!(evaluate(&feature, Some(&other)).enabled).is_false();
        assert_that!(evaluate(&feature, None).enabled).is_false();
    }

    #[test_case(0.0, false)]
    #[test_case(100.0, true)]
    fn percentage_of_actors_bounds(percentage: f64, enabled: bool) {
        let feature =
            Feature::new("search").with_gate(GateValue::PercentageOfActors(percentage));
        for i in 0..50 {
            let actor = Actor::new(format!("User;{}", i));
            assert_that!(evaluate(&feature, Some(&actor)).enabled).is_equal_to(enabled);
        }
    }

    #[test]
    fn percentage_of_actors_is_monotonic() {
        let low = Feature::new("search").with_gate(GateValue::PercentageOfActors(20.0));
        let high = Feature::new("search").with_gate(GateValue::PercentageOfActors(60.0));

        let mut enabled_low = 0;
        for i in 0..500 {
            let actor = Actor::new(format!("User;{}", i));
            if low.is_enabled(Some(&actor)) {
                enabled_low += 1;
                assert!(high.is_enabled(Some(&actor)));
            }
        }
        // roughly a fifth of actors, with generous slack for hash variance
        assert_that!(enabled_low).is_greater_than(50);
        assert_that!(enabled_low).is_less_than(150);
    }

    #[test]
    fn percentage_of_time_uses_the_roll() {
        let feature = Feature::new("search").with_gate(GateValue::PercentageOfTime(50.0));
        let mut rng = StdRng::seed_from_u64(7);
        let enabled = (0..1000)
            .filter(|_| evaluate_with_rng(&feature, None, &mut rng).enabled)
            .count();
        assert_that!(enabled).is_greater_than(400);
        assert_that!(enabled).is_less_than(600);
    }

    #[test]
    fn reason_serialization() {
        let reason = Reason::Group {
            group: "admins".into(),
        };
        assert_eq!(
            serde_json::to_value(reason).unwrap(),
            json!({"kind": "GROUP", "group": "admins"})
        );
    }
}
