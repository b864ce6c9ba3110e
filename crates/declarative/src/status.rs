//! Condition bookkeeping on the Manifest status.
//!
//! Conditions are keyed by type. An upsert only moves
//! `lastTransitionTime` when the status value actually flips.

use chrono::Utc;
use crds::{Condition, ConditionStatus};

/// Condition tracking whether rendered resources were parsed.
pub const CONDITION_TYPE_RESOURCES: &str = "Resources";
/// Condition tracking whether the installation is applied and ready.
pub const CONDITION_TYPE_INSTALLATION: &str = "Installation";

/// Reason of the resources condition.
pub const CONDITION_REASON_RESOURCES_AVAILABLE: &str = "ResourcesAvailable";
/// Reason of the installation condition.
pub const CONDITION_REASON_READY: &str = "Ready";

/// Resources condition in its initial False state.
#[must_use]
pub fn resources_condition(generation: Option<i64>) -> Condition {
    Condition {
        type_: CONDITION_TYPE_RESOURCES.to_string(),
        status: ConditionStatus::False,
        reason: CONDITION_REASON_RESOURCES_AVAILABLE.to_string(),
        message: "resources are parsed and ready for use".to_string(),
        observed_generation: generation,
        last_transition_time: None,
    }
}

/// Installation condition in its initial False state.
#[must_use]
pub fn installation_condition(generation: Option<i64>) -> Condition {
    Condition {
        type_: CONDITION_TYPE_INSTALLATION.to_string(),
        status: ConditionStatus::False,
        reason: CONDITION_REASON_READY.to_string(),
        message: "installation is ready and resources can be used".to_string(),
        observed_generation: generation,
        last_transition_time: None,
    }
}

/// Condition of type `type_`, if present.
#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of type `type_` is True.
#[must_use]
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Inserts or updates a condition.
///
/// Returns whether the status value changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let flipped = existing.status != condition.status;
            if flipped {
                existing.last_transition_time = Some(Utc::now());
            }
            existing.status = condition.status;
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
            flipped
        }
        None => {
            if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(Utc::now());
            }
            conditions.push(condition);
            true
        }
    }
}

/// Inserts a condition only if no condition of that type exists.
pub fn set_condition_if_absent(conditions: &mut Vec<Condition>, condition: Condition) {
    if find_condition(conditions, &condition.type_).is_none() {
        set_condition(conditions, condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_transition_time_only_moves_on_flip() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, resources_condition(Some(1)));
        let past = Utc::now() - Duration::hours(1);
        conditions[0].last_transition_time = Some(past);

        let mut same = resources_condition(Some(2));
        same.message = "updated".to_string();
        assert!(!set_condition(&mut conditions, same));
        assert_eq!(conditions[0].last_transition_time, Some(past));
        assert_eq!(conditions[0].message, "updated");
        assert_eq!(conditions[0].observed_generation, Some(2));

        let mut flipped = resources_condition(Some(2));
        flipped.status = ConditionStatus::True;
        assert!(set_condition(&mut conditions, flipped));
        assert!(conditions[0].last_transition_time.unwrap() > past);
    }

    #[test]
    fn test_set_if_absent_keeps_existing() {
        let mut conditions = Vec::new();
        let mut ready = installation_condition(Some(1));
        ready.status = ConditionStatus::True;
        set_condition(&mut conditions, ready);

        set_condition_if_absent(&mut conditions, installation_condition(Some(1)));
        set_condition_if_absent(&mut conditions, resources_condition(Some(1)));

        assert_eq!(conditions.len(), 2);
        assert!(is_condition_true(&conditions, CONDITION_TYPE_INSTALLATION));
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_RESOURCES));
    }

    #[test]
    fn test_order_is_insertion_order() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, installation_condition(None));
        set_condition(&mut conditions, resources_condition(None));
        assert_eq!(conditions[0].type_, CONDITION_TYPE_INSTALLATION);
        assert_eq!(conditions[1].type_, CONDITION_TYPE_RESOURCES);
    }
}
