//! Differ - Compare the last applied desired state with a new one
//!
//! The comparison is value by value over the active values of both states.
//! Whether a change can be applied in place is decided by the property
//! specs: the new spec for properties that are still declared, the prior
//! spec for properties that were removed.

use std::collections::BTreeSet;

use crate::plan::ReconciliationPlan;
use crate::property::DesiredState;
use crate::value::Record;

/// Error computing a diff
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiffError {
    #[error("Required property '{name}' was removed")]
    MissingRequiredProperty { name: String },
}

/// Compute the plan that takes `prior` to `desired`
pub fn diff(prior: &DesiredState, desired: &DesiredState) -> Result<ReconciliationPlan, DiffError> {
    for spec in prior.properties.iter() {
        if spec.is_required() && desired.properties.get(&spec.name).is_none() {
            return Err(DiffError::MissingRequiredProperty {
                name: spec.name.clone(),
            });
        }
    }

    let changed = find_changed_properties(&prior.values, &desired.values);

    let replacement_causes = changed
        .iter()
        .filter(|name| {
            desired
                .properties
                .get(name)
                .or_else(|| prior.properties.get(name))
                .is_some_and(|spec| spec.forces_replacement())
        })
        .cloned()
        .collect();

    Ok(ReconciliationPlan::from_changes(changed, replacement_causes))
}

/// Names whose values differ, including presence on only one side
fn find_changed_properties(prior: &Record, desired: &Record) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();

    for (key, desired_value) in desired {
        match prior.get(key) {
            Some(prior_value) if prior_value == desired_value => {}
            _ => {
                changed.insert(key.clone());
            }
        }
    }

    for key in prior.keys() {
        if !desired.contains_key(key) {
            changed.insert(key.clone());
        }
    }

    changed
}

/// Payload for an in-place update: new values of the changed properties,
/// with removed properties set to `Null`
pub fn update_payload(plan: &ReconciliationPlan, desired: &DesiredState) -> Record {
    plan.changed_properties
        .iter()
        .map(|name| {
            let value = desired
                .values
                .get(name)
                .cloned()
                .unwrap_or(crate::value::Value::Null);
            (name.clone(), value)
        })
        .collect()
}
