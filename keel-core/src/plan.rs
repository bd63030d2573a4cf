//! Plan - What a reconciliation pass decided to do
//!
//! A plan is derived fresh on every pass from the difference between the last
//! applied desired state and the new one. It is never persisted.

use std::collections::BTreeSet;
use std::fmt;

/// Action taken for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    NoOp,
    UpdateInPlace,
    Replace,
}

impl Action {
    pub fn symbol(&self) -> &'static str {
        match self {
            Action::NoOp => " ",
            Action::UpdateInPlace => "~",
            Action::Replace => "-/+",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::NoOp => write!(f, "no-op"),
            Action::UpdateInPlace => write!(f, "update in place"),
            Action::Replace => write!(f, "replace"),
        }
    }
}

/// Result of diffing two desired states
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationPlan {
    pub action: Action,
    /// Properties whose active values differ
    pub changed_properties: BTreeSet<String>,
    /// True if any changed property cannot be updated in place
    pub forces_replacement: bool,
    /// The changed properties that force replacement
    pub replacement_causes: BTreeSet<String>,
    /// True when this pass created the resource (the action is then `NoOp`
    /// relative to the empty prior)
    pub created: bool,
}

impl ReconciliationPlan {
    pub fn no_op() -> Self {
        Self {
            action: Action::NoOp,
            changed_properties: BTreeSet::new(),
            forces_replacement: false,
            replacement_causes: BTreeSet::new(),
            created: false,
        }
    }

    /// Plan for a pass that creates the resource from nothing
    pub fn creation() -> Self {
        Self {
            created: true,
            ..Self::no_op()
        }
    }

    /// Build a plan from the changed and replacement-forcing property names
    pub fn from_changes(changed: BTreeSet<String>, replacement_causes: BTreeSet<String>) -> Self {
        let forces_replacement = !replacement_causes.is_empty();
        let action = if changed.is_empty() {
            Action::NoOp
        } else if forces_replacement {
            Action::Replace
        } else {
            Action::UpdateInPlace
        };

        Self {
            action,
            changed_properties: changed,
            forces_replacement,
            replacement_causes,
            created: false,
        }
    }

    pub fn is_change(&self) -> bool {
        self.created || self.action != Action::NoOp
    }
}

impl fmt::Display for ReconciliationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.created {
            return write!(f, "create");
        }
        match self.action {
            Action::NoOp => write!(f, "no changes"),
            Action::UpdateInPlace => {
                let names: Vec<&str> = self.changed_properties.iter().map(String::as_str).collect();
                write!(f, "update in place ({})", names.join(", "))
            }
            Action::Replace => {
                let names: Vec<&str> = self.replacement_causes.iter().map(String::as_str).collect();
                write!(f, "replace (forced by {})", names.join(", "))
            }
        }
    }
}
