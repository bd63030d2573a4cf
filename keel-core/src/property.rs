//! Property - Declared configuration of a resource
//!
//! A resource is configured through a flat table of properties. Each property
//! carries the value used when the resource is created and, if it can be
//! changed in place, the value used for updates. A property without an update
//! value is immutable: changing it forces the resource to be replaced.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{Record, Value};

/// Whether a property must be supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    Required,
    #[default]
    Optional,
}

/// One configurable attribute of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    pub name: String,
    #[serde(default)]
    pub requirement: Requirement,
    #[serde(rename = "create", default, skip_serializing_if = "Option::is_none")]
    pub create_value: Option<Value>,
    /// Absent means the property cannot be updated in place
    #[serde(rename = "update", default, skip_serializing_if = "Option::is_none")]
    pub update_value: Option<Value>,
    /// Assigned by the remote system, never sent
    #[serde(default)]
    pub computed: bool,
    /// Changing this property replaces the resource even if it has an update value
    #[serde(default)]
    pub force_new: bool,
}

impl PropertySpec {
    fn new(name: impl Into<String>, requirement: Requirement) -> Self {
        Self {
            name: name.into(),
            requirement,
            create_value: None,
            update_value: None,
            computed: false,
            force_new: false,
        }
    }

    pub fn required(name: impl Into<String>, create_value: impl Into<Value>) -> Self {
        Self::new(name, Requirement::Required).create(create_value)
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self::new(name, Requirement::Optional)
    }

    pub fn computed(name: impl Into<String>) -> Self {
        let mut spec = Self::new(name, Requirement::Optional);
        spec.computed = true;
        spec
    }

    pub fn create(mut self, value: impl Into<Value>) -> Self {
        self.create_value = Some(value.into());
        self
    }

    pub fn update(mut self, value: impl Into<Value>) -> Self {
        self.update_value = Some(value.into());
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn is_required(&self) -> bool {
        self.requirement == Requirement::Required
    }

    /// A change to this property cannot be applied in place
    pub fn forces_replacement(&self) -> bool {
        self.update_value.is_none() || self.force_new
    }

    /// Value to apply in the given phase
    pub fn active_value(&self, phase: Phase) -> Option<&Value> {
        let value = match phase {
            Phase::Create => self.create_value.as_ref(),
            Phase::Update => self.update_value.as_ref().or(self.create_value.as_ref()),
        };
        value.filter(|v| !v.is_null())
    }
}

/// Error in a property table
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PropertyError {
    #[error("Required property '{name}' has no create value")]
    MissingCreateValue { name: String },

    #[error("Property '{name}' is declared more than once")]
    DuplicateProperty { name: String },
}

/// Validated set of property specs for one resource
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<PropertySpec>", into = "Vec<PropertySpec>")]
pub struct PropertySet {
    properties: Vec<PropertySpec>,
}

impl PropertySet {
    pub fn new(properties: Vec<PropertySpec>) -> Result<Self, PropertyError> {
        let mut seen = HashSet::new();
        for spec in &properties {
            if !seen.insert(spec.name.as_str()) {
                return Err(PropertyError::DuplicateProperty {
                    name: spec.name.clone(),
                });
            }
            let has_create = spec.create_value.as_ref().is_some_and(|v| !v.is_null());
            if spec.is_required() && !spec.computed && !has_create {
                return Err(PropertyError::MissingCreateValue {
                    name: spec.name.clone(),
                });
            }
        }
        Ok(Self { properties })
    }

    pub fn get(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertySpec> {
        self.properties.iter()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Expand the table into the concrete values for a phase
    pub fn resolve(&self, phase: Phase) -> DesiredState {
        let values = self
            .properties
            .iter()
            .filter(|p| !p.computed)
            .filter_map(|p| p.active_value(phase).map(|v| (p.name.clone(), v.clone())))
            .collect();

        DesiredState {
            properties: self.clone(),
            phase,
            values,
        }
    }
}

impl TryFrom<Vec<PropertySpec>> for PropertySet {
    type Error = PropertyError;

    fn try_from(properties: Vec<PropertySpec>) -> Result<Self, Self::Error> {
        Self::new(properties)
    }
}

impl From<PropertySet> for Vec<PropertySpec> {
    fn from(set: PropertySet) -> Self {
        set.properties
    }
}

/// Which value of each property is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Create,
    Update,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Create => write!(f, "create"),
            Phase::Update => write!(f, "update"),
        }
    }
}

/// A property table resolved to the values that should be applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    pub properties: PropertySet,
    pub phase: Phase,
    /// Request payload: active values of all non-computed properties
    pub values: Record,
}

impl DesiredState {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}
