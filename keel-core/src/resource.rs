//! Resource - Identity and observed state of managed resources

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::{Record, Value};

/// Logical identifier for a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    /// Resource type (e.g., "database_db_home")
    pub resource_type: String,
    /// Resource name as declared by the caller
    pub name: String,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// State observed on the remote system during one reconciliation pass
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteState {
    pub id: ResourceId,
    /// Remote-assigned identifier (e.g., an OCID)
    pub identifier: Option<String>,
    pub attributes: Record,
    /// Lifecycle status reported by the remote (e.g., "AVAILABLE", "DELETED")
    pub lifecycle_status: String,
    pub time_created: Option<DateTime<Utc>>,
    /// Discriminator value of the decoded response body, if the kind has one
    pub variant: Option<String>,
}

impl RemoteState {
    pub fn new(id: ResourceId, lifecycle_status: impl Into<String>) -> Self {
        Self {
            id,
            identifier: None,
            attributes: Record::new(),
            lifecycle_status: lifecycle_status.into(),
            time_created: None,
            variant: None,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Record) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_time_created(mut self, time_created: DateTime<Utc>) -> Self {
        self.time_created = Some(time_created);
        self
    }
}

/// Per resource type configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceKind {
    pub resource_type: String,
    /// Lifecycle statuses that mean the resource is gone
    #[serde(default = "default_deleted_statuses")]
    pub deleted_statuses: Vec<String>,
    /// Field selecting the variant of response bodies, for polymorphic types
    #[serde(default)]
    pub discriminator: Option<String>,
}

fn default_deleted_statuses() -> Vec<String> {
    vec!["DELETED".to_string(), "TERMINATED".to_string()]
}

impl ResourceKind {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            deleted_statuses: default_deleted_statuses(),
            discriminator: None,
        }
    }

    pub fn with_deleted_statuses<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deleted_statuses = statuses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_discriminator(mut self, field: impl Into<String>) -> Self {
        self.discriminator = Some(field.into());
        self
    }

    /// Returns true if `status` is a terminal deleted status for this kind
    pub fn is_deleted(&self, status: &str) -> bool {
        self.deleted_statuses.iter().any(|s| s == status)
    }

    pub fn resource_id(&self, name: impl Into<String>) -> ResourceId {
        ResourceId::new(self.resource_type.clone(), name)
    }
}

/// Reconciler-side lifecycle of one resource instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Absent,
    Creating,
    Present,
    Updating,
    Replacing,
    Deleting,
    DeleteFailed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Absent => "absent",
            LifecycleState::Creating => "creating",
            LifecycleState::Present => "present",
            LifecycleState::Updating => "updating",
            LifecycleState::Replacing => "replacing",
            LifecycleState::Deleting => "deleting",
            LifecycleState::DeleteFailed => "delete_failed",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_defaults_to_deleted_and_terminated() {
        let kind = ResourceKind::new("database_db_home");
        assert!(kind.is_deleted("DELETED"));
        assert!(kind.is_deleted("TERMINATED"));
        assert!(!kind.is_deleted("TERMINATING"));
    }

    #[test]
    fn kind_from_json_uses_default_statuses() {
        let kind: ResourceKind =
            serde_json::from_str(r#"{"resource_type": "core_vcn"}"#).unwrap();
        assert_eq!(kind, ResourceKind::new("core_vcn"));
    }

    #[test]
    fn resource_id_display() {
        assert_eq!(
            ResourceId::new("core_vcn", "main").to_string(),
            "core_vcn.main"
        );
    }
}
