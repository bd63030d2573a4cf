//! State file structures for persisting reconciliation records

use chrono::{DateTime, Utc};
use keel_core::reconciler::Snapshot;
use keel_core::resource::{LifecycleState, ResourceId};
use serde::{Deserialize, Serialize};

/// The main state file structure that persists to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// State file format version
    pub version: u32,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    /// Version of Keel that last modified this state
    pub keel_version: String,
    /// Records of all managed resources
    pub resources: Vec<ResourceRecord>,
}

impl StateFile {
    /// Current state file format version
    pub const CURRENT_VERSION: u32 = 1;

    /// Create a new empty state file
    pub fn new() -> Self {
        Self::with_lineage(uuid::Uuid::new_v4().to_string())
    }

    /// Create a new state file with a specific lineage
    pub fn with_lineage(lineage: String) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage,
            keel_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: Vec::new(),
        }
    }

    /// Increment serial and update keel version for a new state write
    pub fn increment_serial(&mut self) {
        self.serial += 1;
        self.keel_version = env!("CARGO_PKG_VERSION").to_string();
    }

    /// Find a resource by type and name
    pub fn find_resource(&self, id: &ResourceId) -> Option<&ResourceRecord> {
        self.resources
            .iter()
            .find(|r| r.resource_type == id.resource_type && r.name == id.name)
    }

    fn find_resource_mut(&mut self, id: &ResourceId) -> Option<&mut ResourceRecord> {
        self.resources
            .iter_mut()
            .find(|r| r.resource_type == id.resource_type && r.name == id.name)
    }

    /// Add or update a resource record
    pub fn upsert_resource(&mut self, record: ResourceRecord) {
        if let Some(existing) = self.find_resource_mut(&record.id()) {
            *existing = record;
        } else {
            self.resources.push(record);
        }
    }

    /// Remove a resource record
    pub fn remove_resource(&mut self, id: &ResourceId) -> Option<ResourceRecord> {
        let pos = self
            .resources
            .iter()
            .position(|r| r.resource_type == id.resource_type && r.name == id.name)?;
        Some(self.resources.remove(pos))
    }

    /// Store a reconciler snapshot, dropping the record once the resource is absent
    pub fn record_snapshot(&mut self, id: &ResourceId, accessor: &str, snapshot: Snapshot) {
        if snapshot.state == LifecycleState::Absent {
            self.remove_resource(id);
        } else {
            self.upsert_resource(ResourceRecord::new(id, accessor, snapshot));
        }
    }
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Persisted record of a single managed resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource type (e.g., "database_db_home")
    pub resource_type: String,
    /// Logical resource name
    pub name: String,
    /// Accessor that manages the resource (e.g., "file")
    pub accessor: String,
    /// Reconciler memory: identifier, lifecycle and last applied desired state
    pub snapshot: Snapshot,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn new(id: &ResourceId, accessor: impl Into<String>, snapshot: Snapshot) -> Self {
        Self {
            resource_type: id.resource_type.clone(),
            name: id.name.clone(),
            accessor: accessor.into(),
            snapshot,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.resource_type.clone(), self.name.clone())
    }

    pub fn identifier(&self) -> Option<&str> {
        self.snapshot.identifier.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::property::{Phase, PropertySet, PropertySpec};

    fn snapshot(identifier: &str) -> Snapshot {
        let properties =
            PropertySet::new(vec![PropertySpec::required("name", "widget-a")]).unwrap();
        Snapshot {
            state: LifecycleState::Present,
            identifier: Some(identifier.to_string()),
            time_created: Some(Utc::now()),
            applied: Some(properties.resolve(Phase::Create)),
        }
    }

    #[test]
    fn test_state_file_new() {
        let state = StateFile::new();
        assert_eq!(state.version, StateFile::CURRENT_VERSION);
        assert_eq!(state.serial, 0);
        assert!(!state.lineage.is_empty());
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_state_file_increment_serial() {
        let mut state = StateFile::new();
        state.increment_serial();
        state.increment_serial();
        assert_eq!(state.serial, 2);
    }

    #[test]
    fn test_state_file_upsert_resource() {
        let mut state = StateFile::new();
        let id = ResourceId::new("widget", "main");

        state.upsert_resource(ResourceRecord::new(&id, "memory", snapshot("R1")));
        state.upsert_resource(ResourceRecord::new(&id, "memory", snapshot("R2")));

        assert_eq!(state.resources.len(), 1);
        assert_eq!(state.find_resource(&id).unwrap().identifier(), Some("R2"));
    }

    #[test]
    fn test_record_snapshot_removes_absent_resources() {
        let mut state = StateFile::new();
        let id = ResourceId::new("widget", "main");
        state.record_snapshot(&id, "memory", snapshot("R1"));
        assert_eq!(state.resources.len(), 1);

        let gone = Snapshot {
            state: LifecycleState::Absent,
            identifier: None,
            time_created: None,
            applied: None,
        };
        state.record_snapshot(&id, "memory", gone);
        assert!(state.resources.is_empty());
        assert!(state.remove_resource(&id).is_none());
    }

    #[test]
    fn test_state_file_serialization() {
        let mut state = StateFile::new();
        let id = ResourceId::new("widget", "main");
        state.upsert_resource(ResourceRecord::new(&id, "memory", snapshot("R1")));

        let json = serde_json::to_string_pretty(&state).unwrap();
        let deserialized: StateFile = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.lineage, state.lineage);
        assert_eq!(
            deserialized.find_resource(&id).unwrap().snapshot,
            state.find_resource(&id).unwrap().snapshot
        );
    }
}
