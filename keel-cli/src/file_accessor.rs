// File-backed Accessor: a stand-in remote that keeps resources in a JSON file

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::value::{record_from_json, record_to_json};
use keel_core::{
    Accessor, AccessorError, AccessorResult, BoxFuture, Record, RemoteState, ResourceId,
};

pub const DEFAULT_REMOTE_FILE: &str = ".keel/remote.json";

const STATUS_AVAILABLE: &str = "AVAILABLE";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RemoteFile {
    next_id: u64,
    resources: BTreeMap<String, StoredResource>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredResource {
    resource_type: String,
    name: String,
    status: String,
    time_created: DateTime<Utc>,
    attributes: serde_json::Value,
}

pub struct FileAccessor {
    path: PathBuf,
}

impl FileAccessor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> AccessorResult<RemoteFile> {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                AccessorError::new(format!("Failed to parse {}", self.path.display())).with_cause(e)
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RemoteFile::default()),
            Err(e) => Err(
                AccessorError::new(format!("Failed to read {}", self.path.display())).with_cause(e),
            ),
        }
    }

    fn save(&self, remote: &RemoteFile) -> AccessorResult<()> {
        let save_error =
            |e: std::io::Error| AccessorError::new("Failed to save remote state").with_cause(e);

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(save_error)?;
        }
        let content = serde_json::to_string_pretty(remote)
            .map_err(|e| AccessorError::new("Failed to serialize remote state").with_cause(e))?;
        fs::write(&self.path, content).map_err(save_error)
    }

    fn not_found(id: &ResourceId, identifier: &str) -> AccessorError {
        AccessorError::not_found(format!("{} does not exist", identifier)).for_resource(id.clone())
    }

    fn to_state(id: &ResourceId, identifier: &str, stored: &StoredResource) -> RemoteState {
        RemoteState::new(id.clone(), stored.status.clone())
            .with_identifier(identifier)
            .with_attributes(record_from_json(stored.attributes.clone()).unwrap_or_default())
            .with_time_created(stored.time_created)
    }

    fn do_create(&self, id: &ResourceId, payload: &Record) -> AccessorResult<RemoteState> {
        let mut remote = self.load()?;
        remote.next_id += 1;
        let identifier = format!("{}.{}", id.resource_type, remote.next_id);

        let attributes: Record = payload
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let stored = StoredResource {
            resource_type: id.resource_type.clone(),
            name: id.name.clone(),
            status: STATUS_AVAILABLE.to_string(),
            time_created: Utc::now(),
            attributes: record_to_json(&attributes),
        };
        let state = Self::to_state(id, &identifier, &stored);

        remote.resources.insert(identifier, stored);
        self.save(&remote)?;
        Ok(state)
    }

    fn do_read(&self, id: &ResourceId, identifier: &str) -> AccessorResult<RemoteState> {
        let remote = self.load()?;
        remote
            .resources
            .get(identifier)
            .map(|stored| Self::to_state(id, identifier, stored))
            .ok_or_else(|| Self::not_found(id, identifier))
    }

    fn do_update(
        &self,
        id: &ResourceId,
        identifier: &str,
        changed: &Record,
    ) -> AccessorResult<RemoteState> {
        let mut remote = self.load()?;
        let stored = remote
            .resources
            .get_mut(identifier)
            .ok_or_else(|| Self::not_found(id, identifier))?;

        let mut attributes = record_from_json(stored.attributes.clone()).unwrap_or_default();
        for (key, value) in changed {
            if value.is_null() {
                attributes.remove(key);
            } else {
                attributes.insert(key.clone(), value.clone());
            }
        }
        stored.attributes = record_to_json(&attributes);
        let state = Self::to_state(id, identifier, stored);

        self.save(&remote)?;
        Ok(state)
    }

    fn do_delete(&self, id: &ResourceId, identifier: &str) -> AccessorResult<()> {
        let mut remote = self.load()?;
        if remote.resources.remove(identifier).is_none() {
            return Err(Self::not_found(id, identifier));
        }
        self.save(&remote)
    }
}

impl Accessor for FileAccessor {
    fn name(&self) -> &'static str {
        "file"
    }

    fn create(
        &self,
        id: &ResourceId,
        payload: &Record,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        let id = id.clone();
        let payload = payload.clone();
        Box::pin(async move { self.do_create(&id, &payload) })
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: &str,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move { self.do_read(&id, &identifier) })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        changed: &Record,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let changed = changed.clone();
        Box::pin(async move { self.do_update(&id, &identifier, &changed) })
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, AccessorResult<()>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move { self.do_delete(&id, &identifier) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Value;
    use tempfile::tempdir;

    fn payload(name: &str) -> Record {
        Record::from([
            ("name".to_string(), Value::from(name)),
            ("size".to_string(), Value::Int(10)),
            ("note".to_string(), Value::Null),
        ])
    }

    #[tokio::test]
    async fn test_create_read_update_delete() {
        let dir = tempdir().unwrap();
        let accessor = FileAccessor::new(dir.path().join("remote").join("remote.json"));
        let id = ResourceId::new("widget", "main");

        let created = accessor.create(&id, &payload("widget-a")).await.unwrap();
        let identifier = created.identifier.clone().unwrap();
        assert_eq!(identifier, "widget.1");
        assert_eq!(created.lifecycle_status, "AVAILABLE");
        assert!(!created.attributes.contains_key("note"));

        let read = accessor.read(&id, &identifier).await.unwrap();
        assert_eq!(read.attributes.get("size"), Some(&Value::Int(10)));
        assert_eq!(read.time_created, created.time_created);

        let changed = Record::from([
            ("size".to_string(), Value::Int(20)),
            ("name".to_string(), Value::Null),
        ]);
        let updated = accessor.update(&id, &identifier, &changed).await.unwrap();
        assert_eq!(updated.attributes.get("size"), Some(&Value::Int(20)));
        assert!(!updated.attributes.contains_key("name"));

        accessor.delete(&id, &identifier).await.unwrap();
        let err = accessor.read(&id, &identifier).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(accessor.delete(&id, &identifier).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_identifiers_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("remote.json");
        let id = ResourceId::new("widget", "main");

        let first = FileAccessor::new(&path)
            .create(&id, &payload("a"))
            .await
            .unwrap();
        let second = FileAccessor::new(&path)
            .create(&id, &payload("b"))
            .await
            .unwrap();

        assert_ne!(first.identifier, second.identifier);
        assert_eq!(second.identifier.as_deref(), Some("widget.2"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("remote.json");
        fs::write(&path, "[").unwrap();

        let err = FileAccessor::new(&path)
            .read(&ResourceId::new("widget", "main"), "widget.1")
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
    }
}
