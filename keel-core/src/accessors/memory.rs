//! In-memory accessor
//!
//! Simulates a remote API inside the process. Identifiers are the configured
//! prefix followed by a counter (`R1`, `R2`, ...). Deletion can be made to
//! lag behind the delete request so that destroy verification has to poll,
//! and failures can be injected per operation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::accessor::{Accessor, AccessorError, AccessorErrorKind, AccessorResult, BoxFuture};
use crate::resource::{RemoteState, ResourceId};
use crate::value::Record;

pub const STATUS_AVAILABLE: &str = "AVAILABLE";
pub const STATUS_TERMINATING: &str = "TERMINATING";

/// Accessor operation, used for failure injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

/// Number of calls per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub read: usize,
    pub update: usize,
    pub delete: usize,
}

#[derive(Debug, Clone)]
struct StoredResource {
    id: ResourceId,
    attributes: Record,
    status: String,
    /// Reads left before a pending deletion completes
    deleting: Option<u32>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    resources: HashMap<String, StoredResource>,
    calls: CallCounts,
    failures: VecDeque<(Operation, AccessorErrorKind, String)>,
}

/// Shared in-memory remote
#[derive(Debug)]
pub struct MemoryAccessor {
    prefix: String,
    /// Reads that still see the resource after a delete request
    deletion_lag: u32,
    /// Status reported forever once deleted, instead of not-found
    tombstone: Option<String>,
    inner: Mutex<MemoryState>,
}

impl MemoryAccessor {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            deletion_lag: 0,
            tombstone: None,
            inner: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_deletion_lag(mut self, reads: u32) -> Self {
        self.deletion_lag = reads;
        self
    }

    /// Keep deleted resources readable with the given terminal status
    pub fn with_tombstone(mut self, status: impl Into<String>) -> Self {
        self.tombstone = Some(status.into());
        self
    }

    /// Make the next call of `operation` fail with the given kind
    pub fn inject_failure(
        &self,
        operation: Operation,
        kind: AccessorErrorKind,
        message: impl Into<String>,
    ) {
        if let Ok(mut state) = self.inner.lock() {
            state.failures.push_back((operation, kind, message.into()));
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.inner.lock().map(|s| s.calls).unwrap_or_default()
    }

    /// Stored attributes of a live resource
    pub fn get(&self, identifier: &str) -> Option<Record> {
        let state = self.inner.lock().ok()?;
        state
            .resources
            .get(identifier)
            .filter(|r| r.deleting.is_none())
            .map(|r| r.attributes.clone())
    }

    /// Number of resources not yet fully deleted
    pub fn len(&self) -> usize {
        let tombstone = self.tombstone.as_deref();
        self.inner
            .lock()
            .map(|s| {
                s.resources
                    .values()
                    .filter(|r| Some(r.status.as_str()) != tombstone)
                    .count()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> AccessorResult<MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| AccessorError::new("memory accessor state is poisoned"))
    }

    /// Count the call and pop an injected failure for it, if any
    fn begin(state: &mut MemoryState, operation: Operation) -> AccessorResult<()> {
        match operation {
            Operation::Create => state.calls.create += 1,
            Operation::Read => state.calls.read += 1,
            Operation::Update => state.calls.update += 1,
            Operation::Delete => state.calls.delete += 1,
        }

        let position = state.failures.iter().position(|(op, _, _)| *op == operation);
        match position.and_then(|p| state.failures.remove(p)) {
            Some((_, kind, message)) => Err(AccessorError {
                kind,
                ..AccessorError::new(message)
            }),
            None => Ok(()),
        }
    }

    fn not_found(id: &ResourceId, identifier: &str) -> AccessorError {
        AccessorError::not_found(format!("resource {} not found", identifier))
            .for_resource(id.clone())
    }

    fn to_state(identifier: &str, stored: &StoredResource) -> RemoteState {
        RemoteState::new(stored.id.clone(), stored.status.clone())
            .with_identifier(identifier)
            .with_attributes(stored.attributes.clone())
    }

    fn do_create(&self, id: &ResourceId, payload: &Record) -> AccessorResult<RemoteState> {
        let mut state = self.lock()?;
        Self::begin(&mut state, Operation::Create)?;

        state.next_id += 1;
        let identifier = format!("{}{}", self.prefix, state.next_id);
        let stored = StoredResource {
            id: id.clone(),
            attributes: payload
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            status: STATUS_AVAILABLE.to_string(),
            deleting: None,
        };
        let remote = Self::to_state(&identifier, &stored);
        state.resources.insert(identifier, stored);
        Ok(remote)
    }

    fn do_read(&self, id: &ResourceId, identifier: &str) -> AccessorResult<RemoteState> {
        let mut state = self.lock()?;
        Self::begin(&mut state, Operation::Read)?;

        let Some(stored) = state.resources.get_mut(identifier) else {
            return Err(Self::not_found(id, identifier));
        };

        match stored.deleting {
            Some(0) => match &self.tombstone {
                Some(status) => {
                    stored.status = status.clone();
                    stored.deleting = None;
                    Ok(Self::to_state(identifier, stored))
                }
                None => {
                    state.resources.remove(identifier);
                    Err(Self::not_found(id, identifier))
                }
            },
            Some(remaining) => {
                stored.deleting = Some(remaining - 1);
                Ok(Self::to_state(identifier, stored))
            }
            None => Ok(Self::to_state(identifier, stored)),
        }
    }

    fn do_update(
        &self,
        id: &ResourceId,
        identifier: &str,
        changed: &Record,
    ) -> AccessorResult<RemoteState> {
        let mut state = self.lock()?;
        Self::begin(&mut state, Operation::Update)?;

        let tombstone = self.tombstone.as_deref();
        let Some(stored) = state
            .resources
            .get_mut(identifier)
            .filter(|r| r.deleting.is_none() && Some(r.status.as_str()) != tombstone)
        else {
            return Err(Self::not_found(id, identifier));
        };

        for (key, value) in changed {
            if value.is_null() {
                stored.attributes.remove(key);
            } else {
                stored.attributes.insert(key.clone(), value.clone());
            }
        }
        Ok(Self::to_state(identifier, stored))
    }

    fn do_delete(&self, id: &ResourceId, identifier: &str) -> AccessorResult<()> {
        let mut state = self.lock()?;
        Self::begin(&mut state, Operation::Delete)?;

        let tombstone = self.tombstone.as_deref();
        let live = state
            .resources
            .get(identifier)
            .is_some_and(|r| r.deleting.is_none() && Some(r.status.as_str()) != tombstone);
        if !live {
            return Err(Self::not_found(id, identifier));
        }

        if self.deletion_lag == 0 && self.tombstone.is_none() {
            state.resources.remove(identifier);
        } else if let Some(stored) = state.resources.get_mut(identifier) {
            stored.status = STATUS_TERMINATING.to_string();
            stored.deleting = Some(self.deletion_lag);
        }
        Ok(())
    }
}

impl Accessor for MemoryAccessor {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn create(
        &self,
        id: &ResourceId,
        payload: &Record,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        let result = self.do_create(id, payload);
        Box::pin(async move { result })
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: &str,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        let result = self.do_read(id, identifier);
        Box::pin(async move { result })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        changed: &Record,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        let result = self.do_update(id, identifier, changed);
        Box::pin(async move { result })
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, AccessorResult<()>> {
        let result = self.do_delete(id, identifier);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn id() -> ResourceId {
        ResourceId::new("widget", "a")
    }

    fn payload() -> Record {
        Record::from([("name".to_string(), Value::from("widget-a"))])
    }

    #[tokio::test]
    async fn create_assigns_sequential_identifiers() {
        let accessor = MemoryAccessor::new("R");
        let first = accessor.create(&id(), &payload()).await.unwrap();
        let second = accessor.create(&id(), &payload()).await.unwrap();

        assert_eq!(first.identifier.as_deref(), Some("R1"));
        assert_eq!(second.identifier.as_deref(), Some("R2"));
        assert_eq!(first.lifecycle_status, STATUS_AVAILABLE);
        assert_eq!(accessor.len(), 2);
    }

    #[tokio::test]
    async fn update_merges_and_null_removes() {
        let accessor = MemoryAccessor::new("R");
        accessor.create(&id(), &payload()).await.unwrap();

        let changed = Record::from([
            ("name".to_string(), Value::Null),
            ("size".to_string(), Value::from("20")),
        ]);
        let state = accessor.update(&id(), "R1", &changed).await.unwrap();

        assert_eq!(state.attributes.get("name"), None);
        assert_eq!(state.attributes.get("size"), Some(&Value::from("20")));
    }

    #[tokio::test]
    async fn deletion_lag_keeps_resource_readable() {
        let accessor = MemoryAccessor::new("R").with_deletion_lag(2);
        accessor.create(&id(), &payload()).await.unwrap();
        accessor.delete(&id(), "R1").await.unwrap();

        for _ in 0..2 {
            let state = accessor.read(&id(), "R1").await.unwrap();
            assert_eq!(state.lifecycle_status, STATUS_TERMINATING);
        }
        let err = accessor.read(&id(), "R1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(accessor.is_empty());
    }

    #[tokio::test]
    async fn tombstone_reports_terminal_status() {
        let accessor = MemoryAccessor::new("R").with_tombstone("DELETED");
        accessor.create(&id(), &payload()).await.unwrap();
        accessor.delete(&id(), "R1").await.unwrap();

        let state = accessor.read(&id(), "R1").await.unwrap();
        assert_eq!(state.lifecycle_status, "DELETED");
        assert!(accessor.is_empty());
        assert!(accessor.delete(&id(), "R1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let accessor = MemoryAccessor::new("R");
        accessor.inject_failure(Operation::Create, AccessorErrorKind::Other, "quota exceeded");

        let err = accessor.create(&id(), &payload()).await.unwrap_err();
        assert_eq!(err.message, "quota exceeded");
        assert!(accessor.create(&id(), &payload()).await.is_ok());
        assert_eq!(accessor.calls().create, 2);
    }
}
