//! Accessor - Trait abstracting the remote API of one resource type
//!
//! An Accessor performs the actual create/read/update/delete calls. Transport,
//! authentication and retry policy all live behind it; the reconciler treats
//! each call as a single logical request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::resource::{RemoteState, ResourceId};
use crate::value::Record;

/// Classification of accessor failures the reconciler reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessorErrorKind {
    /// The resource does not exist (the "already gone" signal)
    NotFound,
    /// The call was interrupted by the caller's cancellation
    Cancelled,
    Other,
}

/// Error type for Accessor operations
#[derive(Debug)]
pub struct AccessorError {
    pub kind: AccessorErrorKind,
    pub message: String,
    pub resource_id: Option<ResourceId>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for AccessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AccessorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl AccessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: AccessorErrorKind::Other,
            message: message.into(),
            resource_id: None,
            cause: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: AccessorErrorKind::NotFound,
            ..Self::new(message)
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: AccessorErrorKind::Cancelled,
            ..Self::new(message)
        }
    }

    pub fn for_resource(mut self, id: ResourceId) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == AccessorErrorKind::NotFound
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == AccessorErrorKind::Cancelled
    }
}

pub type AccessorResult<T> = Result<T, AccessorError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Remote API for one or more resource types
///
/// Implementations must be safe to share between independent reconcilers.
pub trait Accessor: Send + Sync {
    /// Name of this Accessor (e.g., "memory")
    fn name(&self) -> &'static str;

    /// Create a resource from a request payload
    ///
    /// The returned state must carry the remote-assigned identifier.
    fn create(
        &self,
        id: &ResourceId,
        payload: &Record,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>>;

    /// Read the current state of a resource
    ///
    /// Returns an error of kind `NotFound` if the resource does not exist.
    fn read(
        &self,
        id: &ResourceId,
        identifier: &str,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>>;

    /// Update a resource in place with the changed properties only
    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        changed: &Record,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>>;

    /// Request deletion of a resource
    ///
    /// Deletion may complete asynchronously; callers verify it through `read`.
    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, AccessorResult<()>>;
}

impl Accessor for Box<dyn Accessor> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn create(
        &self,
        id: &ResourceId,
        payload: &Record,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        (**self).create(id, payload)
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: &str,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        (**self).read(id, identifier)
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        changed: &Record,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        (**self).update(id, identifier, changed)
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, AccessorResult<()>> {
        (**self).delete(id, identifier)
    }
}

/// Shared accessor, so independent reconcilers can use one client
impl<A: Accessor + ?Sized> Accessor for Arc<A> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn create(
        &self,
        id: &ResourceId,
        payload: &Record,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        (**self).create(id, payload)
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: &str,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        (**self).read(id, identifier)
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        changed: &Record,
    ) -> BoxFuture<'_, AccessorResult<RemoteState>> {
        (**self).update(id, identifier, changed)
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, AccessorResult<()>> {
        (**self).delete(id, identifier)
    }
}
