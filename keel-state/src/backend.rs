//! Where reconciler snapshots are persisted, and who may write them

use std::collections::HashMap;

use async_trait::async_trait;
use keel_core::value::Value;
use thiserror::Error;

use crate::lock::LockInfo;
use crate::state::StateFile;

#[derive(Debug, Error)]
pub enum BackendError {
    /// Another run holds the lock and it has not expired
    #[error("{who} holds the state lock for {operation} (lock {lock_id})")]
    Locked {
        lock_id: String,
        who: String,
        operation: String,
    },

    #[error("No lock with ID {0}")]
    LockNotFound(String),

    /// The stored lock belongs to someone else
    #[error("Held lock is {actual}, not {expected}")]
    LockMismatch { expected: String, actual: String },

    #[error("Unknown backend '{0}'")]
    UnsupportedBackend(String),

    #[error("Bad backend settings: {0}")]
    Configuration(String),

    /// Stored state that cannot be used, e.g. a newer format version
    #[error("Unusable state: {0}")]
    InvalidState(String),

    /// The write targets a different state history than the stored one
    #[error("State belongs to lineage {expected}, write has {actual}")]
    LineageMismatch { expected: String, actual: String },

    /// A write would not advance the serial of the stored state
    #[error("Stale state: stored serial is {stored}, write has {attempted}")]
    StaleSerial { stored: u64, attempted: u64 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Contention error naming the current holder of `lock`
    pub fn held_by(lock: &LockInfo) -> Self {
        Self::Locked {
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Durable home for a [`StateFile`]
///
/// Every apply or destroy runs between `acquire_lock` and `release_lock`, and
/// writes the state once per resource so a crash loses at most one
/// reconciler's progress.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// `None` until the first write
    async fn read_state(&self) -> BackendResult<Option<StateFile>>;

    /// Replace the stored state
    ///
    /// Callers bump the serial first. The backend refuses a foreign lineage
    /// and any serial not above the stored one.
    async fn write_state(&self, state: &StateFile) -> BackendResult<()>;

    /// Take the lock for `operation`; an expired lock is taken over
    async fn acquire_lock(&self, operation: &str) -> BackendResult<LockInfo>;

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()>;

    /// Drop the lock with `lock_id` whoever holds it
    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()>;

    /// Make sure the storage location exists
    async fn init(&self) -> BackendResult<()>;
}

/// Backend selection as it appears in settings: a type plus loose attributes
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub backend_type: String,
    pub attributes: HashMap<String, Value>,
}

impl BackendConfig {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            backend_type: "local".to_string(),
            attributes: HashMap::from([("path".to_string(), Value::String(path.into()))]),
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer attribute; other value types read as unset
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(Value::Int(n)) => Some(*n),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_error_names_holder() {
        let lock = LockInfo::new("apply");
        let error = BackendError::held_by(&lock);

        match error {
            BackendError::Locked {
                lock_id,
                who,
                operation,
            } => {
                assert_eq!(lock_id, lock.id);
                assert_eq!(who, lock.who);
                assert_eq!(operation, "apply");
            }
            _ => panic!("Expected Locked error"),
        }
    }

    #[test]
    fn test_backend_error_display() {
        let error = BackendError::UnsupportedBackend("s3".to_string());
        assert_eq!(error.to_string(), "Unknown backend 's3'");

        let error = BackendError::StaleSerial {
            stored: 4,
            attempted: 4,
        };
        assert_eq!(
            error.to_string(),
            "Stale state: stored serial is 4, write has 4"
        );
    }

    #[test]
    fn test_backend_config_attributes() {
        let mut config = BackendConfig::local("state/keel.state.json");
        config
            .attributes
            .insert("lock_ttl_secs".to_string(), Value::Int(60));

        assert_eq!(config.get_string("path"), Some("state/keel.state.json"));
        assert_eq!(config.get_int("lock_ttl_secs"), Some(60));
        assert_eq!(config.get_int("path"), None);
    }
}
