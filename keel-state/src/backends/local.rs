//! Local file backend for state storage
//!
//! State lives in a JSON file (default: keel.state.json) next to a `.lock`
//! file holding the current [`LockInfo`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Duration;
use log::{debug, warn};

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};
use crate::lock::{DEFAULT_LOCK_TTL_SECS, LockInfo};
use crate::state::StateFile;

/// Local file backend
pub struct LocalBackend {
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_ttl: Duration,
}

impl LocalBackend {
    pub const DEFAULT_STATE_FILE: &'static str = "keel.state.json";

    pub fn new() -> Self {
        Self::with_path(PathBuf::from(Self::DEFAULT_STATE_FILE))
    }

    pub fn with_path(state_path: PathBuf) -> Self {
        let lock_path = state_path.with_extension("lock");
        Self {
            state_path,
            lock_path,
            lock_ttl: Duration::seconds(DEFAULT_LOCK_TTL_SECS),
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Build from `path` and optional `lock_ttl_secs` attributes
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let path = config
            .get_string("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_STATE_FILE));
        let mut backend = Self::with_path(path);

        if let Some(secs) = config.get_int("lock_ttl_secs") {
            if secs <= 0 {
                return Err(BackendError::Configuration(format!(
                    "lock_ttl_secs must be positive, got {}",
                    secs
                )));
            }
            backend = backend.with_lock_ttl(Duration::seconds(secs));
        }
        Ok(backend)
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    async fn read_lock(&self) -> BackendResult<Option<LockInfo>> {
        match tokio::fs::read_to_string(&self.lock_path).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| {
                    BackendError::InvalidState(format!("Failed to parse lock file: {}", e))
                }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::Io(format!("Failed to read lock file: {}", e))),
        }
    }

    async fn remove_lock(&self) -> BackendResult<()> {
        tokio::fs::remove_file(&self.lock_path)
            .await
            .map_err(|e| BackendError::Io(format!("Failed to remove lock file: {}", e)))
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    async fn read_state(&self) -> BackendResult<Option<StateFile>> {
        let content = match tokio::fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::Io(format!("Failed to read state file: {}", e))),
        };

        let state: StateFile = serde_json::from_str(&content).map_err(|e| {
            BackendError::InvalidState(format!("Failed to parse state file: {}", e))
        })?;
        if state.version > StateFile::CURRENT_VERSION {
            return Err(BackendError::InvalidState(format!(
                "state file version {} is newer than supported version {}",
                state.version,
                StateFile::CURRENT_VERSION
            )));
        }

        Ok(Some(state))
    }

    async fn write_state(&self, state: &StateFile) -> BackendResult<()> {
        if let Some(stored) = self.read_state().await? {
            if stored.lineage != state.lineage {
                return Err(BackendError::LineageMismatch {
                    expected: stored.lineage,
                    actual: state.lineage.clone(),
                });
            }
            if state.serial <= stored.serial {
                return Err(BackendError::StaleSerial {
                    stored: stored.serial,
                    attempted: state.serial,
                });
            }
        }

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            BackendError::Serialization(format!("Failed to serialize state: {}", e))
        })?;

        // write-then-rename so readers never observe a partial file
        let tmp_path = self.state_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;
        tokio::fs::rename(&tmp_path, &self.state_path)
            .await
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;

        debug!(
            "wrote state serial {} to {}",
            state.serial,
            self.state_path.display()
        );
        Ok(())
    }

    async fn acquire_lock(&self, operation: &str) -> BackendResult<LockInfo> {
        if let Some(existing) = self.read_lock().await? {
            if !existing.is_expired() {
                return Err(BackendError::held_by(&existing));
            }
            warn!(
                "Replacing expired lock {} held by {} since {}",
                existing.id, existing.who, existing.created
            );
            self.remove_lock().await?;
        }

        let lock = LockInfo::with_ttl(operation, self.lock_ttl);
        let content = serde_json::to_string_pretty(&lock)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await;
        match file {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(content.as_bytes())
                    .await
                    .map_err(|e| BackendError::Io(format!("Failed to write lock file: {}", e)))?;
                file.flush()
                    .await
                    .map_err(|e| BackendError::Io(format!("Failed to write lock file: {}", e)))?;
            }
            // lost a race with another writer
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return match self.read_lock().await? {
                    Some(existing) => Err(BackendError::held_by(&existing)),
                    None => Err(BackendError::Io(
                        "lock file disappeared while acquiring".to_string(),
                    )),
                };
            }
            Err(e) => return Err(BackendError::Io(format!("Failed to write lock file: {}", e))),
        }

        debug!("acquired lock {} for {}", lock.id, operation);
        Ok(lock)
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let existing = self
            .read_lock()
            .await?
            .ok_or_else(|| BackendError::LockNotFound(lock.id.clone()))?;

        if existing.id != lock.id {
            return Err(BackendError::LockMismatch {
                expected: lock.id.clone(),
                actual: existing.id,
            });
        }

        self.remove_lock().await
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        let existing = self
            .read_lock()
            .await?
            .ok_or_else(|| BackendError::LockNotFound(lock_id.to_string()))?;

        if existing.id != lock_id {
            return Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id,
            });
        }

        warn!("Force-unlocking {} held by {}", existing.id, existing.who);
        self.remove_lock().await
    }

    async fn init(&self) -> BackendResult<()> {
        if let Some(parent) = self.state_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::Io(format!("Failed to create state directory: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::reconciler::Snapshot;
    use keel_core::resource::{LifecycleState, ResourceId};
    use tempfile::tempdir;

    use crate::state::ResourceRecord;

    fn backend_in(dir: &tempfile::TempDir) -> LocalBackend {
        LocalBackend::with_path(dir.path().join("keel.state.json"))
    }

    #[tokio::test]
    async fn test_local_backend_read_write() {
        let dir = tempdir().unwrap();
        let backend = backend_in(&dir);

        assert!(backend.read_state().await.unwrap().is_none());

        let mut state = StateFile::new();
        let id = ResourceId::new("widget", "main");
        state.upsert_resource(ResourceRecord::new(
            &id,
            "memory",
            Snapshot {
                state: LifecycleState::Present,
                identifier: Some("R1".to_string()),
                time_created: None,
                applied: None,
            },
        ));
        state.increment_serial();
        backend.write_state(&state).await.unwrap();

        let loaded = backend.read_state().await.unwrap().unwrap();
        assert_eq!(loaded.serial, 1);
        assert_eq!(loaded.lineage, state.lineage);
        assert_eq!(loaded.find_resource(&id).unwrap().identifier(), Some("R1"));
    }

    #[tokio::test]
    async fn test_write_rejects_foreign_lineage_and_stale_serial() {
        let dir = tempdir().unwrap();
        let backend = backend_in(&dir);

        let mut state = StateFile::new();
        state.increment_serial();
        backend.write_state(&state).await.unwrap();

        // same serial again
        assert!(matches!(
            backend.write_state(&state).await,
            Err(BackendError::StaleSerial {
                stored: 1,
                attempted: 1
            })
        ));

        let mut other = StateFile::new();
        other.serial = 5;
        assert!(matches!(
            backend.write_state(&other).await,
            Err(BackendError::LineageMismatch { .. })
        ));

        state.increment_serial();
        backend.write_state(&state).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_rejects_corrupt_state() {
        let dir = tempdir().unwrap();
        let backend = backend_in(&dir);
        std::fs::write(backend.state_path(), "{not json").unwrap();

        assert!(matches!(
            backend.read_state().await,
            Err(BackendError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_local_backend_locking() {
        let dir = tempdir().unwrap();
        let backend = backend_in(&dir);

        let lock = backend.acquire_lock("apply").await.unwrap();
        assert_eq!(lock.operation, "apply");

        match backend.acquire_lock("destroy").await {
            Err(BackendError::Locked { lock_id, .. }) => assert_eq!(lock_id, lock.id),
            other => panic!("Expected Locked error, got {:?}", other.map(|l| l.id)),
        }

        let stranger = LockInfo::new("apply");
        assert!(matches!(
            backend.release_lock(&stranger).await,
            Err(BackendError::LockMismatch { .. })
        ));

        backend.release_lock(&lock).await.unwrap();
        assert!(!backend.lock_path().exists());
        assert!(matches!(
            backend.release_lock(&lock).await,
            Err(BackendError::LockNotFound(_))
        ));

        let lock2 = backend.acquire_lock("destroy").await.unwrap();
        assert_ne!(lock2.id, lock.id);
    }

    #[tokio::test]
    async fn test_expired_lock_is_replaced() {
        let dir = tempdir().unwrap();
        let backend = backend_in(&dir).with_lock_ttl(Duration::seconds(-1));

        let stale = backend.acquire_lock("apply").await.unwrap();
        let fresh = backend.acquire_lock("apply").await.unwrap();
        assert_ne!(stale.id, fresh.id);
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let dir = tempdir().unwrap();
        let backend = backend_in(&dir);

        assert!(matches!(
            backend.force_unlock("missing").await,
            Err(BackendError::LockNotFound(_))
        ));

        let lock = backend.acquire_lock("apply").await.unwrap();
        assert!(matches!(
            backend.force_unlock("other-id").await,
            Err(BackendError::LockMismatch { .. })
        ));
        backend.force_unlock(&lock.id).await.unwrap();
        assert!(!backend.lock_path().exists());
    }

    #[test]
    fn test_local_backend_from_config() {
        let mut config = BackendConfig::local("state/custom.json");
        config
            .attributes
            .insert("lock_ttl_secs".to_string(), keel_core::Value::Int(60));
        let backend = LocalBackend::from_config(&config).unwrap();
        assert_eq!(backend.state_path(), Path::new("state/custom.json"));
        assert_eq!(backend.lock_path(), Path::new("state/custom.lock"));

        config
            .attributes
            .insert("lock_ttl_secs".to_string(), keel_core::Value::Int(0));
        assert!(matches!(
            LocalBackend::from_config(&config),
            Err(BackendError::Configuration(_))
        ));
    }

    #[test]
    fn test_local_backend_default_path() {
        let backend = LocalBackend::default();
        assert_eq!(backend.state_path(), Path::new("keel.state.json"));
    }
}
