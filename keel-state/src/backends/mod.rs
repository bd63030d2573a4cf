//! Backend implementations for state storage

mod local;

pub use local::LocalBackend;

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};

/// Create a backend from configuration, dispatching on `backend_type`
pub async fn create_backend(config: &BackendConfig) -> BackendResult<Box<dyn StateBackend>> {
    match config.backend_type.as_str() {
        "local" => {
            let backend = LocalBackend::from_config(config)?;
            backend.init().await?;
            Ok(Box::new(backend))
        }
        other => Err(BackendError::UnsupportedBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_unsupported_backend() {
        let config = BackendConfig {
            backend_type: "s3".to_string(),
            attributes: HashMap::new(),
        };

        match create_backend(&config).await {
            Err(BackendError::UnsupportedBackend(name)) => assert_eq!(name, "s3"),
            Err(e) => panic!("Expected UnsupportedBackend error, got {}", e),
            Ok(_) => panic!("Expected UnsupportedBackend error"),
        }
    }

    #[tokio::test]
    async fn test_create_local_backend_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keel.state.json");
        let config = BackendConfig::local(path.to_string_lossy());

        let backend = create_backend(&config).await.unwrap();
        assert!(dir.path().join("nested").is_dir());
        assert!(backend.read_state().await.unwrap().is_none());
    }
}
