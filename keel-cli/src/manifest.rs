//! Resource manifests
//!
//! A manifest is a JSON file listing the resources to manage:
//!
//! ```json
//! {
//!   "registry": "db_home_registry.json",
//!   "poll": { "interval_ms": 5000, "max_attempts": 120 },
//!   "resources": [
//!     {
//!       "resource_type": "database_db_home",
//!       "name": "main",
//!       "discriminator": "source",
//!       "properties": [
//!         { "name": "source", "requirement": "required", "create": "NONE" },
//!         { "name": "display_name", "create": "home-a", "update": "home-b" }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use keel_core::variant::RegistryDefinition;
use keel_core::{
    DiscriminatedDecoder, PropertySet, ReconcilerConfig, ResourceId, ResourceKind, VariantRegistry,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Variant registry for decoding response bodies, relative to the manifest
    #[serde(default)]
    pub registry: Option<PathBuf>,
    #[serde(default)]
    pub poll: PollSettings,
    pub resources: Vec<ResourceManifest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceManifest {
    #[serde(flatten)]
    pub kind: ResourceKind,
    pub name: String,
    pub properties: PropertySet,
}

impl ResourceManifest {
    pub fn id(&self) -> ResourceId {
        self.kind.resource_id(self.name.clone())
    }
}

/// Destroy verification polling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// `null` polls until a terminal signal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_max_attempts() -> Option<u32> {
    Some(120)
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl From<PollSettings> for ReconcilerConfig {
    fn from(poll: PollSettings) -> Self {
        ReconcilerConfig {
            poll_interval: Duration::from_millis(poll.interval_ms),
            max_polls: poll.max_attempts,
        }
    }
}

/// A parsed manifest together with its loaded registry
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub manifest: Manifest,
    pub decoder: Option<DiscriminatedDecoder>,
}

impl LoadedManifest {
    pub fn config(&self) -> ReconcilerConfig {
        self.manifest.poll.into()
    }

    pub fn resources(&self) -> &[ResourceManifest] {
        &self.manifest.resources
    }
}

pub fn load_manifest(path: &Path) -> Result<LoadedManifest, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let manifest: Manifest = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid manifest {}: {}", path.display(), e))?;

    let mut seen = std::collections::HashSet::new();
    for resource in &manifest.resources {
        let id = resource.id();
        if !seen.insert(id.clone()) {
            return Err(format!("Resource {} is declared more than once", id));
        }
    }

    let decoder = match &manifest.registry {
        Some(registry) => {
            let base_dir = path.parent().unwrap_or(Path::new("."));
            let (registry, _) = load_registry(&base_dir.join(registry))?;
            Some(DiscriminatedDecoder::new(Arc::new(registry)))
        }
        None => None,
    };

    Ok(LoadedManifest { manifest, decoder })
}

/// Load a registry file, returning it with its declared discriminator field
pub fn load_registry(path: &Path) -> Result<(VariantRegistry, Option<String>), String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let definition: RegistryDefinition = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid registry {}: {}", path.display(), e))?;
    let discriminator = definition.discriminator.clone();
    let registry = VariantRegistry::from_definition(definition)
        .map_err(|e| format!("Invalid registry {}: {}", path.display(), e))?;
    Ok((registry, discriminator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Phase, Value};
    use tempfile::tempdir;

    const REGISTRY: &str = r#"{
        "type_name": "CreateDbHomeBase",
        "discriminator": "source",
        "variants": [
            {
                "discriminator_value": "NONE",
                "fields": [{ "name": "dbVersion", "type": "string", "mandatory": true }]
            },
            {
                "discriminator_value": "DB_BACKUP",
                "fields": [{ "name": "backupId", "type": "string", "mandatory": true }]
            }
        ]
    }"#;

    const MANIFEST: &str = r#"{
        "registry": "registry.json",
        "poll": { "interval_ms": 10 },
        "resources": [
            {
                "resource_type": "database_db_home",
                "name": "main",
                "discriminator": "source",
                "deleted_statuses": ["TERMINATED"],
                "properties": [
                    { "name": "source", "requirement": "required", "create": "NONE" },
                    { "name": "dbVersion", "requirement": "required", "create": "19.0.0.0" },
                    { "name": "displayName", "create": "home-a", "update": "home-b" }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_load_manifest_with_registry() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("registry.json"), REGISTRY).unwrap();
        let path = dir.path().join("keel.json");
        fs::write(&path, MANIFEST).unwrap();

        let loaded = load_manifest(&path).unwrap();
        let decoder = loaded.decoder.as_ref().unwrap();
        assert_eq!(decoder.registry().len(), 2);

        let config = loaded.config();
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.max_polls, Some(120));

        let resource = &loaded.resources()[0];
        assert_eq!(resource.id().to_string(), "database_db_home.main");
        assert_eq!(resource.kind.discriminator.as_deref(), Some("source"));
        assert!(resource.kind.is_deleted("TERMINATED"));
        assert!(!resource.kind.is_deleted("DELETED"));

        let update = resource.properties.resolve(Phase::Update);
        assert_eq!(update.value("displayName"), Some(&Value::from("home-b")));
    }

    #[test]
    fn test_manifest_defaults() {
        let manifest: Manifest = serde_json::from_str(
            r#"{ "resources": [ { "resource_type": "widget", "name": "w", "properties": [] } ] }"#,
        )
        .unwrap();

        assert!(manifest.registry.is_none());
        assert_eq!(manifest.poll, PollSettings::default());
        assert!(manifest.resources[0].kind.is_deleted("DELETED"));
    }

    #[test]
    fn test_unbounded_polling() {
        let poll: PollSettings = serde_json::from_str(r#"{ "max_attempts": null }"#).unwrap();
        assert_eq!(ReconcilerConfig::from(poll).max_polls, None);
    }

    #[test]
    fn test_invalid_property_table_is_rejected() {
        let result: Result<Manifest, _> = serde_json::from_str(
            r#"{ "resources": [ { "resource_type": "widget", "name": "w",
                 "properties": [ { "name": "size", "requirement": "required" } ] } ] }"#,
        );
        let message = result.unwrap_err().to_string();
        assert!(message.contains("size"), "{}", message);
    }

    #[test]
    fn test_duplicate_resources_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keel.json");
        fs::write(
            &path,
            r#"{ "resources": [
                { "resource_type": "widget", "name": "w", "properties": [] },
                { "resource_type": "widget", "name": "w", "properties": [] }
            ] }"#,
        )
        .unwrap();

        let err = load_manifest(&path).unwrap_err();
        assert!(err.contains("widget.w"), "{}", err);
    }

    #[test]
    fn test_load_registry_returns_discriminator() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, REGISTRY).unwrap();

        let (registry, discriminator) = load_registry(&path).unwrap();
        assert_eq!(registry.type_name(), "CreateDbHomeBase");
        assert_eq!(discriminator.as_deref(), Some("source"));
    }
}
