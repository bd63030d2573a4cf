mod file_accessor;
mod manifest;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use keel_core::value::record_from_json;
use keel_core::{
    Accessor, Action, Decoded, DiscriminatedDecoder, LifecycleState, Phase, Reconciler,
    ReconciliationPlan, ResourceId,
};
use keel_state::{BackendConfig, LocalBackend, StateBackend, StateFile, create_backend};

use file_accessor::FileAccessor;
use manifest::{LoadedManifest, ResourceManifest, load_manifest, load_registry};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Reconcile declared resources against a remote API", long_about = None)]
struct Cli {
    /// Path to the state file
    #[arg(long, global = true, default_value = LocalBackend::DEFAULT_STATE_FILE)]
    state: PathBuf,

    /// Path to the file standing in for the remote API
    #[arg(long, global = true, default_value = file_accessor::DEFAULT_REMOTE_FILE)]
    remote: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a JSON record against a variant registry
    Decode {
        /// Path to the JSON record
        file: PathBuf,

        /// Path to the registry definition
        #[arg(long)]
        registry: PathBuf,

        /// Discriminator field (defaults to the registry's)
        #[arg(long)]
        discriminator: Option<String>,
    },
    /// Show what apply would do, without calling the remote
    Plan {
        /// Path to the manifest
        #[arg(default_value = "keel.json")]
        file: PathBuf,
    },
    /// Reconcile every resource in the manifest
    Apply {
        /// Path to the manifest
        #[arg(default_value = "keel.json")]
        file: PathBuf,
    },
    /// Destroy all resources defined in the manifest
    Destroy {
        /// Path to the manifest
        #[arg(default_value = "keel.json")]
        file: PathBuf,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Inspect the state file
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Release a stuck state lock
    ForceUnlock {
        /// ID of the lock to release
        lock_id: String,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// List recorded resources
    List,
    /// Show one recorded resource
    Show {
        /// Resource address (type.name)
        address: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Decode {
            file,
            registry,
            discriminator,
        } => run_decode(&file, &registry, discriminator.as_deref()),
        Commands::Plan { file } => run_plan(&file, &cli.state, &cli.remote).await,
        Commands::Apply { file } => run_apply(&file, &cli.state, &cli.remote).await,
        Commands::Destroy { file, auto_approve } => {
            run_destroy(&file, &cli.state, &cli.remote, auto_approve).await
        }
        Commands::State { command } => run_state_command(command, &cli.state).await,
        Commands::ForceUnlock { lock_id } => run_force_unlock(&lock_id, &cli.state).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

type FileReconciler = Reconciler<Arc<FileAccessor>>;

/// Counts of one apply or destroy run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RunSummary {
    changed: usize,
    unchanged: usize,
    failed: usize,
}

async fn open_backend(state_path: &Path) -> Result<Box<dyn StateBackend>, String> {
    let config = BackendConfig::local(state_path.to_string_lossy());
    create_backend(&config).await.map_err(|e| e.to_string())
}

async fn read_state(backend: &dyn StateBackend) -> Result<StateFile, String> {
    Ok(backend
        .read_state()
        .await
        .map_err(|e| e.to_string())?
        .unwrap_or_default())
}

async fn write_state(backend: &dyn StateBackend, state: &mut StateFile) -> Result<(), String> {
    state.increment_serial();
    backend
        .write_state(state)
        .await
        .map_err(|e| format!("Failed to write state: {}", e))
}

fn reconciler_for(
    resource: &ResourceManifest,
    loaded: &LoadedManifest,
    accessor: &Arc<FileAccessor>,
    state: &StateFile,
) -> FileReconciler {
    let mut reconciler =
        Reconciler::new(resource.kind.clone(), resource.name.clone(), accessor.clone())
            .with_config(loaded.config());
    if let Some(decoder) = &loaded.decoder {
        reconciler = reconciler.with_decoder(decoder.clone());
    }
    if let Some(record) = state.find_resource(&resource.id()) {
        reconciler = reconciler.restore(record.snapshot.clone());
    }
    reconciler
}

fn parse_address(address: &str) -> Result<ResourceId, String> {
    match address.split_once('.') {
        Some((resource_type, name)) if !resource_type.is_empty() && !name.is_empty() => {
            Ok(ResourceId::new(resource_type, name))
        }
        _ => Err(format!(
            "Invalid resource address '{}': expected type.name",
            address
        )),
    }
}

fn run_decode(file: &Path, registry: &Path, discriminator: Option<&str>) -> Result<(), String> {
    let (registry, declared) = load_registry(registry)?;
    let field = discriminator
        .map(str::to_string)
        .or(declared)
        .ok_or("The registry declares no discriminator field; pass --discriminator")?;

    let content =
        fs::read_to_string(file).map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
    let json: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid JSON in {}: {}", file.display(), e))?;
    let record = record_from_json(json)
        .ok_or_else(|| format!("{} does not contain a JSON object", file.display()))?;

    let type_name = registry.type_name().to_string();
    let decoder = DiscriminatedDecoder::new(Arc::new(registry));
    match decoder.decode(&record, &field).map_err(|e| e.to_string())? {
        Decoded::Known(variant) => {
            println!(
                "{} {}",
                format!("{}:", type_name).cyan().bold(),
                variant.tag.bold()
            );
            for (name, value) in &variant.fields {
                println!("  {} = {}", name, value);
            }
            let mut extra: Vec<_> = variant.extra.iter().collect();
            extra.sort_by(|a, b| a.0.cmp(b.0));
            for (name, value) in extra {
                println!("  {} = {} {}", name, value, "(undeclared)".dimmed());
            }
        }
        Decoded::Unknown { tag, raw } => {
            println!(
                "{}",
                format!(
                    "Unknown {} variant '{}'; record passed through undecoded.",
                    type_name, tag
                )
                .yellow()
            );
            let mut entries: Vec<_> = raw.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (name, value) in entries {
                println!("  {} = {}", name, value);
            }
        }
    }
    Ok(())
}

fn format_plan(id: &ResourceId, plan: &ReconciliationPlan) -> String {
    if plan.created {
        return format!("{} {} ({})", "+".green(), id, plan);
    }
    match plan.action {
        Action::NoOp => format!("  {} ({})", id, plan),
        Action::UpdateInPlace => format!("{} {} ({})", plan.action.symbol().yellow(), id, plan),
        Action::Replace => format!("{} {} ({})", plan.action.symbol().red(), id, plan),
    }
}

async fn run_plan(file: &Path, state_path: &Path, remote: &Path) -> Result<(), String> {
    let loaded = load_manifest(file)?;
    let backend = open_backend(state_path).await?;
    let state = read_state(backend.as_ref()).await?;
    let accessor = Arc::new(FileAccessor::new(remote));

    println!("{}", "Execution Plan:".cyan().bold());
    println!();

    let (mut create, mut update, mut replace) = (0, 0, 0);
    for resource in loaded.resources() {
        let reconciler = reconciler_for(resource, &loaded, &accessor, &state);
        let phase = if reconciler.applied().is_some() {
            Phase::Update
        } else {
            Phase::Create
        };

        match reconciler.plan(&resource.properties.resolve(phase)) {
            Ok(plan) => {
                println!("  {}", format_plan(reconciler.id(), &plan));
                if plan.created {
                    create += 1;
                } else if plan.action == Action::UpdateInPlace {
                    update += 1;
                } else if plan.action == Action::Replace {
                    replace += 1;
                }
            }
            Err(e) => println!("  {} {} - {}", "!".red(), reconciler.id(), e),
        }
    }

    warn_unmanaged(&loaded, &state);

    println!();
    println!(
        "Plan: {} to create, {} to update, {} to replace.",
        create.to_string().green(),
        update.to_string().yellow(),
        replace.to_string().red()
    );
    Ok(())
}

fn warn_unmanaged(loaded: &LoadedManifest, state: &StateFile) {
    for record in &state.resources {
        let id = record.id();
        if !loaded.resources().iter().any(|r| r.id() == id) {
            println!(
                "  {}",
                format!("{} is recorded in state but not in the manifest", id).yellow()
            );
        }
    }
}

async fn run_apply(file: &Path, state_path: &Path, remote: &Path) -> Result<(), String> {
    let loaded = load_manifest(file)?;
    let backend = open_backend(state_path).await?;
    let accessor = Arc::new(FileAccessor::new(remote));

    let lock = backend
        .acquire_lock("apply")
        .await
        .map_err(|e| e.to_string())?;
    log::debug!("acquired lock {} for apply", lock.id);
    let result = apply(&loaded, backend.as_ref(), &accessor).await;
    backend
        .release_lock(&lock)
        .await
        .map_err(|e| format!("Failed to release lock {}: {}", lock.id, e))?;
    let summary = result?;

    println!();
    if summary.failed == 0 {
        println!(
            "{}",
            format!(
                "Apply complete! {} changed, {} unchanged.",
                summary.changed, summary.unchanged
            )
            .green()
            .bold()
        );
        Ok(())
    } else {
        Err(format!(
            "Apply failed. {} succeeded, {} failed.",
            summary.changed + summary.unchanged,
            summary.failed
        ))
    }
}

/// Reconcile every manifest resource, persisting state after each one
async fn apply(
    loaded: &LoadedManifest,
    backend: &dyn StateBackend,
    accessor: &Arc<FileAccessor>,
) -> Result<RunSummary, String> {
    let mut state = read_state(backend).await?;
    let mut summary = RunSummary::default();

    println!("{}", "Applying changes...".cyan().bold());
    println!();

    for resource in loaded.resources() {
        let mut reconciler = reconciler_for(resource, loaded, accessor, &state);

        match reconciler.reconcile_properties(&resource.properties).await {
            Ok(reconciliation) if reconciliation.plan.is_change() => {
                println!(
                    "  {} {} -> {}",
                    "✓".green(),
                    format_plan(reconciler.id(), &reconciliation.plan),
                    reconciliation.state.identifier.as_deref().unwrap_or_default()
                );
                log::info!("{}: {}", reconciler.id(), reconciliation.plan);
                summary.changed += 1;
            }
            Ok(_) => {
                log::info!("{}: unchanged", reconciler.id());
                summary.unchanged += 1;
            }
            Err(e) => {
                println!("  {} {} - {}", "✗".red(), reconciler.id(), e);
                log::warn!(
                    "{}: apply failed in state {}: {}",
                    reconciler.id(),
                    reconciler.state(),
                    e
                );
                summary.failed += 1;
            }
        }

        state.record_snapshot(reconciler.id(), accessor.name(), reconciler.snapshot());
        write_state(backend, &mut state).await?;
    }

    warn_unmanaged(loaded, &state);
    Ok(summary)
}

async fn run_destroy(
    file: &Path,
    state_path: &Path,
    remote: &Path,
    auto_approve: bool,
) -> Result<(), String> {
    let loaded = load_manifest(file)?;
    let backend = open_backend(state_path).await?;
    let state = read_state(backend.as_ref()).await?;

    let targets: Vec<ResourceId> = loaded
        .resources()
        .iter()
        .map(ResourceManifest::id)
        .filter(|id| state.find_resource(id).is_some())
        .collect();
    if targets.is_empty() {
        println!("{}", "No recorded resources to destroy.".yellow());
        return Ok(());
    }

    println!("{}", "The following resources will be destroyed:".red().bold());
    for id in &targets {
        println!("  {} {}", "-".red(), id);
    }
    println!();

    if !auto_approve {
        println!(
            "  {}",
            "This action cannot be undone. Type 'yes' to confirm.".yellow()
        );
        print!("\n  Enter a value: ");
        std::io::stdout().flush().map_err(|e| e.to_string())?;

        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(|e| e.to_string())?;

        if input.trim() != "yes" {
            println!();
            println!("{}", "Destroy cancelled.".yellow());
            return Ok(());
        }
        println!();
    }

    let accessor = Arc::new(FileAccessor::new(remote));
    let lock = backend
        .acquire_lock("destroy")
        .await
        .map_err(|e| e.to_string())?;
    log::debug!("acquired lock {} for destroy", lock.id);
    let result = destroy(&loaded, backend.as_ref(), &accessor).await;
    backend
        .release_lock(&lock)
        .await
        .map_err(|e| format!("Failed to release lock {}: {}", lock.id, e))?;
    let summary = result?;

    println!();
    if summary.failed == 0 {
        println!(
            "{}",
            format!("Destroy complete! {} resources destroyed.", summary.changed)
                .green()
                .bold()
        );
        Ok(())
    } else {
        Err(format!(
            "Destroy failed. {} destroyed, {} failed.",
            summary.changed, summary.failed
        ))
    }
}

/// Destroy recorded manifest resources in reverse declaration order
async fn destroy(
    loaded: &LoadedManifest,
    backend: &dyn StateBackend,
    accessor: &Arc<FileAccessor>,
) -> Result<RunSummary, String> {
    let mut state = read_state(backend).await?;
    let mut summary = RunSummary::default();

    println!("{}", "Destroying resources...".red().bold());
    println!();

    for resource in loaded.resources().iter().rev() {
        if state.find_resource(&resource.id()).is_none() {
            continue;
        }
        let mut reconciler = reconciler_for(resource, loaded, accessor, &state);
        let identifier = reconciler.identifier().unwrap_or_default().to_string();

        match reconciler.destroy().await {
            Ok(()) => {
                println!("  {} {} {}", "✓".green(), reconciler.id(), identifier.dimmed());
                log::info!("{}: destroyed {}", reconciler.id(), identifier);
                summary.changed += 1;
            }
            Err(e) => {
                println!("  {} {} - {}", "✗".red(), reconciler.id(), e);
                log::warn!(
                    "{}: destroy failed in state {}: {}",
                    reconciler.id(),
                    reconciler.state(),
                    e
                );
                summary.failed += 1;
            }
        }

        state.record_snapshot(reconciler.id(), accessor.name(), reconciler.snapshot());
        write_state(backend, &mut state).await?;
    }

    Ok(summary)
}

async fn run_state_command(command: StateCommands, state_path: &Path) -> Result<(), String> {
    let backend = open_backend(state_path).await?;
    let state = read_state(backend.as_ref()).await?;

    match command {
        StateCommands::List => {
            if state.resources.is_empty() {
                println!("{}", "No resources in state.".yellow());
                return Ok(());
            }
            for record in &state.resources {
                let lifecycle = match record.snapshot.state {
                    LifecycleState::Present => record.snapshot.state.to_string().green(),
                    LifecycleState::DeleteFailed => record.snapshot.state.to_string().red(),
                    _ => record.snapshot.state.to_string().yellow(),
                };
                println!(
                    "{}  {}  {}",
                    record.id(),
                    record.identifier().unwrap_or("-"),
                    lifecycle
                );
            }
        }
        StateCommands::Show { address } => {
            let id = parse_address(&address)?;
            let record = state
                .find_resource(&id)
                .ok_or_else(|| format!("{} is not in state", id))?;
            let json = serde_json::to_string_pretty(record).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
    }
    Ok(())
}

async fn run_force_unlock(lock_id: &str, state_path: &Path) -> Result<(), String> {
    let backend = open_backend(state_path).await?;
    backend
        .force_unlock(lock_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("{}", format!("Lock {} released.", lock_id).green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Value;
    use tempfile::{TempDir, tempdir};

    fn write_manifest(dir: &TempDir, display_name: &str) -> LoadedManifest {
        let manifest = format!(
            r#"{{
                "poll": {{ "interval_ms": 1, "max_attempts": 3 }},
                "resources": [
                    {{
                        "resource_type": "widget",
                        "name": "first",
                        "properties": [
                            {{ "name": "name", "requirement": "required", "create": "{0}" }},
                            {{ "name": "size", "create": 10, "update": 20 }}
                        ]
                    }},
                    {{
                        "resource_type": "widget",
                        "name": "second",
                        "properties": [
                            {{ "name": "name", "requirement": "required", "create": "other" }}
                        ]
                    }}
                ]
            }}"#,
            display_name
        );
        let path = dir.path().join("keel.json");
        fs::write(&path, manifest).unwrap();
        load_manifest(&path).unwrap()
    }

    #[test]
    fn test_parse_address() {
        let id = parse_address("database_db_home.main").unwrap();
        assert_eq!(id, ResourceId::new("database_db_home", "main"));
        assert!(parse_address("widget").is_err());
        assert!(parse_address(".main").is_err());
    }

    #[tokio::test]
    async fn test_apply_then_destroy() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("keel.state.json"));
        let accessor = Arc::new(FileAccessor::new(dir.path().join("remote.json")));
        let first = ResourceId::new("widget", "first");

        let loaded = write_manifest(&dir, "widget-a");
        let summary = apply(&loaded, &backend, &accessor).await.unwrap();
        assert_eq!(summary.changed, 2);

        let state = backend.read_state().await.unwrap().unwrap();
        let r1 = state.find_resource(&first).unwrap().identifier().unwrap().to_string();
        assert_eq!(state.resources.len(), 2);
        assert_eq!(accessor.name(), state.find_resource(&first).unwrap().accessor);

        // update values take effect on the second pass
        apply(&loaded, &backend, &accessor).await.unwrap();
        let remote = accessor.read(&first, &r1).await.unwrap();
        assert_eq!(remote.attributes.get("size"), Some(&Value::Int(20)));

        // the immutable name forces a replacement
        let renamed = write_manifest(&dir, "widget-b");
        let summary = apply(&renamed, &backend, &accessor).await.unwrap();
        assert_eq!(summary.changed, 1);
        assert_eq!(summary.unchanged, 1);
        let state = backend.read_state().await.unwrap().unwrap();
        let r2 = state.find_resource(&first).unwrap().identifier().unwrap();
        assert_ne!(r1, r2);
        assert!(accessor.read(&first, &r1).await.unwrap_err().is_not_found());

        let summary = destroy(&renamed, &backend, &accessor).await.unwrap();
        assert_eq!(summary.changed, 2);
        let state = backend.read_state().await.unwrap().unwrap();
        assert!(state.resources.is_empty());
    }

    #[tokio::test]
    async fn test_plan_leaves_remote_untouched() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("keel.state.json");
        let remote = dir.path().join("remote.json");
        let accessor = Arc::new(FileAccessor::new(&remote));

        write_manifest(&dir, "widget-a");
        let manifest = dir.path().join("keel.json");
        let loaded = load_manifest(&manifest).unwrap();
        apply(&loaded, &LocalBackend::with_path(state_path.clone()), &accessor)
            .await
            .unwrap();
        let before = fs::read_to_string(&remote).unwrap();

        write_manifest(&dir, "widget-b");
        run_plan(&manifest, &state_path, &remote).await.unwrap();
        assert_eq!(fs::read_to_string(&remote).unwrap(), before);
    }

    #[tokio::test]
    async fn test_apply_records_failures_and_continues() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("keel.state.json"));
        // a directory where the remote file should be makes every call fail
        let remote = dir.path().join("remote");
        fs::create_dir(&remote).unwrap();
        let accessor = Arc::new(FileAccessor::new(remote));

        let loaded = write_manifest(&dir, "widget-a");
        let summary = apply(&loaded, &backend, &accessor).await.unwrap();
        assert_eq!(summary.failed, 2);

        let state = backend.read_state().await.unwrap().unwrap();
        assert!(state.resources.is_empty());
        assert_eq!(state.serial, 2);
    }
}
