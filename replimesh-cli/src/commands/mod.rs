//! Command implementations for the replimesh CLI

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;

use replimesh_core::{InstanceId, MeshConfig, Role};
use replimesh_store::{DocumentDriver, MemoryDriver, MeshClient};

pub mod config;
pub mod instances;
pub mod read;
pub mod replicate;
pub mod route;
pub mod transaction;
pub mod write;

pub use config::run_config;
pub use instances::run_instances;
pub use read::run_read;
pub use replicate::run_replicate;
pub use route::run_route;
pub use transaction::run_transaction;
pub use write::run_write;

/// Explicit path, else the default file when it exists, else environment variables
pub(crate) fn load_config(path: Option<&Path>) -> Result<MeshConfig> {
    match path {
        Some(path) => MeshConfig::load(Some(path))
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None if MeshConfig::config_path().exists() => {
            MeshConfig::load(None).context("Failed to load config")
        }
        None => MeshConfig::from_env().context("Failed to build config from environment"),
    }
}

/// Postgres when built with the `postgres` feature and instances use
/// `postgres://` URLs; the in-process memory driver otherwise.
pub(crate) fn driver_for(config: &MeshConfig) -> Arc<dyn DocumentDriver> {
    #[cfg(feature = "postgres")]
    if config
        .instances
        .values()
        .any(|url| url.starts_with("postgres://") || url.starts_with("postgresql://"))
    {
        return Arc::new(replimesh_store::PgDocumentDriver::new());
    }

    if config.instances.values().any(|url| !url.starts_with("memory://")) {
        tracing::warn!("non-memory instance URLs; running against the in-process memory driver");
    }
    Arc::new(MemoryDriver::new())
}

pub(crate) fn connect(config: MeshConfig) -> Result<MeshClient> {
    let driver = driver_for(&config);
    MeshClient::builder(config)
        .driver(driver)
        .build()
        .context("Failed to build mesh client")
}

/// Parse a JSON argument; `@path` reads the value from a file
pub(crate) fn parse_json(raw: &str, what: &str) -> Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {} from {}", what, path))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON for {}", what))
}

pub(crate) fn parse_json_opt(raw: Option<&str>, what: &str) -> Result<Option<Value>> {
    raw.map(|raw| parse_json(raw, what)).transpose()
}

/// `None` when no roles were given, which replicates to every role
pub(crate) fn affected(roles: &[Role]) -> Option<&[Role]> {
    (!roles.is_empty()).then_some(roles)
}

pub(crate) fn ensure_known(mesh: &MeshClient, instance: &InstanceId) -> Result<()> {
    if mesh.directory().url_for_instance(instance).is_none() {
        return Err(anyhow!(
            "instance '{}' has no connection URL (known: {})",
            instance,
            join(mesh.directory().all_instances())
        ));
    }
    Ok(())
}

pub(crate) fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
