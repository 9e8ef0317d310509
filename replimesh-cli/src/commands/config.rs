use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};

use replimesh_core::{InstanceDirectory, InstanceId, MeshConfig};

use super::{join, load_config};

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Load and validate the configuration
    Validate,
    /// Show config file path
    Path,
    /// Print the effective configuration as TOML (token masked)
    Show,
}

pub fn run_config(config: Option<&Path>, args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Validate => run_validate(config),
        ConfigCommands::Path => run_path(config),
        ConfigCommands::Show => run_show(config),
    }
}

fn run_validate(path: Option<&Path>) -> Result<()> {
    println!("🔍 Validating configuration...");

    let config = load_config(path)?;
    println!("   ✓ Config loaded successfully");

    let directory = InstanceDirectory::from_config(&config)?;
    println!(
        "   ✓ {} instances, {} roles",
        config.instances.len(),
        directory.roles().len()
    );

    let missing: Vec<&InstanceId> = directory
        .all_instances()
        .iter()
        .filter(|id| !config.instances.contains_key(id.as_str()))
        .collect();
    if !missing.is_empty() {
        println!("\n⚠️  Instances referenced by roles without a connection URL:");
        for id in missing {
            println!("   {} ({})", id, join(&directory.roles_for_instance(id)));
        }
    }

    if config.replication.enabled {
        println!(
            "   ✓ Replication via {} ({})",
            config.replication.dispatch_url(),
            config.replication.event_type
        );
    } else {
        println!("   ⚠  Replication disabled; envelopes are only logged");
    }

    println!("\n✅ Configuration valid!");
    Ok(())
}

fn run_path(path: Option<&Path>) -> Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(MeshConfig::config_path);
    println!("{}", path.display());
    Ok(())
}

fn run_show(path: Option<&Path>) -> Result<()> {
    let mut config = load_config(path)?;
    if !config.replication.token.is_empty() {
        config.replication.token = "********".to_string();
    }
    print!("{}", config.to_toml()?);
    Ok(())
}
