//! `replimesh replicate`: send replication envelopes for an operation that
//! already ran on `--source`

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

use replimesh_core::{InstanceId, Operation, Role};
use replimesh_store::ReplicationEnvelope;

use super::{affected, connect, ensure_known, join, load_config, print_json};

#[derive(Parser, Debug)]
pub struct ReplicateArgs {
    /// Instance the write was executed on
    #[arg(long, short = 's')]
    pub source: String,

    /// JSON file with one write operation descriptor
    #[arg(long)]
    pub operation: PathBuf,

    /// Roles whose data the write affects (comma-separated, default: all)
    #[arg(long, value_delimiter = ',')]
    pub affects: Vec<Role>,

    /// Print the envelope instead of sending it
    #[arg(long)]
    pub dry_run: bool,
}

fn load_operation(path: &Path) -> Result<Operation> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let operation: Operation = serde_json::from_str(&content)
        .with_context(|| format!("{} is not an operation descriptor", path.display()))?;
    if operation.is_read() {
        bail!("{} is a read; only writes are replicated", operation.kind);
    }
    Ok(operation)
}

pub async fn run_replicate(config: Option<&Path>, args: ReplicateArgs) -> Result<()> {
    let operation = load_operation(&args.operation)?;
    let mesh = connect(load_config(config)?)?;
    let source = InstanceId::new(args.source.as_str());
    ensure_known(&mesh, &source)?;

    let roles = affected(&args.affects);
    let destinations = mesh.dispatcher().destinations(&source, roles);

    if args.dry_run {
        let envelope = ReplicationEnvelope::now(
            mesh.config().replication.event_type.as_str(),
            operation,
            destinations,
        );
        return print_json(&envelope);
    }

    if destinations.is_empty() {
        println!("Nothing to send: no other instance serves the affected roles");
        return Ok(());
    }

    println!("📤 Replicating {} on {} to {}", operation.kind, operation.collection, join(&destinations));
    if !mesh.dispatcher().dispatch(&[operation], &source, roles).await {
        return Err(anyhow!("replication dispatch failed (see log for the channel error)"));
    }
    println!("   ✓ delivered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_reads_are_not_replicated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"operation": "find", "collection": "T"}}"#).unwrap();
        assert!(load_operation(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"operation": "deleteOne", "collection": "T", "filter": {{"_id": 1}}}}"#).unwrap();
        assert_eq!(load_operation(file.path()).unwrap().collection, "T");
    }
}
