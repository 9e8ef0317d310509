//! `replimesh transaction`: run a list of operations atomically on one instance
//!
//! The file holds a JSON array of operation descriptors:
//! `[{"operation": "insertOne", "collection": "T", "data": {..}}, ..]`

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::warn;

use replimesh_core::{InstanceId, Operation, Role};
use replimesh_store::DatabaseHandle;

use super::{affected, connect, ensure_known, load_config, print_json};

#[derive(Parser, Debug)]
pub struct TransactionArgs {
    /// Instance that executes the transaction
    #[arg(long, short = 'i')]
    pub instance: String,

    /// JSON file with an array of operations
    #[arg(long, short = 'f')]
    pub file: PathBuf,

    /// Roles whose data the writes affect (comma-separated, default: all)
    #[arg(long, value_delimiter = ',')]
    pub affects: Vec<Role>,
}

pub(crate) fn load_operations(path: &Path) -> Result<Vec<Operation>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let operations: Vec<Operation> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of operations", path.display()))?;
    if operations.is_empty() {
        return Err(anyhow!("{} contains no operations", path.display()));
    }
    Ok(operations)
}

pub async fn run_transaction(config: Option<&Path>, args: TransactionArgs) -> Result<()> {
    let operations = load_operations(&args.file)?;
    let mesh = connect(load_config(config)?)?;
    let instance = InstanceId::new(args.instance.as_str());
    ensure_known(&mesh, &instance)?;

    let outcome = mesh
        .transaction_and_wait(&instance, affected(&args.affects), |db| async move {
            let mut results = Vec::with_capacity(operations.len());
            for operation in &operations {
                results.push(db.run(operation).await?.into_value());
            }
            Ok(results)
        })
        .await;
    mesh.close_all().await;

    let (results, delivered): (Vec<Value>, bool) = outcome?;
    if !delivered {
        warn!(instance = %instance, "transaction committed but replication was not fully delivered");
    }
    print_json(&results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use replimesh_core::OperationKind;

    #[test]
    fn test_load_operations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"operation": "insertOne", "collection": "T", "data": {{"_id": 1}}}},
                {{"operation": "deleteMany", "collection": "T", "filter": {{}}}}
            ]"#
        )
        .unwrap();

        let ops = load_operations(file.path()).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].kind, OperationKind::DeleteMany);
    }

    #[test]
    fn test_empty_or_malformed_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[]").unwrap();
        assert!(load_operations(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"operation": "find"}}"#).unwrap();
        assert!(load_operations(file.path()).is_err());
    }
}
