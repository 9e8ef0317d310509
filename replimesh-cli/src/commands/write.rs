//! `replimesh write`

use std::path::Path;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::warn;

use replimesh_core::{InstanceId, Operation, OperationKind, Role};

use super::{affected, connect, ensure_known, load_config, parse_json_opt, print_json};

#[derive(Parser, Debug)]
pub struct WriteArgs {
    /// Instance that executes the write
    #[arg(long, short = 'i')]
    pub instance: String,

    /// insertOne, insertMany, updateOne, updateMany, replaceOne, deleteOne or deleteMany
    #[arg(long)]
    pub kind: OperationKind,

    #[arg(long, short = 'c')]
    pub collection: String,

    /// Filter document (JSON, or @file)
    #[arg(long)]
    pub filter: Option<String>,

    /// Document, array of documents, update or replacement (JSON, or @file)
    #[arg(long)]
    pub data: Option<String>,

    /// Options such as {"upsert": true} (JSON, or @file)
    #[arg(long)]
    pub options: Option<String>,

    /// Roles whose data the write affects (comma-separated, default: all)
    #[arg(long, value_delimiter = ',')]
    pub affects: Vec<Role>,
}

pub(crate) fn build_write(args: &WriteArgs) -> Result<Operation> {
    if args.kind.is_read() {
        return Err(anyhow!("{} is a read; use `replimesh read`", args.kind));
    }

    let mut operation = Operation::new(args.kind, args.collection.clone());
    if let Some(filter) = parse_json_opt(args.filter.as_deref(), "filter")? {
        operation = operation.filter(filter);
    }
    if let Some(data) = parse_json_opt(args.data.as_deref(), "data")? {
        operation = operation.data(data);
    }
    if let Some(options) = parse_json_opt(args.options.as_deref(), "options")? {
        operation = operation.options(options);
    }
    Ok(operation)
}

pub async fn run_write(config: Option<&Path>, args: WriteArgs) -> Result<()> {
    let operation = build_write(&args)?;
    let mesh = connect(load_config(config)?)?;
    let instance = InstanceId::new(args.instance.as_str());
    ensure_known(&mesh, &instance)?;

    let outcome = mesh
        .write_and_wait(&instance, &operation, affected(&args.affects))
        .await;
    mesh.close_all().await;

    let (result, delivered) = outcome?;
    if !delivered {
        warn!(instance = %instance, "write succeeded but replication was not fully delivered");
    }
    print_json(&result)
}
