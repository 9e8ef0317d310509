//! `replimesh read`

use std::path::Path;

use anyhow::{anyhow, Result};
use clap::Parser;
use serde_json::Value;

use replimesh_core::{InstanceId, Operation, OperationKind, Role};
use replimesh_store::ReadTarget;

use super::{connect, ensure_known, load_config, parse_json_opt, print_json};

#[derive(Parser, Debug)]
pub struct ReadArgs {
    #[arg(long, short = 'c')]
    pub collection: String,

    /// find, findOne, countDocuments or aggregate
    #[arg(long, default_value = "find")]
    pub kind: OperationKind,

    /// Filter document (JSON, or @file)
    #[arg(long)]
    pub filter: Option<String>,

    /// Aggregation pipeline (JSON array, or @file)
    #[arg(long)]
    pub pipeline: Option<String>,

    /// Options such as sort, skip, limit, projection (JSON, or @file)
    #[arg(long)]
    pub options: Option<String>,

    /// Read from a random instance serving this role
    #[arg(long, conflicts_with = "instance")]
    pub role: Option<Role>,

    /// Read from this instance
    #[arg(long)]
    pub instance: Option<String>,
}

pub(crate) fn build_read(args: &ReadArgs) -> Result<Operation> {
    if !args.kind.is_read() {
        return Err(anyhow!("{} is a write; use `replimesh write`", args.kind));
    }

    let mut operation = Operation::new(args.kind, args.collection.clone());
    if let Some(filter) = parse_json_opt(args.filter.as_deref(), "filter")? {
        operation = operation.filter(filter);
    }
    if let Some(options) = parse_json_opt(args.options.as_deref(), "options")? {
        operation = operation.options(options);
    }
    match parse_json_opt(args.pipeline.as_deref(), "pipeline")? {
        Some(Value::Array(stages)) => operation = operation.pipeline(stages),
        Some(_) => return Err(anyhow!("pipeline must be a JSON array of stages")),
        None => {}
    }
    Ok(operation)
}

pub async fn run_read(config: Option<&Path>, args: ReadArgs) -> Result<()> {
    let operation = build_read(&args)?;
    let mesh = connect(load_config(config)?)?;

    let target = match (&args.instance, args.role) {
        (Some(instance), _) => {
            let instance = InstanceId::new(instance.as_str());
            ensure_known(&mesh, &instance)?;
            ReadTarget::instance(instance)
        }
        (None, Some(role)) => ReadTarget::role(role),
        (None, None) => ReadTarget::any(),
    };

    let result = mesh.read(&operation, target).await;
    mesh.close_all().await;
    print_json(&result?)
}
