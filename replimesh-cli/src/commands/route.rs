//! `replimesh route`: show where an operation would go without running it

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use clap::Parser;

use replimesh_core::{InstanceId, Role};

use super::{affected, connect, join, load_config};

#[derive(Parser, Debug)]
pub struct RouteArgs {
    /// Role of the caller (code like PP or name like primary_teacher)
    #[arg(long)]
    pub role: Option<Role>,

    /// Preview a write instead of a read
    #[arg(long)]
    pub write: bool,

    /// Explicit instance (required for writes)
    #[arg(long)]
    pub instance: Option<String>,

    /// Roles whose data a write affects (comma-separated, default: all)
    #[arg(long, value_delimiter = ',')]
    pub affects: Vec<Role>,

    /// Repeat read selection and print the distribution
    #[arg(long, default_value_t = 1)]
    pub samples: usize,
}

pub fn run_route(config: Option<&Path>, args: RouteArgs) -> Result<()> {
    let mesh = connect(load_config(config)?)?;
    let explicit = args.instance.map(InstanceId::new);
    let is_read = !args.write;

    let chosen = mesh.selector().select(explicit.as_ref(), args.role, is_read)?;
    let access = if is_read { "read" } else { "write" };
    println!("→ {} routed to {}", access, chosen);

    if is_read && explicit.is_none() && args.samples > 1 {
        let mut counts: BTreeMap<InstanceId, usize> = BTreeMap::new();
        *counts.entry(chosen.clone()).or_default() += 1;
        for _ in 1..args.samples {
            let next = mesh.selector().select(None, args.role, true)?;
            *counts.entry(next).or_default() += 1;
        }
        for (instance, count) in &counts {
            println!("   {:<12} {}", instance.as_str(), count);
        }
    }

    if !is_read {
        let destinations = mesh
            .dispatcher()
            .destinations(&chosen, affected(&args.affects));
        if destinations.is_empty() {
            println!("   no replication (no other instance serves the affected roles)");
        } else {
            println!("   replicates to {}", join(&destinations));
        }
    }
    Ok(())
}
