//! replimesh CLI - operator tooling for a multi-instance document database
//!
//! - Inspect the instance directory and preview instance selection
//! - Run reads, writes and transactions against the configured instances
//! - Send replication envelopes by hand
//! - Validate configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

mod commands;
mod tracing_setup;

use tracing_setup::TracingConfig;

#[derive(Parser, Debug)]
#[command(
    name = "replimesh",
    author,
    version,
    about = "Route and replicate document-database operations across instances",
    long_about = "Reads go to a random instance serving the caller's role, writes go to an \
                  explicit instance and are replicated to the other instances serving the \
                  affected roles."
)]
struct Cli {
    /// Config file (default: ~/.replimesh/config.toml, falls back to environment variables)
    #[arg(long, global = true, env = "REPLIMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Export traces over OTLP (requires the telemetry feature)
    #[arg(long, global = true)]
    otel: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured instances and the roles they serve
    Instances(commands::instances::InstancesArgs),
    /// Preview instance selection and replication destinations
    Route(commands::route::RouteArgs),
    /// Run a read operation
    Read(commands::read::ReadArgs),
    /// Run a write operation on an explicit instance and replicate it
    Write(commands::write::WriteArgs),
    /// Run the operations in a JSON file as one transaction
    Transaction(commands::transaction::TransactionArgs),
    /// Send a replication envelope for an operation without executing it
    Replicate(commands::replicate::ReplicateArgs),
    /// Inspect and validate configuration
    Config(commands::config::ConfigArgs),
    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)] // PowerShell is a proper noun, not a suffix
enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_setup::init(&TracingConfig {
        debug: cli.debug,
        otel: cli.otel,
    })
    .ok();

    let config = cli.config.as_deref();
    let outcome = match cli.command {
        Commands::Instances(args) => commands::run_instances(config, args),
        Commands::Route(args) => commands::run_route(config, args),
        Commands::Read(args) => commands::run_read(config, args).await,
        Commands::Write(args) => commands::run_write(config, args).await,
        Commands::Transaction(args) => commands::run_transaction(config, args).await,
        Commands::Replicate(args) => commands::run_replicate(config, args).await,
        Commands::Config(args) => commands::run_config(config, args),
        Commands::Completions(args) => run_completions(args),
    };

    tracing_setup::shutdown_otel();
    outcome
}

fn run_completions(args: CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    use clap_complete::{generate, Shell as CompletionShell};
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    let shell = match args.shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    };

    generate(shell, &mut cmd, bin_name, &mut io::stdout());
    Ok(())
}
