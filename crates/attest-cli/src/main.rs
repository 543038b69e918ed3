mod cmd;
mod output;
mod root;

use attest_core::AttestError;
use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, gate::GateArgs, ledger::LedgerSubcommand, pack::PackSubcommand,
    proposal::ProposalSubcommand, run::RunSubcommand, signal::SignalSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "attest",
    about = "Tamper-evident governance: hash-chained ledger, approvals, pipeline gates, knowledge packs",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from governance/ or .git/)
    #[arg(long, global = true, env = "ATTEST_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the governance and knowledge directories and a default config
    Init {
        /// Project name recorded in config.yaml (default: directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Inspect and validate governance/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Verify and read the hash-chained ledger
    Ledger {
        #[command(subcommand)]
        subcommand: LedgerSubcommand,
    },

    /// Record observations that motivate a change
    Signal {
        #[command(subcommand)]
        subcommand: SignalSubcommand,
    },

    /// Create, validate and approve change proposals
    Proposal {
        #[command(subcommand)]
        subcommand: ProposalSubcommand,
    },

    /// Build, verify, apply and roll back knowledge packs
    Pack {
        #[command(subcommand)]
        subcommand: PackSubcommand,
    },

    /// Gate one completed pipeline step
    Gate(GateArgs),

    /// Bracket and summarize a pipeline run
    Run {
        #[command(subcommand)]
        subcommand: RunSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { name } => cmd::init::run(&root, name.as_deref(), cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Ledger { subcommand } => cmd::ledger::run(&root, subcommand, cli.json),
        Commands::Signal { subcommand } => cmd::signal::run(&root, subcommand, cli.json),
        Commands::Proposal { subcommand } => cmd::proposal::run(&root, subcommand, cli.json),
        Commands::Pack { subcommand } => cmd::pack::run(&root, subcommand, cli.json),
        Commands::Gate(args) => cmd::gate::run(&root, args, cli.json),
        Commands::Run { subcommand } => cmd::run::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

/// Exit code of the first [`AttestError`] in the chain; anything else is an
/// operational failure.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<AttestError>())
        .map_or(1, AttestError::exit_code)
}
