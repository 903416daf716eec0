mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{flag::FlagSubcommand, rules::RulesSubcommand, task::TaskSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "signalway",
    about = "Route signals into tasks, drive their lifecycle, and sweep overdue work",
    version,
    propagate_version = true
)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate rule documents
    Rules {
        #[command(subcommand)]
        subcommand: RulesSubcommand,
    },

    /// Dry-run a signal against a rule set; no side effects, replayable
    Simulate {
        /// Rule file (YAML sequence of rules)
        #[arg(long)]
        rules: PathBuf,
        /// Signal file (YAML)
        #[arg(long)]
        signal: PathBuf,
        /// Optional flag rows used during normalization
        #[arg(long)]
        flags: Option<PathBuf>,
        /// Evaluation time (RFC 3339, default: now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Ingest a signal: evaluate rules and apply the resolved actions
    Ingest {
        #[arg(long, env = "SIGNALWAY_DB")]
        db: PathBuf,
        #[arg(long)]
        rules: PathBuf,
        #[arg(long)]
        signal: PathBuf,
        /// Escalation policy file for attach_template actions
        #[arg(long)]
        policies: Option<PathBuf>,
        /// Organization profile file for SLA/priority defaults
        #[arg(long)]
        profiles: Option<PathBuf>,
        /// Ingest time (RFC 3339, default: now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Run one escalation sweep cycle
    Sweep {
        #[arg(long, env = "SIGNALWAY_DB")]
        db: PathBuf,
        #[arg(long)]
        policies: Option<PathBuf>,
        /// Restrict the sweep to one organization
        #[arg(long)]
        org: Option<String>,
        #[arg(long, default_value_t = 200)]
        limit_tasks: usize,
        #[arg(long, default_value_t = 200)]
        limit_instances: usize,
        /// Sweep time (RFC 3339, default: now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Inspect and drive tasks
    Task {
        #[command(subcommand)]
        subcommand: TaskSubcommand,
    },

    /// Evaluate and load feature flags
    Flag {
        #[command(subcommand)]
        subcommand: FlagSubcommand,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Rules { subcommand } => cmd::rules::run(subcommand, cli.json),
        Commands::Simulate {
            rules,
            signal,
            flags,
            at,
        } => cmd::simulate::run(&rules, &signal, flags.as_deref(), at.as_deref()),
        Commands::Ingest {
            db,
            rules,
            signal,
            policies,
            profiles,
            at,
        } => cmd::ingest::run(
            &db,
            &rules,
            &signal,
            policies.as_deref(),
            profiles.as_deref(),
            at.as_deref(),
            cli.json,
        ),
        Commands::Sweep {
            db,
            policies,
            org,
            limit_tasks,
            limit_instances,
            at,
        } => cmd::sweep::run(
            &db,
            policies.as_deref(),
            org.as_deref(),
            limit_tasks,
            limit_instances,
            at.as_deref(),
            cli.json,
        ),
        Commands::Task { subcommand } => cmd::task::run(subcommand, cli.json),
        Commands::Flag { subcommand } => cmd::flag::run(subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
