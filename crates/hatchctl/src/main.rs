//! Hatch Control - command-line front end for a Hatch installation
//!
//! Loads modules, invokes capabilities and drives update transactions
//! against one installation root. Lifecycle logic lives in `hatch_common`.

mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hatch_common::error::EXIT_GENERAL_ERROR;
use hatch_common::HatchError;
use semver::Version;
use tracing::error;

use commands::Context;

#[derive(Parser)]
#[command(name = "hatchctl")]
#[command(about = "Hatch - module lifecycle and atomic updates", long_about = None)]
#[command(version)]
struct Cli {
    /// Installation root (default: $HATCH_ROOT, then /opt/hatch)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Configuration file (default: <root>/hatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load modules and their dependencies
    ModuleLoad {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Unload a module
    ModuleUnload {
        name: String,

        /// Unload loaded dependents first
        #[arg(long)]
        force: bool,
    },

    /// Invoke a capability, loading its module on first use
    Call {
        capability: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Check for, apply or roll back application updates
    Update {
        #[command(subcommand)]
        action: UpdateAction,
    },

    /// Update the framework's own installation
    SelfUpdate {
        /// Target version (default: newest available)
        version: Option<Version>,
    },

    /// Show installed version, modules, backups and lock state
    Status {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum UpdateAction {
    /// Compare the live version with the update source
    Check,

    /// Stage, verify and apply a release
    Apply {
        /// Target version (default: newest available)
        version: Option<Version>,
    },

    /// Restore a retained backup
    Rollback {
        /// Backup version to restore (default: newest backup)
        version: Option<Version>,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let ctx = Context::open(cli.root, cli.config)?;

    match cli.command {
        Commands::ModuleLoad { names } => commands::module::load(&ctx, &names),
        Commands::ModuleUnload { name, force } => commands::module::unload(&ctx, &name, force),
        Commands::Call { capability, args } => commands::module::call(&ctx, &capability, &args),
        Commands::Update { action } => match action {
            UpdateAction::Check => commands::update::check(&ctx),
            UpdateAction::Apply { version } => commands::update::apply(&ctx, version),
            UpdateAction::Rollback { version } => commands::update::rollback(&ctx, version),
        },
        Commands::SelfUpdate { version } => commands::update::self_update(&ctx, version),
        Commands::Status { json } => commands::status::show(&ctx, json),
    }
}

/// Typed errors carry their own exit code; anything else is generic
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<HatchError>()
        .map(HatchError::exit_code)
        .unwrap_or(EXIT_GENERAL_ERROR)
}
