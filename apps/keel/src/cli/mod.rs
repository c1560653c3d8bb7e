//! # Keel CLI Module
//!
//! ## Available Commands
//!
//! - `serve` - Start the HTTP server
//! - `status` - Show catalog status
//! - `assemble` - Assemble and print a config tree
//! - `check` - Assemble every module and report rule violations
//! - `fire` - Fire a state machine event and save the snapshot
//! - `apply` - Apply mutations from a file and save the snapshot
//! - `init` - Write an example snapshot

mod commands;

use clap::{Parser, Subcommand};
use keel::config::KeelConfig;
use keel_core::KeelError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Keel - deterministic configuration engine
///
/// Assembles module/group/option trees from a catalog snapshot, checks
/// dependency rules and drives per-module state machines.
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to keel.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the JSON snapshot (overrides the config file)
    #[arg(short, long, global = true)]
    pub snapshot: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Serve {
        /// Host to bind to (overrides the config file)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show catalog status
    Status,

    /// Assemble the config of one or more modules
    Assemble {
        /// Module keys
        #[arg(required = true)]
        modules: Vec<String>,

        /// Apply this project's overrides
        #[arg(short, long)]
        project: Option<String>,

        /// Write the assembled tree to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Assemble every active module and fail on violated rules
    Check {
        /// Also check each project's overrides
        #[arg(long)]
        projects: bool,
    },

    /// Fire a state machine event and save the new state
    Fire {
        /// Module key
        module: String,

        /// Event name
        event: String,

        /// Evaluate the guard against this project's selection
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Apply a JSON array of mutations and save the snapshot
    Apply {
        /// Path to the mutations file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Write an example snapshot
    Init {
        /// Overwrite an existing snapshot
        #[arg(short, long)]
        force: bool,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), KeelError> {
    let mut config = KeelConfig::load(cli.config.as_deref())?.with_env();
    if let Some(snapshot) = cli.snapshot {
        config.snapshot = Some(snapshot);
    }
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Serve { host, port }) => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            cmd_serve(&config).await
        }
        Some(Commands::Status) | None => cmd_status(&config, json_mode),
        Some(Commands::Assemble {
            modules,
            project,
            output,
        }) => cmd_assemble(&config, json_mode, &modules, project.as_deref(), output.as_deref()),
        Some(Commands::Check { projects }) => cmd_check(&config, json_mode, projects),
        Some(Commands::Fire {
            module,
            event,
            project,
        }) => cmd_fire(&config, json_mode, &module, &event, project.as_deref()),
        Some(Commands::Apply { file }) => cmd_apply(&config, json_mode, &file),
        Some(Commands::Init { force }) => cmd_init(&config, force),
    }
}
