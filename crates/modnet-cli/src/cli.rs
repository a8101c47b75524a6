//! Clap CLI definitions for modnet.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  modnet check fleet.script          Validate an orchestration script
  modnet run fleet.script            Run an orchestration script
  modnet overlay --master            Serve an overlay list
  modnet overlay --connect host:port Follow an overlay master";

/// Networked modules, replicated overlays and script-driven orchestration.
#[derive(Parser)]
#[command(name = "modnet", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an orchestration script to completion.
    Run {
        /// Script to run.
        script: PathBuf,
        /// Listen address, overriding `wire.listen_addr`.
        #[arg(long)]
        listen: Option<String>,
        /// Address remote hosts use to reach this machine.
        #[arg(long)]
        advertise: Option<String>,
        /// Display handed to remote hosts.
        #[arg(long)]
        display: Option<String>,
    },
    /// Parse a script and print what it would do.
    Check {
        script: PathBuf,
    },
    /// Per-host daemon started by an orchestrator's bootstrap command.
    Slave {
        /// Orchestrator address as `host:port`.
        #[arg(long)]
        orchestrator: String,
        /// Host alias from the script's HOSTLIST.
        #[arg(long)]
        alias: String,
        /// Display for modules started on this host.
        #[arg(long)]
        display: Option<String>,
    },
    /// Demo module holding one replicated overlay list.
    Overlay {
        /// Hold the master list and accept slaves.
        #[arg(long)]
        master: bool,
        /// Master to follow, as `host:port`.
        #[arg(long, conflicts_with = "master")]
        connect: Option<String>,
        /// Listen address, overriding `wire.listen_addr`.
        #[arg(long)]
        listen: Option<String>,
        /// Module name used in handshakes.
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "x")]
        x_label: String,
        #[arg(long, default_value = "y")]
        y_label: String,
    },
}
