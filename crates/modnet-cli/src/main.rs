//! modnet CLI: run orchestrations, slave daemons and overlay modules.
//!
//! Every subcommand runs on a single-threaded tokio runtime; the connection
//! manager's callbacks never cross threads.

mod cli;
mod cmd;

use crate::cli::{Cli, Commands};
use clap::Parser;
use modnet_types::ModnetConfig;
use std::future::Future;
use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;

fn log_dispatch<W>(default_level: &str, json: bool, writer: W) -> Dispatch
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
    if json {
        Dispatch::new(builder.json().finish())
    } else {
        Dispatch::new(builder.finish())
    }
}

/// Load the config with logging at the default level, so fallback warnings
/// are not lost before the configured level is known.
fn load_config_logged(cli: &Cli) -> ModnetConfig {
    let bootstrap = log_dispatch(&ModnetConfig::default().log_level, cli.log_json, std::io::stderr);
    tracing::dispatcher::with_default(&bootstrap, || modnet_fleet::load_config(cli.config.as_deref()))
}

fn block_on<F: Future<Output = anyhow::Result<i32>>>(future: F) -> anyhow::Result<i32> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(future)
}

fn main() {
    let cli = Cli::parse();
    let config = load_config_logged(&cli);
    let dispatch = log_dispatch(&config.log_level, cli.log_json, std::io::stderr);
    if let Err(e) = tracing::dispatcher::set_global_default(dispatch) {
        eprintln!("Failed to install logger: {e}");
    }

    let result = match cli.command {
        Commands::Check { script } => cmd::run::cmd_check(&script),
        Commands::Run {
            script,
            listen,
            advertise,
            display,
        } => block_on(cmd::run::cmd_run(config, script, listen, advertise, display)),
        Commands::Slave {
            orchestrator,
            alias,
            display,
        } => block_on(cmd::slave::cmd_slave(config, orchestrator, alias, display)),
        Commands::Overlay {
            master,
            connect,
            listen,
            name,
            x_label,
            y_label,
        } => block_on(cmd::overlay::cmd_overlay(
            config,
            cmd::overlay::OverlayArgs {
                master,
                connect,
                listen,
                name,
                x_label,
                y_label,
            },
        )),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
