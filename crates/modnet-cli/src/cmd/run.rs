//! `modnet run` and `modnet check`.

use anyhow::Context as _;
use modnet_fleet::script::{CommandEntry, Item, LOCAL_HOST};
use modnet_fleet::{Orchestrator, Script};
use modnet_types::ModnetConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub fn cmd_check(path: &Path) -> anyhow::Result<i32> {
    let script = Script::load(path)?;
    println!("{}: ok", path.display());
    for item in &script.hosts {
        if let Item::Entry(host) = item {
            println!("  host {} -> {}", host.alias, host.hostname);
        }
    }
    for (index, module) in script.module_entries().enumerate() {
        println!(
            "  module {index}: {} on {} ({} default lines)",
            module.program,
            module.host.as_deref().unwrap_or(LOCAL_HOST),
            module.defaults.len()
        );
    }
    for item in &script.connections {
        if let Item::Entry(c) = item {
            println!("  connect {} -> {} over {}", c.client, c.server, c.protocol);
        }
    }
    let sends = script
        .commands
        .iter()
        .filter(|item| matches!(item, Item::Entry(CommandEntry::Send { .. })))
        .count();
    println!("  {sends} commands, {} cleanup lines", script.cleanup.len());
    Ok(0)
}

pub async fn cmd_run(
    mut config: ModnetConfig,
    path: PathBuf,
    listen: Option<String>,
    advertise: Option<String>,
    display: Option<String>,
) -> anyhow::Result<i32> {
    if let Some(listen) = listen {
        config.wire.listen_addr = listen;
    }
    if advertise.is_some() {
        config.fleet.advertise_host = advertise;
    }
    if display.is_some() {
        config.fleet.display = display;
    }
    config.validate()?;

    let script = Script::load(&path)?;
    let mut orchestrator = Orchestrator::new(&config, script)?;
    let report = orchestrator
        .run()
        .await
        .with_context(|| format!("running {}", path.display()))?;

    info!(
        modules = report.modules_started,
        cleanup = report.cleanup_ran,
        "Orchestration finished"
    );
    if report.all_clean() {
        Ok(0)
    } else {
        warn!("At least one supervised child failed");
        Ok(1)
    }
}
