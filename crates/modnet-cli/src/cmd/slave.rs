//! `modnet slave`.

use anyhow::Context as _;
use modnet_fleet::control::resolve;
use modnet_fleet::SlaveDaemon;
use modnet_types::ModnetConfig;

pub async fn cmd_slave(
    mut config: ModnetConfig,
    orchestrator: String,
    alias: String,
    display: Option<String>,
) -> anyhow::Result<i32> {
    let (host, port) = orchestrator
        .rsplit_once(':')
        .context("--orchestrator must be host:port")?;
    let port: u16 = port.parse().context("--orchestrator port is not a number")?;
    let addr = resolve(host.trim_matches(['[', ']']), port)?;

    config.module_name = format!("{alias}-slave");
    SlaveDaemon::new(&config, addr, &alias, display)?.run().await?;
    Ok(0)
}
