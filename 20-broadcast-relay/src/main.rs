use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, error::ErrorKind};
use tracing::{error, info};

use broadcast_relay::{
    cli::{Cli, USAGE},
    relay::{Relay, RelayConfig},
    shutdown,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> ExitCode {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(_) => return usage(),
    };
    let Some(config) = cli.relay_config() else {
        return usage();
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("relay exited with error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn usage() -> ExitCode {
    println!("{USAGE}");
    ExitCode::FAILURE
}

fn run(config: RelayConfig) -> Result<()> {
    let relay = Relay::bind(config)?;
    shutdown::spawn_ctrl_c_watcher(relay.shutdown_handle())
        .context("failed to watch for ctrl-c")?;
    info!("relay listening on {}", relay.local_addr()?);

    let report = relay.run()?;
    info!(
        connections = report.connections_closed,
        discarded = report.messages_discarded,
        "relay stopped"
    );
    Ok(())
}
