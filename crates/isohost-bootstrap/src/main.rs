mod workload;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use isohost::bootstrap::{load_config, serve};
use isohost::{ChannelName, DisposeReason};
use isohost_contracts::{EXIT_OK, EXIT_OWNER_LOST, EXIT_STARTUP_FAILED, EXIT_WATCHDOG_EXPIRED};

#[derive(Parser)]
#[command(name = "isohost-bootstrap")]
#[command(about = "Hosts a workload in an isolated process for an isohost supervisor.", long_about = None)]
struct Cli {
    /// Channel binding name assigned by the supervisor.
    #[arg(long, value_name = "NAME")]
    ipc: String,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    match try_main() {
        Ok(DisposeReason::Requested) => ExitCode::from(EXIT_OK),
        Ok(DisposeReason::WatchdogExpired) => ExitCode::from(EXIT_WATCHDOG_EXPIRED),
        Ok(DisposeReason::OwnerLost) => ExitCode::from(EXIT_OWNER_LOST),
        Err(err) => {
            // Plain stderr so the supervisor's diagnostics get it whatever RUST_LOG says.
            eprintln!("isohost-bootstrap: {err:#}");
            ExitCode::from(EXIT_STARTUP_FAILED)
        }
    }
}

fn try_main() -> Result<DisposeReason> {
    let cli = Cli::parse();
    let channel = ChannelName::parse(&cli.ipc).context("parse --ipc")?;
    let exe = std::env::current_exe().context("locate bootstrap executable")?;
    let config = load_config(&exe, &channel)?;
    serve(config, workload::demo_registry())
}
