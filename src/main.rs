//! Binary entry point for the `hotswap` CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use hotswap::sim::{Fault, ScenarioOptions, ScenarioOutcome, run_scenario};
use hotswap::{ConfigError, OrchestratorConfig, telemetry};

mod cli;

use cli::{Cli, FaultArg, SimulateCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
    #[error("failed to render JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Simulate(command) => simulate(command).await,
    }
}

impl From<FaultArg> for Fault {
    fn from(value: FaultArg) -> Self {
        match value {
            FaultArg::RejectMount => Self::RejectMount,
            FaultArg::FailHealth => Self::FailHealth,
            FaultArg::CreateError => Self::CreateError,
        }
    }
}

fn apply_overrides(mut config: OrchestratorConfig, args: &SimulateCommand) -> OrchestratorConfig {
    if let Some(strategy) = &args.strategy {
        config.strategy.clone_from(strategy);
    }
    if let Some(max_in_flight) = args.max_in_flight {
        config.max_in_flight = max_in_flight;
    }
    if let Some(canaries) = args.canaries {
        config.canaries = canaries;
    }
    config
}

async fn simulate(args: SimulateCommand) -> Result<i32, CliError> {
    let verbosity = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    if let Err(err) = telemetry::init(verbosity) {
        writeln!(io::stderr(), "logging disabled: {err}").ok();
    }

    let config = apply_overrides(OrchestratorConfig::load_without_cli_args()?, &args);
    let update = config.as_update_config()?;
    let timings = config.timings()?;
    let options = ScenarioOptions {
        group: args.group,
        instances: args.instances,
        persistent_disk_mb: args.persistent_disk,
        recreate: args.recreate,
        fault: args.fault.map(Fault::from),
        latency: Duration::from_millis(args.latency_ms),
    };

    let outcome = run_scenario(&options, &update, timings).await;
    let mut stdout = io::stdout().lock();
    if args.json {
        serde_json::to_writer_pretty(&mut stdout, &outcome)?;
        writeln!(stdout)?;
    } else {
        write_text(&mut stdout, &outcome)?;
    }
    Ok(if outcome.report.is_success() { 0 } else { 1 })
}

fn write_text(mut target: impl Write, outcome: &ScenarioOutcome) -> io::Result<()> {
    for line in &outcome.task {
        writeln!(target, "{line}")?;
    }
    writeln!(target)?;
    writeln!(
        target,
        "{:<48} {:<6} {:<8} {:<16} {:<10} {}",
        "Instance", "AZ", "VM CID", "IPs", "State", "VM Type"
    )?;
    for vm in &outcome.vms {
        writeln!(
            target,
            "{:<48} {:<6} {:<8} {:<16} {:<10} {}",
            vm.instance_name,
            vm.availability_zone,
            vm.vm_cid,
            vm.ip_addresses.join(","),
            vm.process_state.as_str(),
            vm.vm_type
        )?;
    }
    writeln!(target)?;
    writeln!(target, "{}", outcome.report)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
