//! Command-line interface definitions for the `hotswap` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, ValueEnum};

/// Top-level CLI for the `hotswap` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hotswap",
    about = "Replace instance VMs by creating the new VM before retiring the old one",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run a hot-swap deploy against an in-memory cloud.
    #[command(
        name = "simulate",
        about = "Run a hot-swap deploy against an in-memory cloud"
    )]
    Simulate(SimulateCommand),
}

/// Failure injected into the simulated deploy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum FaultArg {
    /// Replacement agents refuse to mount disks.
    RejectMount,
    /// Replacement jobs report failing after start.
    FailHealth,
    /// The provider refuses to create replacement VMs.
    CreateError,
}

/// Arguments for the `hotswap simulate` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct SimulateCommand {
    /// Instance group name.
    #[arg(long, default_value = "foobar", value_name = "NAME")]
    pub(crate) group: String,
    /// Number of instances in the group.
    #[arg(long, default_value_t = 1, value_name = "COUNT")]
    pub(crate) instances: usize,
    /// Give every instance a persistent disk of this size in megabytes.
    #[arg(long, value_name = "MB")]
    pub(crate) persistent_disk: Option<u64>,
    /// Mark every instance as needing a new VM.
    #[arg(long)]
    pub(crate) recreate: bool,
    /// Override the configured update strategy (`hot-swap` or `in-place`).
    #[arg(long, value_name = "STRATEGY")]
    pub(crate) strategy: Option<String>,
    /// Override the configured bound on concurrently updating instances.
    #[arg(long, value_name = "COUNT")]
    pub(crate) max_in_flight: Option<usize>,
    /// Override the configured canary count.
    #[arg(long, value_name = "COUNT")]
    pub(crate) canaries: Option<usize>,
    /// Inject a failure into the deploy.
    #[arg(long, value_enum, value_name = "FAULT")]
    pub(crate) fault: Option<FaultArg>,
    /// Delay every simulated provider call and agent reply.
    #[arg(long, default_value_t = 0, value_name = "MS")]
    pub(crate) latency_ms: u64,
    /// Print the task lines, report and VM listing as JSON.
    #[arg(long)]
    pub(crate) json: bool,
    /// Log debug events to stderr.
    #[arg(short, long)]
    pub(crate) verbose: bool,
}
