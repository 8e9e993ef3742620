//! CLI struct definitions for the lanegate command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use crate::core::ledger::LedgerKind;
use crate::core::output::OutputFormat;
use crate::plugins::batch::CollectKind;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "lanegate",
    version = env!("CARGO_PKG_VERSION"),
    about = "Collects per-module coverage and latency telemetry into manifests and append-only ledgers, and gates CI on lane coverage targets."
)]
pub struct Cli {
    /// Project root (defaults to the nearest ancestor containing `.lanegate/`).
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    /// Config file (defaults to `<root>/.lanegate/config.toml`).
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Raise log verbosity to debug unless LANEGATE_LOG is set.
    #[clap(long, short = 'v', global = true)]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one module's tests under coverage and record the result.
    CollectCoverage(CollectModuleCli),
    /// Run one module's benchmarks and record p50/p95/p99 latency.
    CollectBenchmark(CollectModuleCli),
    /// Check every tested module's observed coverage against its lane target.
    CoverageGate(GateCli),
    /// Collect telemetry for every module touched by a change list.
    Collect(CollectTouchedCli),
    /// Inspect the append-only ledgers.
    Ledger(LedgerCli),
}

#[derive(clap::Args, Debug)]
pub struct CollectModuleCli {
    /// Module id (manifest directory relative to the modules root).
    #[clap(long)]
    pub module: String,
    /// Override the configured runner timeout.
    #[clap(long)]
    pub timeout_secs: Option<u64>,
    #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(clap::Args, Debug)]
pub struct GateCli {
    #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(clap::Args, Debug)]
pub struct CollectTouchedCli {
    /// File listing touched paths or module ids, one per line; `-` reads stdin.
    #[clap(long)]
    pub touched: PathBuf,
    #[clap(long, value_enum, default_value_t = CollectKind::All)]
    pub kind: CollectKind,
    /// Worker threads; modules are collected in parallel.
    #[clap(long, default_value_t = 4)]
    pub jobs: usize,
    /// Override the configured runner timeouts.
    #[clap(long)]
    pub timeout_secs: Option<u64>,
    #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(clap::Args, Debug)]
pub struct LedgerCli {
    #[clap(subcommand)]
    pub command: LedgerCommand,
}

#[derive(Subcommand, Debug)]
pub enum LedgerCommand {
    /// Print the most recent entries.
    Tail {
        #[clap(long, value_enum)]
        kind: LedgerKind,
        #[clap(short = 'n', long, default_value_t = 10)]
        n: usize,
        /// Only entries for this module.
        #[clap(long)]
        module: Option<String>,
    },
    /// Check that every line is a complete, in-range entry.
    Verify {
        #[clap(long, value_enum)]
        kind: LedgerKind,
    },
}
