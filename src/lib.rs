//! # lanegate
//!
//! Per-module test telemetry and policy gating for repositories made of many
//! independently described modules.
//!
//! Each module carries a JSON manifest. The collectors run a module's test or
//! benchmark suite, derive a coverage percentage or latency percentiles, write
//! the latest value into the manifest and append the same value to an
//! append-only NDJSON ledger. The coverage gate then reads every manifest and
//! fails CI when a tested module falls below its lane's target.
//!
//! ## Layout
//!
//! - [`core`]: configuration, manifests, lanes, ledgers, locking, subprocess runners.
//! - [`plugins`]: the coverage and benchmark collectors, the gate, and batch collection.
//!
//! ## Exit codes
//!
//! `0` for success or a benign exemption (no tests, no benchmarks), `1` for a
//! gate violation, a runner failure, or any hard error.

pub mod cli;
pub mod core;
pub mod plugins;

use crate::cli::{Cli, CollectModuleCli, CollectTouchedCli, Command, GateCli, LedgerCommand};
use crate::core::config::{self, Settings};
use crate::core::error::LanegateError;
use crate::core::ledger::{self, Ledger, LedgerKind};
use crate::core::output::{self, OutputFormat};
use crate::core::runner::{CommandRunner, RunnerFailure};
use crate::core::time;
use crate::plugins::CollectOptions;
use crate::plugins::batch::{self, BatchRequest, BatchSummary};
use crate::plugins::benchmark::{self, BenchmarkOutcome};
use crate::plugins::coverage::{self, CoverageOutcome};
use crate::plugins::gate::{self, GateReport, ViolationReason};

use colored::Colorize;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Dispatch a parsed command line. Returns the process exit code.
pub fn run(cli: Cli) -> Result<u8, LanegateError> {
    let root = resolve_root(cli.root.as_deref())?;
    let settings = config::load_settings(&root, cli.config.as_deref())?;
    debug!(root = %settings.project_root.display(), "settings loaded");

    match cli.command {
        Command::CollectCoverage(args) => run_collect_coverage(&settings, &args),
        Command::CollectBenchmark(args) => run_collect_benchmark(&settings, &args),
        Command::CoverageGate(args) => run_coverage_gate(&settings, &args),
        Command::Collect(args) => run_collect_touched(&settings, &args),
        Command::Ledger(ledger_cli) => match ledger_cli.command {
            LedgerCommand::Tail { kind, n, module } => {
                run_ledger_tail(&settings, kind, n, module.as_deref())
            }
            LedgerCommand::Verify { kind } => run_ledger_verify(&settings, kind),
        },
    }
}

fn resolve_root(explicit: Option<&Path>) -> Result<PathBuf, LanegateError> {
    if let Some(root) = explicit {
        return std::fs::canonicalize(root).map_err(|e| {
            LanegateError::ConfigError(format!("project root {}: {}", root.display(), e))
        });
    }
    let cwd = std::env::current_dir()?;
    match config::find_project_root(&cwd) {
        Ok(root) => Ok(root),
        Err(e) => {
            debug!(error = %e, "falling back to the working directory as project root");
            Ok(cwd)
        }
    }
}

fn collect_options(timeout_secs: Option<u64>) -> CollectOptions {
    CollectOptions {
        timeout: timeout_secs.map(Duration::from_secs),
    }
}

fn print_json(value: &serde_json::Value) -> Result<(), LanegateError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_failure(failure: &RunnerFailure) {
    eprintln!("{} {}", "✗".red().bold(), failure.summary());
}

fn run_collect_coverage(settings: &Settings, args: &CollectModuleCli) -> Result<u8, LanegateError> {
    let outcome = coverage::collect_coverage(
        settings,
        &args.module,
        &CommandRunner,
        &collect_options(args.timeout_secs),
    )?;
    let code = if outcome.is_failure() { 1 } else { 0 };

    match args.format {
        OutputFormat::Json => {
            let status = match &outcome {
                CoverageOutcome::Success(_) => "ok",
                CoverageOutcome::NoTestsFound { .. } => "exempt",
                CoverageOutcome::RunnerFailure(_) => "failed",
            };
            print_json(&time::command_envelope(
                "collect-coverage",
                status,
                json!({ "result": outcome }),
            ))?;
        }
        OutputFormat::Text => match &outcome {
            CoverageOutcome::Success(obs) => println!(
                "{} {}: coverage {:.2}%",
                "✓".green().bold(),
                obs.module,
                obs.coverage
            ),
            CoverageOutcome::NoTestsFound { module } => {
                println!("{} {}: no tests found, exempt", "-".yellow(), module)
            }
            CoverageOutcome::RunnerFailure(failure) => print_failure(failure),
        },
    }
    Ok(code)
}

fn run_collect_benchmark(settings: &Settings, args: &CollectModuleCli) -> Result<u8, LanegateError> {
    let env = benchmark::probe_environment(settings);
    let outcome = benchmark::collect_benchmark(
        settings,
        &args.module,
        &CommandRunner,
        &env,
        &collect_options(args.timeout_secs),
    )?;
    let code = if outcome.is_failure() { 1 } else { 0 };

    match args.format {
        OutputFormat::Json => {
            let status = match &outcome {
                BenchmarkOutcome::Success(_) => "ok",
                BenchmarkOutcome::NoBenchmarksFound { .. } => "exempt",
                BenchmarkOutcome::RunnerFailure(_) => "failed",
            };
            print_json(&time::command_envelope(
                "collect-benchmark",
                status,
                json!({ "environment": env, "result": outcome }),
            ))?;
        }
        OutputFormat::Text => match &outcome {
            BenchmarkOutcome::Success(obs) => println!(
                "{} {}: p50 {:.3}ms  p95 {:.3}ms  p99 {:.3}ms  ({} samples, env {})",
                "✓".green().bold(),
                obs.module,
                obs.performance.latency_p50_ms,
                obs.performance.latency_p95_ms,
                obs.performance.latency_p99_ms,
                obs.samples,
                obs.performance.env_fingerprint
            ),
            BenchmarkOutcome::NoBenchmarksFound { module } => {
                println!("{} {}: no benchmarks found, skipped", "-".yellow(), module)
            }
            BenchmarkOutcome::RunnerFailure(failure) => print_failure(failure),
        },
    }
    Ok(code)
}

fn render_gate_text(report: &GateReport) {
    for v in &report.violations {
        let observed = v
            .observed
            .map(|o| format!("{:.2}", o))
            .unwrap_or_else(|| "none".to_string());
        let why = match v.reason {
            ViolationReason::BelowTarget => "below target".to_string(),
            ViolationReason::MissingObservation => "no coverage observed".to_string(),
            ViolationReason::InvalidManifest => format!(
                "invalid manifest: {}",
                output::compact_line(v.detail.as_deref().unwrap_or(""), 200)
            ),
        };
        println!(
            "{} {}: observed {} target {:.2} lane {} ({})",
            "✗".red().bold(),
            v.module,
            observed,
            v.target,
            v.lane,
            why
        );
    }
    let tally = format!(
        "{} checked, {} passed, {} exempt, {} violations",
        report.checked,
        report.passed,
        report.exempt.len(),
        report.violations.len()
    );
    if report.is_pass() {
        println!("{} coverage gate passed: {}", "✓".green().bold(), tally);
    } else {
        println!("{} coverage gate failed: {}", "✗".red().bold(), tally);
    }
}

fn run_coverage_gate(settings: &Settings, args: &GateCli) -> Result<u8, LanegateError> {
    let report = gate::run_gate(settings)?;
    match args.format {
        OutputFormat::Json => print_json(&time::command_envelope(
            "coverage-gate",
            if report.is_pass() { "pass" } else { "fail" },
            json!({ "report": report }),
        ))?,
        OutputFormat::Text => render_gate_text(&report),
    }
    Ok(report.exit_code())
}

fn read_touched(path: &Path) -> Result<String, LanegateError> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).map_err(|e| {
        LanegateError::ValidationError(format!("cannot read touched list {}: {}", path.display(), e))
    })
}

fn render_batch_text(summary: &BatchSummary) {
    for result in &summary.modules {
        if let Some(err) = &result.error {
            eprintln!("{} {}: {}", "✗".red().bold(), result.module, err);
        }
        match &result.coverage {
            Some(CoverageOutcome::Success(obs)) => println!(
                "{} {}: coverage {:.2}%",
                "✓".green().bold(),
                obs.module,
                obs.coverage
            ),
            Some(CoverageOutcome::NoTestsFound { module }) => {
                println!("{} {}: no tests found, exempt", "-".yellow(), module)
            }
            Some(CoverageOutcome::RunnerFailure(failure)) => print_failure(failure),
            None => {}
        }
        match &result.benchmark {
            Some(BenchmarkOutcome::Success(obs)) => println!(
                "{} {}: p50 {:.3}ms  p95 {:.3}ms  p99 {:.3}ms",
                "✓".green().bold(),
                obs.module,
                obs.performance.latency_p50_ms,
                obs.performance.latency_p95_ms,
                obs.performance.latency_p99_ms
            ),
            Some(BenchmarkOutcome::NoBenchmarksFound { module }) => {
                println!("{} {}: no benchmarks found, skipped", "-".yellow(), module)
            }
            Some(BenchmarkOutcome::RunnerFailure(failure)) => print_failure(failure),
            None => {}
        }
    }
    if !summary.unmatched.is_empty() {
        println!(
            "{} ignored paths outside any module: {}",
            "-".yellow(),
            output::preview_messages(&summary.unmatched, 5, 120)
        );
    }
    let failed = summary.failed_modules();
    if failed.is_empty() {
        println!("{} {} modules collected", "✓".green().bold(), summary.modules.len());
    } else {
        println!(
            "{} {} of {} modules failed: {}",
            "✗".red().bold(),
            failed.len(),
            summary.modules.len(),
            failed.join(", ")
        );
    }
}

fn run_collect_touched(settings: &Settings, args: &CollectTouchedCli) -> Result<u8, LanegateError> {
    let touched = batch::parse_touched(&read_touched(&args.touched)?);
    let request = BatchRequest {
        touched: &touched,
        kind: args.kind,
        jobs: args.jobs,
        options: collect_options(args.timeout_secs),
    };
    let summary = batch::collect_touched(settings, &request, &CommandRunner, None)?;

    match args.format {
        OutputFormat::Json => print_json(&time::command_envelope(
            "collect",
            if summary.exit_code() == 0 { "ok" } else { "failed" },
            json!({ "summary": summary }),
        ))?,
        OutputFormat::Text => render_batch_text(&summary),
    }
    Ok(summary.exit_code())
}

fn ledger_for(settings: &Settings, kind: LedgerKind) -> Ledger {
    let path = match kind {
        LedgerKind::Coverage => &settings.coverage_ledger,
        LedgerKind::Benchmark => &settings.benchmark_ledger,
    };
    Ledger::new(path, settings.lock)
}

fn run_ledger_tail(
    settings: &Settings,
    kind: LedgerKind,
    n: usize,
    module: Option<&str>,
) -> Result<u8, LanegateError> {
    for line in ledger_for(settings, kind).tail(n, module)? {
        println!("{}", line);
    }
    Ok(0)
}

fn run_ledger_verify(settings: &Settings, kind: LedgerKind) -> Result<u8, LanegateError> {
    let ledger = ledger_for(settings, kind);
    let problems = ledger::verify(&ledger, kind)?;
    if problems.is_empty() {
        println!(
            "{} {} ledger ok ({} entries)",
            "✓".green().bold(),
            kind.as_str(),
            ledger.len()?
        );
        return Ok(0);
    }
    for p in &problems {
        println!("{} {}:{}: {}", "✗".red().bold(), ledger.path().display(), p.line, p.message);
    }
    Ok(1)
}
