//! Benchmark collector.
//!
//! Pools every timing sample a module's benchmark run produced, reduces them
//! to p50/p95/p99 and stamps the result with an environment fingerprint, so
//! latencies from different machines or runtimes are never compared blindly.

use crate::core::config::Settings;
use crate::core::error::LanegateError;
use crate::core::ledger::{BenchmarkLedgerEntry, Ledger};
use crate::core::manifest::{self, ModuleRef, PerformanceObservation};
use crate::core::runner::{self, FailureKind, RunOutput, RunSpec, RunnerFailure, SuiteRunner};
use crate::core::time;
use crate::plugins::CollectOptions;
use crate::plugins::coverage::sanitize_id;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const UNKNOWN_RUNTIME: &str = "unknown";

/// Runtime/OS/architecture triple the fingerprint is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentInfo {
    pub runtime: String,
    pub os: String,
    pub arch: String,
}

impl EnvironmentInfo {
    /// Describe this host, with `runtime` taken from the benchmark runner.
    pub fn current(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// `arch=<..>;os=<..>;runtime=<..>` with fields in fixed order.
    pub fn canonical(&self) -> String {
        format!(
            "arch={};os={};runtime={}",
            self.arch.trim(),
            self.os.trim(),
            self.runtime.trim()
        )
    }

    /// First 16 hex chars of SHA-256 over the canonical string.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }
}

/// Linear interpolation between closest ranks: `rank = p/100 * (n-1)`.
/// `sorted` must be ascending and non-empty.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * weight
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencySummary {
    /// `None` for an empty sample set.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        Some(Self {
            samples: sorted.len(),
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReportShape {
    Flat(Vec<f64>),
    Cases(Vec<BenchmarkCase>),
}

/// One named case; only its samples matter, the name is informational.
#[derive(Debug, Deserialize)]
struct BenchmarkCase {
    samples_ms: Vec<f64>,
}

/// Pool all samples in a benchmark report into one module-level set.
pub fn parse_samples(report: &str) -> Result<Vec<f64>, String> {
    let shape: ReportShape = serde_json::from_str(report)
        .map_err(|e| format!("expected a JSON array of millisecond samples: {}", e))?;
    let samples: Vec<f64> = match shape {
        ReportShape::Flat(samples) => samples,
        ReportShape::Cases(cases) => cases.into_iter().flat_map(|c| c.samples_ms).collect(),
    };
    if let Some(bad) = samples.iter().find(|s| !s.is_finite() || **s < 0.0) {
        return Err(format!("sample {} is not a non-negative duration", bad));
    }
    Ok(samples)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkObservation {
    pub module: String,
    pub samples: usize,
    pub performance: PerformanceObservation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BenchmarkOutcome {
    Success(BenchmarkObservation),
    NoBenchmarksFound { module: String },
    RunnerFailure(RunnerFailure),
}

impl BenchmarkOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, BenchmarkOutcome::RunnerFailure(_))
    }
}

pub fn run_spec(settings: &Settings, module: &ModuleRef, timeout: Duration) -> RunSpec {
    let report = settings
        .benchmark
        .reports_dir
        .join(format!("{}.json", sanitize_id(&module.id)));
    let mut vars = BTreeMap::new();
    vars.insert("module", module.id.clone());
    vars.insert("module_dir", module.dir.to_string_lossy().to_string());
    vars.insert(
        "benchmarks_dir",
        module.benchmarks_dir(settings).to_string_lossy().to_string(),
    );
    vars.insert(
        "tests_dir",
        module.tests_dir(settings).to_string_lossy().to_string(),
    );
    vars.insert("report", report.to_string_lossy().to_string());
    RunSpec {
        program: settings.benchmark.program.clone(),
        args: runner::expand_args(&settings.benchmark.args, &vars),
        cwd: module.dir.clone(),
        timeout,
        report_path: Some(report),
    }
}

/// Decide what a finished benchmark run means. `Ok(None)` is "nothing measured".
pub fn classify(
    module: &str,
    out: &RunOutput,
    no_benchmarks_exit_codes: &[i32],
) -> Result<Option<LatencySummary>, RunnerFailure> {
    if let Some(failure) = RunnerFailure::from_process(module, out, no_benchmarks_exit_codes) {
        return Err(failure);
    }
    if out
        .exit_code
        .is_some_and(|c| c != 0 && no_benchmarks_exit_codes.contains(&c))
    {
        return Ok(None);
    }
    let Some(report) = &out.report else {
        return Ok(None);
    };
    let samples = parse_samples(report).map_err(|detail| {
        RunnerFailure::from_output(
            module,
            FailureKind::MalformedReport,
            format!("benchmark report rejected: {}", detail),
            out,
        )
    })?;
    Ok(LatencySummary::from_samples(&samples))
}

/// Runtime identity of the configured benchmark program.
pub fn probe_environment(settings: &Settings) -> EnvironmentInfo {
    let runtime = runner::probe_version(
        &settings.benchmark.program,
        &settings.benchmark.version_args,
        VERSION_PROBE_TIMEOUT,
    )
    .unwrap_or_else(|| {
        warn!(program = %settings.benchmark.program, "runtime version probe failed");
        UNKNOWN_RUNTIME.to_string()
    });
    EnvironmentInfo::current(runtime)
}

pub fn collect_benchmark(
    settings: &Settings,
    module_id: &str,
    runner: &dyn SuiteRunner,
    env: &EnvironmentInfo,
    opts: &CollectOptions,
) -> Result<BenchmarkOutcome, LanegateError> {
    let module = manifest::resolve_module(settings, module_id)?;

    if !module.has_benchmarks(settings) {
        info!(module = %module.id, "no benchmark directory; skipping");
        return Ok(BenchmarkOutcome::NoBenchmarksFound { module: module.id });
    }

    let timeout = opts
        .timeout
        .unwrap_or(Duration::from_secs(settings.benchmark.timeout_secs));
    let spec = run_spec(settings, &module, timeout);
    let out = runner.run(&spec);

    let summary = match classify(&module.id, &out, &settings.benchmark.no_benchmarks_exit_codes) {
        Ok(Some(summary)) => summary,
        Ok(None) => {
            info!(module = %module.id, "benchmark run produced no samples");
            return Ok(BenchmarkOutcome::NoBenchmarksFound { module: module.id });
        }
        Err(failure) => {
            warn!(module = %module.id, kind = ?failure.kind, "benchmark collection failed");
            return Ok(BenchmarkOutcome::RunnerFailure(failure));
        }
    };

    let performance = PerformanceObservation {
        latency_p50_ms: summary.p50_ms,
        latency_p95_ms: summary.p95_ms,
        latency_p99_ms: summary.p99_ms,
        env_fingerprint: env.fingerprint(),
        observed_at: time::now_utc_iso(),
    };

    let mut ledger = Ledger::new(&settings.benchmark_ledger, settings.lock).writer()?;
    manifest::update_manifest(&module.manifest_path, &settings.lock, |m| {
        m.set_performance(&performance)
    })?;

    ledger.append(&BenchmarkLedgerEntry {
        ts: performance.observed_at.clone(),
        module: module.id.clone(),
        latency_p50_ms: performance.latency_p50_ms,
        latency_p95_ms: performance.latency_p95_ms,
        latency_p99_ms: performance.latency_p99_ms,
        env_fingerprint: performance.env_fingerprint.clone(),
    })?;

    info!(
        module = %module.id,
        samples = summary.samples,
        p50_ms = summary.p50_ms,
        p95_ms = summary.p95_ms,
        "benchmark recorded"
    );
    Ok(BenchmarkOutcome::Success(BenchmarkObservation {
        module: module.id,
        samples: summary.samples,
        performance,
    }))
}
