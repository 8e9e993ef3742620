//! Batch collection over a change-detection list.
//!
//! Touched paths are mapped to modules, then each module's collectors run on
//! a bounded worker pool. Modules are independent: one module's failure is
//! recorded in the summary and never stops the others.

use crate::core::config::Settings;
use crate::core::error::LanegateError;
use crate::core::manifest;
use crate::core::runner::SuiteRunner;
use crate::plugins::CollectOptions;
use crate::plugins::benchmark::{self, BenchmarkOutcome, EnvironmentInfo};
use crate::plugins::coverage::{self, CoverageOutcome};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CollectKind {
    Coverage,
    Benchmark,
    All,
}

impl CollectKind {
    fn coverage(self) -> bool {
        matches!(self, CollectKind::Coverage | CollectKind::All)
    }

    fn benchmark(self) -> bool {
        matches!(self, CollectKind::Benchmark | CollectKind::All)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleResult {
    pub module: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark: Option<BenchmarkOutcome>,
    /// Hard errors (I/O, lock timeouts) that stopped this module only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModuleResult {
    pub fn failed(&self) -> bool {
        self.error.is_some()
            || self.coverage.as_ref().is_some_and(CoverageOutcome::is_failure)
            || self.benchmark.as_ref().is_some_and(BenchmarkOutcome::is_failure)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub modules: Vec<ModuleResult>,
    /// Touched entries that mapped to no known module.
    pub unmatched: Vec<String>,
}

impl BatchSummary {
    pub fn failed_modules(&self) -> Vec<&str> {
        self.modules
            .iter()
            .filter(|m| m.failed())
            .map(|m| m.module.as_str())
            .collect()
    }

    pub fn exit_code(&self) -> u8 {
        if self.failed_modules().is_empty() { 0 } else { 1 }
    }
}

pub struct BatchRequest<'a> {
    pub touched: &'a [String],
    pub kind: CollectKind,
    pub jobs: usize,
    pub options: CollectOptions,
}

/// Run collectors for every module the touched list maps to.
///
/// `env` is only consulted when benchmarks are collected; pass `None` to
/// probe the configured benchmark runtime lazily.
pub fn collect_touched(
    settings: &Settings,
    request: &BatchRequest<'_>,
    runner: &dyn SuiteRunner,
    env: Option<EnvironmentInfo>,
) -> Result<BatchSummary, LanegateError> {
    let known = manifest::discover_modules(settings)?;
    let (modules, unmatched) = manifest::modules_for_paths(settings, &known, request.touched);
    info!(modules = modules.len(), unmatched = unmatched.len(), "batch collection planned");

    let env = match (env, request.kind.benchmark() && !modules.is_empty()) {
        (Some(env), _) => Some(env),
        (None, true) => Some(benchmark::probe_environment(settings)),
        (None, false) => None,
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(request.jobs.max(1))
        .build()
        .map_err(|e| LanegateError::ValidationError(format!("worker pool: {}", e)))?;

    let results: Vec<ModuleResult> = pool.install(|| {
        modules
            .par_iter()
            .map(|id| collect_one(settings, id, request, runner, env.as_ref()))
            .collect()
    });

    Ok(BatchSummary {
        modules: results,
        unmatched,
    })
}

fn collect_one(
    settings: &Settings,
    id: &str,
    request: &BatchRequest<'_>,
    runner: &dyn SuiteRunner,
    env: Option<&EnvironmentInfo>,
) -> ModuleResult {
    let mut result = ModuleResult {
        module: id.to_string(),
        coverage: None,
        benchmark: None,
        error: None,
    };

    if request.kind.coverage() {
        match coverage::collect_coverage(settings, id, runner, &request.options) {
            Ok(outcome) => result.coverage = Some(outcome),
            Err(e) => {
                error!(module = %id, error = %e, "coverage collection aborted");
                result.error = Some(e.to_string());
                return result;
            }
        }
    }

    if request.kind.benchmark()
        && let Some(env) = env
    {
        match benchmark::collect_benchmark(settings, id, runner, env, &request.options) {
            Ok(outcome) => result.benchmark = Some(outcome),
            Err(e) => {
                error!(module = %id, error = %e, "benchmark collection aborted");
                result.error = Some(e.to_string());
            }
        }
    }
    result
}

/// Parse a change-detection list: one path or module id per line.
pub fn parse_touched(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}
