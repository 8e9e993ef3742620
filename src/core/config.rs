//! Project configuration.
//!
//! The project root is the nearest ancestor holding a `.lanegate/` directory.
//! `.lanegate/config.toml` is optional and every key in it has a default, so
//! an empty file (or no file) yields a working setup. Relative paths resolve
//! against the project root.

use crate::core::error::LanegateError;
use crate::core::lanes::{Lane, LaneTable};
use crate::core::lock::LockPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PROJECT_DIR: &str = ".lanegate";
pub const CONFIG_FILE: &str = "config.toml";

/// Exit codes the coverage runner uses to say "no tests were collected" (pytest: 5).
const DEFAULT_NO_TESTS_EXIT_CODES: &[i32] = &[5];
const DEFAULT_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LanegateConfig {
    pub modules_root: PathBuf,
    pub manifest_file: String,
    pub tests_dir: PathBuf,
    pub benchmarks_dir: PathBuf,
    pub ledger: LedgerConfig,
    pub lanes: BTreeMap<String, f64>,
    pub coverage: CoverageRunnerConfig,
    pub benchmark: BenchmarkRunnerConfig,
    pub gate: GateConfig,
}

impl Default for LanegateConfig {
    fn default() -> Self {
        Self {
            modules_root: PathBuf::from("."),
            manifest_file: "module.manifest.json".to_string(),
            tests_dir: PathBuf::from("tests"),
            benchmarks_dir: PathBuf::from("tests/benchmarks"),
            ledger: LedgerConfig::default(),
            lanes: BTreeMap::new(),
            coverage: CoverageRunnerConfig::default(),
            benchmark: BenchmarkRunnerConfig::default(),
            gate: GateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub coverage: PathBuf,
    pub benchmark: PathBuf,
    pub lock_timeout_ms: u64,
    pub stale_lock_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            coverage: PathBuf::from(".lanegate/ledger/coverage.ndjson"),
            benchmark: PathBuf::from(".lanegate/ledger/benchmark.ndjson"),
            lock_timeout_ms: 10_000,
            stale_lock_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoverageRunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub no_tests_exit_codes: Vec<i32>,
    pub reports_dir: PathBuf,
}

impl Default for CoverageRunnerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: [
                "-m",
                "pytest",
                "{tests_dir}",
                "--cov={module_dir}",
                "--cov-report=xml:{report}",
                "-q",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            no_tests_exit_codes: DEFAULT_NO_TESTS_EXIT_CODES.to_vec(),
            reports_dir: PathBuf::from(".lanegate/reports/coverage"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchmarkRunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub no_benchmarks_exit_codes: Vec<i32>,
    pub version_args: Vec<String>,
    pub reports_dir: PathBuf,
}

impl Default for BenchmarkRunnerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: [
                "-m",
                "pytest",
                "{benchmarks_dir}",
                "--benchmark-only",
                "--benchmark-samples-json={report}",
                "-q",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            no_benchmarks_exit_codes: DEFAULT_NO_TESTS_EXIT_CODES.to_vec(),
            version_args: vec!["--version".to_string()],
            reports_dir: PathBuf::from(".lanegate/reports/benchmark"),
        }
    }
}

/// What the gate does with a tested module that has never been observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingObservation {
    #[default]
    Violation,
    Exempt,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    pub missing_observation: MissingObservation,
}

/// Resolved configuration: absolute paths plus typed policy objects.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_root: PathBuf,
    pub modules_root: PathBuf,
    pub manifest_file: String,
    pub tests_dir: PathBuf,
    pub benchmarks_dir: PathBuf,
    pub coverage_ledger: PathBuf,
    pub benchmark_ledger: PathBuf,
    pub lock: LockPolicy,
    pub lanes: LaneTable,
    pub coverage: CoverageRunnerConfig,
    pub benchmark: BenchmarkRunnerConfig,
    pub gate: GateConfig,
}

impl Settings {
    pub fn from_config(project_root: &Path, config: LanegateConfig) -> Result<Self, LanegateError> {
        let mut lanes = LaneTable::default();
        for (name, target) in &config.lanes {
            let lane = Lane::parse(name).ok_or_else(|| {
                LanegateError::ConfigError(format!("unknown lane '{}' in [lanes]", name))
            })?;
            if !(0.0..=100.0).contains(target) {
                return Err(LanegateError::ConfigError(format!(
                    "lane {} target {} outside [0, 100]",
                    name, target
                )));
            }
            lanes.set(lane, *target);
        }

        if config.coverage.program.trim().is_empty() || config.benchmark.program.trim().is_empty()
        {
            return Err(LanegateError::ConfigError(
                "runner program must not be empty".to_string(),
            ));
        }
        if config.coverage.timeout_secs == 0 || config.benchmark.timeout_secs == 0 {
            return Err(LanegateError::ConfigError(
                "runner timeout_secs must be positive".to_string(),
            ));
        }

        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                project_root.join(p)
            }
        };

        let mut coverage = config.coverage.clone();
        coverage.reports_dir = resolve(&coverage.reports_dir);
        let mut benchmark = config.benchmark.clone();
        benchmark.reports_dir = resolve(&benchmark.reports_dir);

        Ok(Self {
            project_root: project_root.to_path_buf(),
            modules_root: resolve(&config.modules_root),
            manifest_file: config.manifest_file,
            tests_dir: config.tests_dir,
            benchmarks_dir: config.benchmarks_dir,
            coverage_ledger: resolve(&config.ledger.coverage),
            benchmark_ledger: resolve(&config.ledger.benchmark),
            lock: LockPolicy {
                timeout: Duration::from_millis(config.ledger.lock_timeout_ms),
                stale_after: Duration::from_secs(config.ledger.stale_lock_secs),
            },
            lanes,
            coverage,
            benchmark,
            gate: config.gate,
        })
    }

    /// Defaults rooted at `project_root`, without reading any file.
    pub fn defaults(project_root: &Path) -> Result<Self, LanegateError> {
        Self::from_config(project_root, LanegateConfig::default())
    }
}

pub fn parse_config(content: &str) -> Result<LanegateConfig, LanegateError> {
    Ok(toml::from_str(content)?)
}

/// Load `<root>/.lanegate/config.toml`, or `explicit` when given. A missing default file is not an error.
pub fn load_settings(project_root: &Path, explicit: Option<&Path>) -> Result<Settings, LanegateError> {
    let config = match explicit {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(|e| {
                LanegateError::ConfigError(format!("cannot read {}: {}", path.display(), e))
            })?;
            parse_config(&content)?
        }
        None => {
            let path = project_root.join(PROJECT_DIR).join(CONFIG_FILE);
            if path.exists() {
                parse_config(&fs::read_to_string(&path).map_err(LanegateError::IoError)?)?
            } else {
                LanegateConfig::default()
            }
        }
    };
    Settings::from_config(project_root, config)
}

pub fn find_project_root(start_dir: &Path) -> Result<PathBuf, LanegateError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(PROJECT_DIR).is_dir() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(LanegateError::ConfigError(format!(
                "'{}' directory not found in {} or its parents. Create it or pass --root.",
                PROJECT_DIR,
                start_dir.display()
            )));
        }
    }
}
