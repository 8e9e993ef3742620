use lanegate::core::config::Settings;
use lanegate::core::error::LanegateError;
use lanegate::core::ledger::{BenchmarkLedgerEntry, Ledger, LedgerKind, verify};
use lanegate::core::lock::{LockPolicy, lock_path_for};
use lanegate::core::manifest::Manifest;
use lanegate::core::runner::{FailureKind, RunOutput, RunSpec, SuiteRunner};
use lanegate::plugins::CollectOptions;
use lanegate::plugins::benchmark::{BenchmarkOutcome, EnvironmentInfo, collect_benchmark};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::{TempDir, tempdir};

struct FakeRunner {
    output: RunOutput,
    calls: AtomicUsize,
}

impl FakeRunner {
    fn new(output: RunOutput) -> Self {
        Self {
            output,
            calls: AtomicUsize::new(0),
        }
    }

    fn reporting(json: &str) -> Self {
        Self::new(RunOutput {
            exit_code: Some(0),
            report: Some(json.to_string()),
            ..RunOutput::default()
        })
    }
}

impl SuiteRunner for FakeRunner {
    fn run(&self, _spec: &RunSpec) -> RunOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output.clone()
    }
}

fn env() -> EnvironmentInfo {
    EnvironmentInfo {
        runtime: "Python 3.11.4".to_string(),
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
    }
}

fn write_module(root: &Path, id: &str, with_benchmarks: bool) {
    let dir = root.join(id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("module.manifest.json"),
        serde_json::to_string_pretty(&json!({
            "name": id,
            "tags": ["lane:L1"],
            "performance": {"budget_p95_ms": 250, "observed": {"stale": true}}
        }))
        .unwrap(),
    )
    .unwrap();
    if with_benchmarks {
        fs::create_dir_all(dir.join("tests/benchmarks")).unwrap();
    }
}

fn project() -> (TempDir, Settings) {
    let tmp = tempdir().unwrap();
    fs::create_dir_all(tmp.path().join(".lanegate")).unwrap();
    write_module(tmp.path(), "gamma", true);
    write_module(tmp.path(), "delta", false);
    let settings = Settings::defaults(tmp.path()).unwrap();
    (tmp, settings)
}

fn load(settings: &Settings, id: &str) -> Manifest {
    Manifest::load(&settings.modules_root.join(id).join("module.manifest.json")).unwrap()
}

#[test]
fn test_percentiles_match_in_manifest_and_ledger() {
    let (_tmp, settings) = project();
    let runner = FakeRunner::reporting("[100, 10, 50, 30, 90, 20, 80, 40, 70, 60]");

    let outcome =
        collect_benchmark(&settings, "gamma", &runner, &env(), &CollectOptions::default()).unwrap();
    let BenchmarkOutcome::Success(obs) = outcome else {
        panic!("expected success, got {:?}", outcome);
    };
    assert_eq!(obs.samples, 10);
    assert_eq!(obs.performance.latency_p50_ms, 55.0);
    assert_eq!(obs.performance.env_fingerprint, env().fingerprint());

    let stored = load(&settings, "gamma").observed_performance().unwrap().unwrap();
    assert_eq!(stored, obs.performance);

    let entries: Vec<BenchmarkLedgerEntry> =
        Ledger::new(&settings.benchmark_ledger, settings.lock).entries().unwrap();
    assert_eq!(entries.len(), 1);
    let e = &entries[0];
    assert_eq!(e.module, "gamma");
    assert_eq!(e.ts, stored.observed_at);
    assert_eq!(
        (e.latency_p50_ms, e.latency_p95_ms, e.latency_p99_ms),
        (stored.latency_p50_ms, stored.latency_p95_ms, stored.latency_p99_ms)
    );
    assert_eq!(e.env_fingerprint, stored.env_fingerprint);

    let ledger = Ledger::new(&settings.benchmark_ledger, settings.lock);
    assert!(verify(&ledger, LedgerKind::Benchmark).unwrap().is_empty());
}

#[test]
fn test_observed_subtree_is_replaced_and_siblings_kept() {
    let (_tmp, settings) = project();
    let runner = FakeRunner::reporting(r#"[{"name": "parse", "samples_ms": [1, 2]}, {"name": "emit", "samples_ms": [3]}]"#);
    collect_benchmark(&settings, "gamma", &runner, &env(), &CollectOptions::default()).unwrap();

    let doc = load(&settings, "gamma").as_value();
    assert_eq!(doc["performance"]["budget_p95_ms"], 250);
    assert!(doc["performance"]["observed"].get("stale").is_none());
    assert_eq!(doc["performance"]["observed"]["latency_p50_ms"], 2.0);
}

#[test]
fn test_missing_benchmark_dir_skips_runner() {
    let (_tmp, settings) = project();
    let before = fs::read_to_string(settings.modules_root.join("delta/module.manifest.json")).unwrap();
    let runner = FakeRunner::reporting("[1, 2, 3]");

    let outcome =
        collect_benchmark(&settings, "delta", &runner, &env(), &CollectOptions::default()).unwrap();
    assert!(matches!(outcome, BenchmarkOutcome::NoBenchmarksFound { .. }));
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        fs::read_to_string(settings.modules_root.join("delta/module.manifest.json")).unwrap(),
        before
    );
    assert!(!settings.benchmark_ledger.exists());
}

#[test]
fn test_empty_sample_set_is_benign() {
    let (_tmp, settings) = project();
    let runner = FakeRunner::reporting("[]");
    let outcome =
        collect_benchmark(&settings, "gamma", &runner, &env(), &CollectOptions::default()).unwrap();
    assert!(matches!(outcome, BenchmarkOutcome::NoBenchmarksFound { .. }));
    assert!(!settings.benchmark_ledger.exists());
}

#[test]
fn test_malformed_samples_write_nothing() {
    let (_tmp, settings) = project();
    let runner = FakeRunner::reporting("[12.5, -3]");
    let outcome =
        collect_benchmark(&settings, "gamma", &runner, &env(), &CollectOptions::default()).unwrap();
    let BenchmarkOutcome::RunnerFailure(failure) = outcome else {
        panic!("expected runner failure, got {:?}", outcome);
    };
    assert_eq!(failure.kind, FailureKind::MalformedReport);
    assert!(!settings.benchmark_ledger.exists());
    assert_eq!(
        load(&settings, "gamma").as_value()["performance"]["observed"],
        json!({"stale": true})
    );
}

#[test]
fn test_fingerprint_changes_with_runtime() {
    let (_tmp, settings) = project();
    let runner = FakeRunner::reporting("[5, 5, 5]");
    let other = EnvironmentInfo {
        runtime: "Python 3.12.1".to_string(),
        ..env()
    };

    collect_benchmark(&settings, "gamma", &runner, &env(), &CollectOptions::default()).unwrap();
    collect_benchmark(&settings, "gamma", &runner, &other, &CollectOptions::default()).unwrap();

    let entries: Vec<BenchmarkLedgerEntry> =
        Ledger::new(&settings.benchmark_ledger, settings.lock).entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_ne!(entries[0].env_fingerprint, entries[1].env_fingerprint);
    assert_eq!(entries[0].latency_p99_ms, entries[1].latency_p99_ms);
}

#[test]
fn test_no_benchmarks_exit_code_is_benign() {
    let (_tmp, settings) = project();
    let before = fs::read_to_string(settings.modules_root.join("gamma/module.manifest.json")).unwrap();
    let runner = FakeRunner::new(RunOutput {
        exit_code: Some(5),
        stdout: "no tests ran in 0.01s".to_string(),
        ..RunOutput::default()
    });

    let outcome =
        collect_benchmark(&settings, "gamma", &runner, &env(), &CollectOptions::default()).unwrap();
    assert!(matches!(outcome, BenchmarkOutcome::NoBenchmarksFound { .. }));
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        fs::read_to_string(settings.modules_root.join("gamma/module.manifest.json")).unwrap(),
        before
    );
    assert!(!settings.benchmark_ledger.exists());
}

#[test]
fn test_busy_ledger_leaves_manifest_untouched() {
    let (_tmp, mut settings) = project();
    settings.lock = LockPolicy {
        timeout: Duration::from_millis(100),
        stale_after: Duration::from_secs(300),
    };
    let held = lock_path_for(&settings.benchmark_ledger);
    fs::create_dir_all(held.parent().unwrap()).unwrap();
    fs::write(&held, "pid=1\ntoken=held\n").unwrap();
    let runner = FakeRunner::reporting("[1, 2, 3, 4]");

    let result = collect_benchmark(&settings, "gamma", &runner, &env(), &CollectOptions::default());
    assert!(matches!(result, Err(LanegateError::LockTimeout { .. })));
    assert_eq!(
        load(&settings, "gamma").as_value()["performance"]["observed"],
        json!({"stale": true})
    );
    assert!(!settings.benchmark_ledger.exists());
}
