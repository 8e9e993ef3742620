use lanegate::core::config::Settings;
use lanegate::core::ledger::{CoverageLedgerEntry, Ledger};
use lanegate::core::runner::{RunOutput, RunSpec, SuiteRunner};
use lanegate::plugins::CollectOptions;
use lanegate::plugins::batch::{BatchRequest, CollectKind, collect_touched, parse_touched};
use lanegate::plugins::benchmark::{BenchmarkOutcome, EnvironmentInfo};
use lanegate::plugins::coverage::CoverageOutcome;
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::{TempDir, tempdir};

/// Crashes for any module whose directory name starts with `flaky`.
struct PerModuleRunner;

impl SuiteRunner for PerModuleRunner {
    fn run(&self, spec: &RunSpec) -> RunOutput {
        let name = spec
            .cwd
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.starts_with("flaky") {
            return RunOutput {
                exit_code: Some(1),
                stderr: "segmentation fault".to_string(),
                ..RunOutput::default()
            };
        }
        let report = spec
            .report_path
            .as_ref()
            .and_then(|p| p.extension())
            .map(|ext| {
                if ext == "xml" {
                    r#"<coverage line-rate="0.75"/>"#.to_string()
                } else {
                    "[1, 2, 3, 4]".to_string()
                }
            });
        RunOutput {
            exit_code: Some(0),
            report,
            ..RunOutput::default()
        }
    }
}

fn project() -> (TempDir, Settings) {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join(".lanegate")).unwrap();
    fs::write(root.join(".lanegate/config.toml"), "modules_root = \"modules\"\n").unwrap();
    for (id, tests, benches) in [
        ("alpha", true, true),
        ("beta", false, false),
        ("flaky", true, false),
        ("platform/gamma", true, false),
    ] {
        let dir = root.join("modules").join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("module.manifest.json"), json!({"name": id}).to_string()).unwrap();
        if tests {
            fs::create_dir_all(dir.join("tests")).unwrap();
        }
        if benches {
            fs::create_dir_all(dir.join("tests/benchmarks")).unwrap();
        }
    }
    let settings = lanegate::core::config::load_settings(root, None).unwrap();
    (tmp, settings)
}

fn env() -> Option<EnvironmentInfo> {
    Some(EnvironmentInfo::current("Python 3.11.4"))
}

fn touched(root: &Path, lines: &[&str]) -> Vec<String> {
    let mut text = String::from("# generated by change detection\n");
    for line in lines {
        text.push_str(&root.join(line).to_string_lossy());
        text.push('\n');
    }
    parse_touched(&text)
}

#[test]
fn test_one_failure_does_not_stop_other_modules() {
    let (tmp, settings) = project();
    let touched = touched(
        tmp.path(),
        &[
            "modules/alpha/src/lib.py",
            "modules/flaky/src/io.py",
            "modules/platform/gamma/tests/test_x.py",
            "modules/alpha/README.md",
            "docs/index.md",
        ],
    );
    let request = BatchRequest {
        touched: &touched,
        kind: CollectKind::Coverage,
        jobs: 3,
        options: CollectOptions::default(),
    };

    let summary = collect_touched(&settings, &request, &PerModuleRunner, env()).unwrap();
    let ids: Vec<&str> = summary.modules.iter().map(|m| m.module.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "flaky", "platform/gamma"]);
    assert_eq!(summary.failed_modules(), vec!["flaky"]);
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(summary.unmatched.len(), 1);
    assert!(summary.modules.iter().all(|m| m.benchmark.is_none()));

    let entries: Vec<CoverageLedgerEntry> =
        Ledger::new(&settings.coverage_ledger, settings.lock).entries().unwrap();
    let mut recorded: Vec<String> = entries.into_iter().map(|e| e.module).collect();
    recorded.sort();
    assert_eq!(recorded, vec!["alpha", "platform/gamma"]);
}

#[test]
fn test_all_kinds_with_exempt_modules_pass() {
    let (_tmp, settings) = project();
    let touched = parse_touched("alpha\nbeta\n\n");
    let request = BatchRequest {
        touched: &touched,
        kind: CollectKind::All,
        jobs: 2,
        options: CollectOptions::default(),
    };

    let summary = collect_touched(&settings, &request, &PerModuleRunner, env()).unwrap();
    assert_eq!(summary.exit_code(), 0);

    let alpha = &summary.modules[0];
    assert!(matches!(alpha.coverage, Some(CoverageOutcome::Success(_))));
    let Some(BenchmarkOutcome::Success(obs)) = &alpha.benchmark else {
        panic!("expected benchmark success, got {:?}", alpha.benchmark);
    };
    assert_eq!(obs.performance.latency_p50_ms, 2.5);

    let beta = &summary.modules[1];
    assert!(matches!(beta.coverage, Some(CoverageOutcome::NoTestsFound { .. })));
    assert!(matches!(beta.benchmark, Some(BenchmarkOutcome::NoBenchmarksFound { .. })));
}

#[test]
fn test_nothing_touched_is_a_no_op() {
    let (_tmp, settings) = project();
    let touched = parse_touched("# nothing changed\n");
    let request = BatchRequest {
        touched: &touched,
        kind: CollectKind::All,
        jobs: 1,
        options: CollectOptions::default(),
    };
    let summary = collect_touched(&settings, &request, &PerModuleRunner, None).unwrap();
    assert!(summary.modules.is_empty());
    assert_eq!(summary.exit_code(), 0);
    assert!(!settings.coverage_ledger.exists());
}
