use lanegate::core::config::{Settings, find_project_root, load_settings};
use lanegate::core::error::LanegateError;
use lanegate::core::ledger::{CoverageLedgerEntry, Ledger, LedgerKind, verify};
use lanegate::core::lock::{self, LockPolicy};
use lanegate::core::manifest::{self, Manifest};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

fn entry(module: &str, coverage: f64) -> CoverageLedgerEntry {
    CoverageLedgerEntry {
        ts: "2026-03-01T08:15:42Z".to_string(),
        module: module.to_string(),
        coverage,
        xml_path: format!("/tmp/{module}.xml"),
    }
}

#[test]
fn test_concurrent_appends_never_interleave() {
    let tmp = tempdir().unwrap();
    let ledger = Ledger::new(tmp.path().join("ledger/coverage.ndjson"), LockPolicy::default());

    std::thread::scope(|s| {
        for t in 0..6 {
            let ledger = &ledger;
            s.spawn(move || {
                for i in 0..25 {
                    ledger.append(&entry(&format!("m{t}-{i}"), 50.0)).unwrap();
                }
            });
        }
    });

    let entries: Vec<CoverageLedgerEntry> = ledger.entries().unwrap();
    assert_eq!(entries.len(), 150);
    assert!(verify(&ledger, LedgerKind::Coverage).unwrap().is_empty());
    assert!(!lock::lock_path_for(ledger.path()).exists());
}

#[test]
fn test_existing_lines_are_never_rewritten() {
    let tmp = tempdir().unwrap();
    let ledger = Ledger::new(tmp.path().join("coverage.ndjson"), LockPolicy::default());
    ledger.append(&entry("alpha", 36.5)).unwrap();
    let first = fs::read_to_string(ledger.path()).unwrap();

    ledger.append(&entry("alpha", 40.0)).unwrap();
    let both = fs::read_to_string(ledger.path()).unwrap();
    assert!(both.starts_with(&first));
    assert_eq!(ledger.tail(1, Some("alpha")).unwrap().len(), 1);
    assert!(ledger.tail(5, Some("beta")).unwrap().is_empty());
}

#[test]
fn test_verify_flags_partial_and_out_of_range_lines() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("coverage.ndjson");
    let ledger = Ledger::new(&path, LockPolicy::default());
    ledger.append(&entry("alpha", 36.5)).unwrap();

    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(file, r#"{{"ts":"t","module":"beta","coverage":140.0,"xml_path":"x"}}"#).unwrap();
    write!(file, r#"{{"ts":"t","module":"gam"#).unwrap();
    drop(file);

    let problems = verify(&ledger, LedgerKind::Coverage).unwrap();
    let lines: Vec<usize> = problems.iter().map(|p| p.line).collect();
    assert!(lines.contains(&2));
    assert!(lines.contains(&3));
}

#[test]
fn test_held_lease_times_out() {
    let tmp = tempdir().unwrap();
    let target = tmp.path().join("module.manifest.json");
    let policy = LockPolicy {
        timeout: Duration::from_millis(60),
        stale_after: Duration::from_secs(300),
    };

    let held = lock::acquire(&target, &policy).unwrap();
    let err = lock::acquire(&target, &policy).unwrap_err();
    assert!(matches!(err, LanegateError::LockTimeout { .. }));
    drop(held);
    assert!(lock::acquire(&target, &policy).is_ok());
}

#[test]
fn test_stale_lease_is_reclaimed_by_exactly_one_contender() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let tmp = tempdir().unwrap();
    let target = tmp.path().join("coverage.ndjson");
    let lock_path = lock::lock_path_for(&target);
    let abandoned = fs::File::create(&lock_path).unwrap();
    writeln!(&abandoned, "pid=1\ntoken=crashed").unwrap();
    abandoned
        .set_modified(std::time::SystemTime::now() - Duration::from_secs(3600))
        .unwrap();
    drop(abandoned);

    let policy = LockPolicy {
        timeout: Duration::from_secs(10),
        stale_after: Duration::from_secs(60),
    };
    let holders = AtomicUsize::new(0);
    let max_holders = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let lease = lock::acquire(&target, &policy).unwrap();
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_holders.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(15));
                holders.fetch_sub(1, Ordering::SeqCst);
                drop(lease);
            });
        }
    });

    assert_eq!(max_holders.load(Ordering::SeqCst), 1);
    assert!(!lock_path.exists());
    let leftovers: Vec<_> = fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.contains(".lock"))
        .collect();
    assert!(leftovers.is_empty(), "leftover lease files: {leftovers:?}");
}

#[test]
fn test_update_manifest_preserves_unknown_fields() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("module.manifest.json");
    fs::write(
        &path,
        r#"{"name": "alpha", "x-owner": {"team": "core"}, "tags": ["lane:L3"], "testing": {"coverage_target": 90}}"#,
    )
    .unwrap();

    manifest::update_manifest(&path, &LockPolicy::default(), |m| {
        m.set_coverage(91.25, "2026-03-01T08:15:42Z")
    })
    .unwrap();

    let reloaded = Manifest::load(&path).unwrap();
    let doc = reloaded.as_value();
    assert_eq!(doc["x-owner"]["team"], "core");
    assert_eq!(doc["testing"]["coverage_target"], 90);
    assert_eq!(doc["testing"]["coverage_observed"], 91.25);
    let keys: Vec<&String> = doc.as_object().unwrap().keys().collect();
    assert_eq!(keys, vec!["name", "x-owner", "tags", "testing"]);
}

#[test]
fn test_failed_update_leaves_manifest_alone() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("module.manifest.json");
    fs::write(&path, r#"{"testing": []}"#).unwrap();

    let result = manifest::update_manifest(&path, &LockPolicy::default(), |m| {
        m.set_coverage(50.0, "2026-03-01T08:15:42Z")
    });
    assert!(result.is_err());
    assert_eq!(fs::read_to_string(&path).unwrap(), r#"{"testing": []}"#);
}

#[test]
fn test_settings_resolve_from_project_root() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join(".lanegate")).unwrap();
    fs::create_dir_all(root.join("services/api/src")).unwrap();
    fs::write(
        root.join(".lanegate/config.toml"),
        "[ledger]\ncoverage = \"telemetry/cov.ndjson\"\n[coverage]\ntimeout_secs = 60\n",
    )
    .unwrap();

    let found = find_project_root(&root.join("services/api/src")).unwrap();
    assert_eq!(found, PathBuf::from(root));

    let settings = load_settings(&found, None).unwrap();
    assert_eq!(settings.coverage_ledger, root.join("telemetry/cov.ndjson"));
    assert_eq!(settings.coverage.timeout_secs, 60);
    assert_eq!(settings.benchmark.timeout_secs, 1800);
}

#[test]
fn test_bad_config_is_rejected() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join(".lanegate")).unwrap();
    fs::write(root.join(".lanegate/config.toml"), "[lanes]\nL9 = 10.0\n").unwrap();
    assert!(matches!(
        load_settings(root, None),
        Err(LanegateError::ConfigError(_))
    ));

    fs::write(root.join(".lanegate/config.toml"), "[coverage]\ntimeout_secs = 0\n").unwrap();
    assert!(load_settings(root, None).is_err());
    assert!(Settings::defaults(root).is_ok());
}

#[test]
fn test_discovery_skips_hidden_and_sorts() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    for id in ["zeta", "alpha", "nested/inner", ".lanegate/shadow"] {
        fs::create_dir_all(root.join(id)).unwrap();
        fs::write(root.join(id).join("module.manifest.json"), "{}").unwrap();
    }
    let settings = Settings::defaults(root).unwrap();
    let ids: Vec<String> = manifest::discover_modules(&settings)
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["alpha", "nested/inner", "zeta"]);
}
