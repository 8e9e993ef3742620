//! Module manifests: discovery, typed reads, and locked field-level updates.
//!
//! Manifests are owned by an upstream authoring system. This module only ever
//! rewrites `testing.coverage_observed`, `testing.observed_at` and the
//! `performance.observed` subtree; every other key, and key order, survives a
//! write untouched.

use crate::core::config::Settings;
use crate::core::error::LanegateError;
use crate::core::lock::{self, LockPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// A module located on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    /// Module id: its directory relative to the modules root, `/`-separated.
    pub id: String,
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
}

impl ModuleRef {
    pub fn tests_dir(&self, settings: &Settings) -> PathBuf {
        self.dir.join(&settings.tests_dir)
    }

    pub fn benchmarks_dir(&self, settings: &Settings) -> PathBuf {
        self.dir.join(&settings.benchmarks_dir)
    }

    pub fn has_tests(&self, settings: &Settings) -> bool {
        self.tests_dir(settings).is_dir()
    }

    pub fn has_benchmarks(&self, settings: &Settings) -> bool {
        self.benchmarks_dir(settings).is_dir()
    }
}

/// Resolve a module id to its directory and manifest.
pub fn resolve_module(settings: &Settings, id: &str) -> Result<ModuleRef, LanegateError> {
    let normalized = id.trim().trim_matches('/').replace('\\', "/");
    if normalized.is_empty()
        || Path::new(&normalized)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(LanegateError::ValidationError(format!(
            "invalid module id '{}'",
            id
        )));
    }

    let dir = settings.modules_root.join(&normalized);
    let manifest_path = dir.join(&settings.manifest_file);
    if !manifest_path.is_file() {
        return Err(LanegateError::ModuleNotFound(format!(
            "{} (expected manifest at {})",
            normalized,
            manifest_path.display()
        )));
    }
    Ok(ModuleRef {
        id: normalized,
        dir,
        manifest_path,
    })
}

/// All modules under the modules root, sorted by id.
pub fn discover_modules(settings: &Settings) -> Result<Vec<ModuleRef>, LanegateError> {
    let mut found = Vec::new();
    if settings.modules_root.is_dir() {
        walk(&settings.modules_root, settings, &mut found)?;
    }
    found.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(found)
}

fn walk(dir: &Path, settings: &Settings, found: &mut Vec<ModuleRef>) -> Result<(), LanegateError> {
    let manifest_path = dir.join(&settings.manifest_file);
    if manifest_path.is_file() {
        let id = module_id_for(&settings.modules_root, dir);
        found.push(ModuleRef {
            id,
            dir: dir.to_path_buf(),
            manifest_path,
        });
    }

    let mut children: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(LanegateError::IoError)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    children.sort();

    for child in children {
        let name = child
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if is_skipped_dir(&name) {
            continue;
        }
        walk(&child, settings, found)?;
    }
    Ok(())
}

fn is_skipped_dir(name: &str) -> bool {
    name.starts_with('.')
        || matches!(
            name,
            "target" | "node_modules" | "__pycache__" | "venv" | "dist" | "build"
        )
}

fn module_id_for(root: &Path, dir: &Path) -> String {
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Map touched file paths (or bare module ids) to module ids by longest directory prefix.
pub fn modules_for_paths(
    settings: &Settings,
    modules: &[ModuleRef],
    touched: &[String],
) -> (Vec<String>, Vec<String>) {
    let mut matched: Vec<String> = Vec::new();
    let mut unmatched = Vec::new();

    for raw in touched {
        let entry = raw.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        let candidate = Path::new(entry);
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            settings.project_root.join(candidate)
        };

        let by_id = modules.iter().find(|m| m.id == entry.trim_matches('/'));
        let by_path = modules
            .iter()
            .filter(|m| absolute.starts_with(&m.dir))
            .max_by_key(|m| m.dir.components().count());

        match by_id.or(by_path) {
            Some(m) => {
                if !matched.contains(&m.id) {
                    matched.push(m.id.clone());
                }
            }
            None => unmatched.push(entry.to_string()),
        }
    }
    matched.sort();
    (matched, unmatched)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TestingSection {
    #[serde(default)]
    pub coverage_observed: Option<f64>,
    #[serde(default)]
    pub coverage_target: Option<f64>,
    #[serde(default)]
    pub observed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceObservation {
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub env_fingerprint: String,
    pub observed_at: String,
}

/// In-memory manifest document.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    doc: Map<String, Value>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, LanegateError> {
        let raw = fs::read_to_string(path).map_err(LanegateError::IoError)?;
        Self::parse(path, &raw)
    }

    pub fn parse(path: &Path, raw: &str) -> Result<Self, LanegateError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| LanegateError::manifest(path, format!("invalid JSON: {}", e)))?;
        match value {
            Value::Object(doc) => Ok(Self {
                path: path.to_path_buf(),
                doc,
            }),
            _ => Err(LanegateError::manifest(path, "top level is not an object")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.doc.clone())
    }

    pub fn tags(&self) -> Result<Vec<String>, LanegateError> {
        match self.doc.get("tags") {
            None | Some(Value::Null) => Ok(vec![]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|t| {
                    t.as_str().map(str::to_string).ok_or_else(|| {
                        LanegateError::manifest(&self.path, "tags must be strings")
                    })
                })
                .collect(),
            Some(_) => Err(LanegateError::manifest(&self.path, "tags must be an array")),
        }
    }

    pub fn testing(&self) -> Result<TestingSection, LanegateError> {
        let section = match self.doc.get("testing") {
            None | Some(Value::Null) => return Ok(TestingSection::default()),
            Some(v) => v.clone(),
        };
        let testing: TestingSection = serde_json::from_value(section)
            .map_err(|e| LanegateError::manifest(&self.path, format!("testing: {}", e)))?;
        for (field, value) in [
            ("coverage_observed", testing.coverage_observed),
            ("coverage_target", testing.coverage_target),
        ] {
            if let Some(v) = value
                && !(0.0..=100.0).contains(&v)
            {
                return Err(LanegateError::manifest(
                    &self.path,
                    format!("testing.{} = {} outside [0, 100]", field, v),
                ));
            }
        }
        Ok(testing)
    }

    pub fn observed_performance(&self) -> Result<Option<PerformanceObservation>, LanegateError> {
        match self
            .doc
            .get("performance")
            .and_then(|p| p.get("observed"))
        {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| LanegateError::manifest(&self.path, format!("performance.observed: {}", e))),
        }
    }

    pub fn set_coverage(&mut self, coverage: f64, observed_at: &str) -> Result<(), LanegateError> {
        let testing = section_mut(&mut self.doc, "testing", &self.path)?;
        testing.insert("coverage_observed".to_string(), json_number(coverage)?);
        testing.insert(
            "observed_at".to_string(),
            Value::String(observed_at.to_string()),
        );
        Ok(())
    }

    pub fn set_performance(&mut self, observed: &PerformanceObservation) -> Result<(), LanegateError> {
        let performance = section_mut(&mut self.doc, "performance", &self.path)?;
        performance.insert("observed".to_string(), serde_json::to_value(observed)?);
        Ok(())
    }

    /// Atomic replace: write a sibling temp file, then rename over the manifest.
    pub fn save(&self) -> Result<(), LanegateError> {
        let mut body = serde_json::to_string_pretty(&Value::Object(self.doc.clone()))?;
        body.push('\n');

        let mut tmp_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(format!(".tmp.{}", std::process::id()));
        let tmp_path = self.path.with_file_name(tmp_name);

        {
            let mut file = fs::File::create(&tmp_path).map_err(LanegateError::IoError)?;
            file.write_all(body.as_bytes())
                .map_err(LanegateError::IoError)?;
            file.sync_all().map_err(LanegateError::IoError)?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            LanegateError::IoError(e)
        })?;
        debug!(manifest = %self.path.display(), "manifest written");
        Ok(())
    }
}

fn section_mut<'a>(
    doc: &'a mut Map<String, Value>,
    key: &str,
    path: &Path,
) -> Result<&'a mut Map<String, Value>, LanegateError> {
    let entry = doc
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if entry.is_null() {
        *entry = Value::Object(Map::new());
    }
    entry
        .as_object_mut()
        .ok_or_else(|| LanegateError::manifest(path, format!("'{}' is not an object", key)))
}

fn json_number(v: f64) -> Result<Value, LanegateError> {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .ok_or_else(|| LanegateError::ValidationError(format!("non-finite value {}", v)))
}

/// Load, mutate and save a manifest while holding its lease, so two
/// collectors never interleave read-modify-write cycles on one module.
pub fn update_manifest<F>(path: &Path, policy: &LockPolicy, mutate: F) -> Result<Manifest, LanegateError>
where
    F: FnOnce(&mut Manifest) -> Result<(), LanegateError>,
{
    let _lease = lock::acquire(path, policy)?;
    let mut manifest = Manifest::load(path)?;
    mutate(&mut manifest)?;
    manifest.save()?;
    Ok(manifest)
}
