//! Append-only NDJSON ledgers for coverage and benchmark observations.
//!
//! Each call to [`Ledger::append`] writes exactly one JSON object followed by a
//! newline, under the ledger's file lease, in a single `write_all`. Entries are
//! never rewritten or compacted.
//!
//! Callers that must not leave other state ahead of the ledger take a
//! [`LedgerWriter`] first. It holds the lease and the open file, so the append
//! itself can no longer fail on contention.

use crate::core::error::LanegateError;
use crate::core::lock::{self, FileLease, LockPolicy};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageLedgerEntry {
    pub ts: String,
    pub module: String,
    pub coverage: f64,
    pub xml_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkLedgerEntry {
    pub ts: String,
    pub module: String,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub env_fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LedgerKind {
    Coverage,
    Benchmark,
}

impl LedgerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerKind::Coverage => "coverage",
            LedgerKind::Benchmark => "benchmark",
        }
    }
}

/// Handle on one ledger file.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    lock: LockPolicy,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>, lock: LockPolicy) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, entry: &T) -> Result<(), LanegateError> {
        self.writer()?.append(entry)
    }

    /// Take the ledger lease and open the file for appending.
    pub fn writer(&self) -> Result<LedgerWriter, LanegateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(LanegateError::IoError)?;
        }

        let lease = lock::acquire(&self.path, &self.lock)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(LanegateError::IoError)?;
        Ok(LedgerWriter {
            path: self.path.clone(),
            file,
            _lease: lease,
        })
    }

    /// Raw lines in append order. A missing ledger reads as empty.
    pub fn lines(&self) -> Result<Vec<String>, LanegateError> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let content = fs::read_to_string(&self.path).map_err(LanegateError::IoError)?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn entries<T: DeserializeOwned>(&self) -> Result<Vec<T>, LanegateError> {
        self.lines()?
            .iter()
            .map(|line| serde_json::from_str(line).map_err(LanegateError::JsonError))
            .collect()
    }

    pub fn len(&self) -> Result<usize, LanegateError> {
        Ok(self.lines()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, LanegateError> {
        Ok(self.len()? == 0)
    }

    /// Last `n` raw lines, optionally restricted to one module.
    pub fn tail(&self, n: usize, module: Option<&str>) -> Result<Vec<String>, LanegateError> {
        let lines: Vec<String> = self
            .lines()?
            .into_iter()
            .filter(|line| match module {
                Some(m) => serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| v.get("module").and_then(|x| x.as_str()).map(|s| s == m))
                    .unwrap_or(false),
                None => true,
            })
            .collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].to_vec())
    }
}

/// Open ledger file held under its lease. Dropping it releases the lease.
#[derive(Debug)]
pub struct LedgerWriter {
    path: PathBuf,
    file: File,
    _lease: FileLease,
}

impl LedgerWriter {
    pub fn append<T: Serialize>(&mut self, entry: &T) -> Result<(), LanegateError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        self.file
            .write_all(line.as_bytes())
            .map_err(LanegateError::IoError)?;
        self.file.sync_data().map_err(LanegateError::IoError)?;

        debug!(ledger = %self.path.display(), bytes = line.len(), "ledger entry appended");
        Ok(())
    }
}

/// A ledger line that failed verification.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerProblem {
    pub line: usize,
    pub message: String,
}

/// Check every line of a ledger against its entry schema and value ranges.
pub fn verify(ledger: &Ledger, kind: LedgerKind) -> Result<Vec<LedgerProblem>, LanegateError> {
    if !ledger.path().exists() {
        return Ok(vec![]);
    }
    let content = fs::read_to_string(ledger.path()).map_err(LanegateError::IoError)?;
    let mut problems = Vec::new();

    if !content.is_empty() && !content.ends_with('\n') {
        problems.push(LedgerProblem {
            line: content.lines().count(),
            message: "last entry is not newline-terminated (partial write)".to_string(),
        });
    }

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            problems.push(LedgerProblem {
                line: line_no,
                message: "blank line".to_string(),
            });
            continue;
        }
        let check = match kind {
            LedgerKind::Coverage => serde_json::from_str::<CoverageLedgerEntry>(line)
                .map_err(|e| e.to_string())
                .and_then(|e| {
                    if (0.0..=100.0).contains(&e.coverage) {
                        Ok(())
                    } else {
                        Err(format!("coverage {} outside [0, 100]", e.coverage))
                    }
                }),
            LedgerKind::Benchmark => serde_json::from_str::<BenchmarkLedgerEntry>(line)
                .map_err(|e| e.to_string())
                .and_then(|e| {
                    let ordered = e.latency_p50_ms <= e.latency_p95_ms
                        && e.latency_p95_ms <= e.latency_p99_ms;
                    if e.latency_p50_ms < 0.0 || !ordered {
                        Err("latency percentiles are negative or out of order".to_string())
                    } else if !is_fingerprint(&e.env_fingerprint) {
                        Err(format!(
                            "env_fingerprint '{}' is not 16 lowercase hex chars",
                            e.env_fingerprint
                        ))
                    } else {
                        Ok(())
                    }
                }),
        };
        if let Err(message) = check {
            problems.push(LedgerProblem {
                line: line_no,
                message,
            });
        }
    }
    Ok(problems)
}

fn is_fingerprint(value: &str) -> bool {
    value.len() == 16
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
