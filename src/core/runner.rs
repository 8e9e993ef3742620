//! Subprocess execution for test and benchmark suites.
//!
//! Collectors never inspect raw exit codes themselves: a [`SuiteRunner`]
//! returns a [`RunOutput`] and the collector classifies it into its own tagged
//! outcome. Tests substitute an in-memory runner that hands back report text
//! without spawning anything.

use crate::core::output;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How much runner output a failure keeps for diagnosis.
const FAILURE_OUTPUT_CHARS: usize = 4000;

/// One fully-expanded runner invocation.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Where the runner is expected to leave its report, if it produces one.
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// `None` when the process was killed by a signal or never started.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Set when the program could not be started at all.
    pub spawn_error: Option<String>,
    /// Report contents, `None` when the runner left no report behind.
    pub report: Option<String>,
    pub duration: Duration,
}

impl RunOutput {
    pub fn succeeded(&self) -> bool {
        self.spawn_error.is_none() && !self.timed_out && self.exit_code == Some(0)
    }
}

pub trait SuiteRunner: Sync {
    fn run(&self, spec: &RunSpec) -> RunOutput;
}

/// Why a collection run was abandoned without writing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Spawn,
    TimedOut,
    NonZeroExit,
    MalformedReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerFailure {
    pub module: String,
    pub kind: FailureKind,
    pub detail: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunnerFailure {
    pub fn from_output(module: &str, kind: FailureKind, detail: String, out: &RunOutput) -> Self {
        Self {
            module: module.to_string(),
            kind,
            detail,
            exit_code: out.exit_code,
            stdout: tail_chars(&out.stdout, FAILURE_OUTPUT_CHARS),
            stderr: tail_chars(&out.stderr, FAILURE_OUTPUT_CHARS),
        }
    }

    /// Classify the non-report failure modes shared by every collector.
    /// Returns `None` for a clean exit or an exit code listed in `benign_codes`.
    pub fn from_process(module: &str, out: &RunOutput, benign_codes: &[i32]) -> Option<Self> {
        if let Some(err) = &out.spawn_error {
            return Some(Self::from_output(
                module,
                FailureKind::Spawn,
                format!("runner could not start: {}", err),
                out,
            ));
        }
        if out.timed_out {
            return Some(Self::from_output(
                module,
                FailureKind::TimedOut,
                format!("runner timed out after {}s", out.duration.as_secs()),
                out,
            ));
        }
        match out.exit_code {
            Some(0) => None,
            Some(code) if benign_codes.contains(&code) => None,
            Some(code) => Some(Self::from_output(
                module,
                FailureKind::NonZeroExit,
                format!("runner exited with code {}", code),
                out,
            )),
            None => Some(Self::from_output(
                module,
                FailureKind::NonZeroExit,
                "runner terminated by signal".to_string(),
                out,
            )),
        }
    }

    pub fn summary(&self) -> String {
        let mut text = format!("{} [{:?}]: {}", self.module, self.kind, self.detail);
        let stderr = output::compact_line(&self.stderr, 400);
        if !stderr.is_empty() {
            text.push_str(&format!("\n  stderr: {}", stderr));
        }
        let stdout = output::compact_line(&self.stdout, 400);
        if !stdout.is_empty() {
            text.push_str(&format!("\n  stdout: {}", stdout));
        }
        text
    }
}

fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}

/// Replace `{name}` placeholders in runner args.
pub fn expand_args(args: &[String], vars: &BTreeMap<&str, String>) -> Vec<String> {
    args.iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}

/// Real runner: spawns the program, inheriting this process's environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRunner;

impl SuiteRunner for CommandRunner {
    fn run(&self, spec: &RunSpec) -> RunOutput {
        let start = Instant::now();

        // A report left over from an earlier run must not be mistaken for this one's.
        if let Some(report_path) = &spec.report_path {
            let _ = fs::remove_file(report_path);
            if let Some(parent) = report_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
        }

        info!(program = %spec.program, cwd = %spec.cwd.display(), "spawning runner");
        let mut child = match Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %spec.program, error = %e, "runner failed to spawn");
                return RunOutput {
                    spawn_error: Some(e.to_string()),
                    duration: start.elapsed(),
                    ..RunOutput::default()
                };
            }
        };

        // Drain pipes on their own threads so a chatty suite cannot fill the
        // pipe buffer and stall while we poll for exit.
        let stdout_reader = child.stdout.take().map(spawn_drain);
        let stderr_reader = child.stderr.take().map(spawn_drain);

        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "failed to poll runner");
                    let _ = child.kill();
                    break child.wait().ok();
                }
            }
            if start.elapsed() > spec.timeout {
                warn!(
                    program = %spec.program,
                    timeout_secs = spec.timeout.as_secs(),
                    "runner timed out; killing"
                );
                timed_out = true;
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            thread::sleep(Duration::from_millis(50));
        };

        // After a kill, grandchildren may still hold the pipes open; give the
        // readers a short grace period instead of waiting on them forever.
        let grace = timed_out.then_some(Duration::from_secs(2));
        let stdout = stdout_reader
            .and_then(|h| collect_drain(h, grace))
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|h| collect_drain(h, grace))
            .unwrap_or_default();

        let report = match (&spec.report_path, timed_out) {
            (Some(path), false) => read_report(path),
            _ => None,
        };

        let output = RunOutput {
            exit_code: status.and_then(|s| s.code()),
            stdout,
            stderr,
            timed_out,
            spawn_error: None,
            report,
            duration: start.elapsed(),
        };
        debug!(
            exit_code = ?output.exit_code,
            report = output.report.is_some(),
            elapsed_ms = output.duration.as_millis() as u64,
            "runner finished"
        );
        output
    }
}

fn spawn_drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn collect_drain(handle: thread::JoinHandle<String>, grace: Option<Duration>) -> Option<String> {
    if let Some(grace) = grace {
        let deadline = Instant::now() + grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
    handle.join().ok()
}

fn read_report(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

/// Capture `<program> <version_args>` output, used as the runtime component of
/// the environment fingerprint.
pub fn probe_version(program: &str, version_args: &[String], timeout: Duration) -> Option<String> {
    let spec = RunSpec {
        program: program.to_string(),
        args: version_args.to_vec(),
        cwd: std::env::current_dir().ok()?,
        timeout,
        report_path: None,
    };
    let out = CommandRunner.run(&spec);
    if !out.succeeded() {
        return None;
    }
    // Some interpreters print their version on stderr.
    let text = if out.stdout.trim().is_empty() {
        out.stderr
    } else {
        out.stdout
    };
    let line = text.lines().next()?.trim().to_string();
    (!line.is_empty()).then_some(line)
}
