//! Coverage collector.
//!
//! Runs one module's test suite under coverage, converts the report's
//! `line-rate` into a percentage, and records it in the manifest and the
//! coverage ledger. A suite that cannot be scored writes nothing: a broken
//! run is never recorded as 0%.

use crate::core::config::Settings;
use crate::core::error::LanegateError;
use crate::core::ledger::{CoverageLedgerEntry, Ledger};
use crate::core::manifest::{self, ModuleRef};
use crate::core::runner::{self, FailureKind, RunOutput, RunSpec, RunnerFailure, SuiteRunner};
use crate::core::time;
use crate::plugins::CollectOptions;
use quick_xml::Reader as XmlReader;
use quick_xml::events::Event;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageObservation {
    pub module: String,
    /// Percentage in [0, 100], two decimals.
    pub coverage: f64,
    pub observed_at: String,
    pub report_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CoverageOutcome {
    Success(CoverageObservation),
    NoTestsFound { module: String },
    RunnerFailure(RunnerFailure),
}

impl CoverageOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CoverageOutcome::RunnerFailure(_))
    }
}

/// Read the `line-rate` attribute of the root `<coverage>` element.
pub fn parse_line_rate(xml: &str) -> Result<f64, String> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(el)) | Ok(Event::Empty(el)) => {
                if el.name().as_ref() != b"coverage" {
                    return Err(format!(
                        "root element is <{}>, expected <coverage>",
                        String::from_utf8_lossy(el.name().as_ref())
                    ));
                }
                for attr in el.attributes() {
                    let attr = attr.map_err(|e| format!("bad attribute: {}", e))?;
                    if attr.key.as_ref() == b"line-rate" {
                        let raw = attr
                            .unescape_value()
                            .map_err(|e| format!("bad line-rate value: {}", e))?;
                        return raw
                            .trim()
                            .parse::<f64>()
                            .map_err(|_| format!("line-rate '{}' is not a number", raw.trim()));
                    }
                }
                return Err("<coverage> has no line-rate attribute".to_string());
            }
            Ok(Event::Eof) => return Err("report contains no <coverage> element".to_string()),
            Err(e) => return Err(format!("XML error at byte {}: {}", reader.buffer_position(), e)),
            _ => {}
        }
        buf.clear();
    }
}

/// Fractional line rate to a two-decimal percentage. Values outside [0, 1]
/// are rejected rather than clamped.
pub fn line_rate_to_percent(rate: f64) -> Result<f64, String> {
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        return Err(format!("line-rate {} outside [0, 1]", rate));
    }
    Ok((rate * 10_000.0).round() / 100.0)
}

pub fn report_path_for(settings: &Settings, module: &ModuleRef) -> PathBuf {
    settings
        .coverage
        .reports_dir
        .join(format!("{}.xml", sanitize_id(&module.id)))
}

pub(crate) fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub fn run_spec(settings: &Settings, module: &ModuleRef, timeout: Duration) -> RunSpec {
    let report = report_path_for(settings, module);
    let mut vars = BTreeMap::new();
    vars.insert("module", module.id.clone());
    vars.insert("module_dir", path_str(&module.dir));
    vars.insert("tests_dir", path_str(&module.tests_dir(settings)));
    vars.insert("report", path_str(&report));
    RunSpec {
        program: settings.coverage.program.clone(),
        args: runner::expand_args(&settings.coverage.args, &vars),
        cwd: module.dir.clone(),
        timeout,
        report_path: Some(report),
    }
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().to_string()
}

/// Decide what a finished coverage run means, without touching disk.
pub fn classify(module: &str, out: &RunOutput, no_tests_exit_codes: &[i32]) -> Result<Option<f64>, RunnerFailure> {
    if let Some(failure) = RunnerFailure::from_process(module, out, no_tests_exit_codes) {
        return Err(failure);
    }
    if out.exit_code.is_some_and(|c| no_tests_exit_codes.contains(&c) && c != 0) {
        return Ok(None);
    }
    let Some(report) = &out.report else {
        return Ok(None);
    };
    parse_line_rate(report)
        .and_then(line_rate_to_percent)
        .map(Some)
        .map_err(|detail| {
            RunnerFailure::from_output(
                module,
                FailureKind::MalformedReport,
                format!("coverage report rejected: {}", detail),
                out,
            )
        })
}

pub fn collect_coverage(
    settings: &Settings,
    module_id: &str,
    runner: &dyn SuiteRunner,
    opts: &CollectOptions,
) -> Result<CoverageOutcome, LanegateError> {
    let module = manifest::resolve_module(settings, module_id)?;

    if !module.has_tests(settings) {
        info!(module = %module.id, "no test directory; coverage exempt");
        return Ok(CoverageOutcome::NoTestsFound { module: module.id });
    }

    let timeout = opts
        .timeout
        .unwrap_or(Duration::from_secs(settings.coverage.timeout_secs));
    let spec = run_spec(settings, &module, timeout);
    let out = runner.run(&spec);

    let coverage = match classify(&module.id, &out, &settings.coverage.no_tests_exit_codes) {
        Ok(Some(coverage)) => coverage,
        Ok(None) => {
            info!(module = %module.id, exit_code = ?out.exit_code, "runner collected no tests");
            return Ok(CoverageOutcome::NoTestsFound { module: module.id });
        }
        Err(failure) => {
            warn!(module = %module.id, kind = ?failure.kind, "coverage collection failed");
            return Ok(CoverageOutcome::RunnerFailure(failure));
        }
    };

    let observed_at = time::now_utc_iso();
    let report_path = spec.report_path.unwrap_or_else(|| report_path_for(settings, &module));

    // Ledger lease first, so contention fails before the manifest changes.
    let mut ledger = Ledger::new(&settings.coverage_ledger, settings.lock).writer()?;
    manifest::update_manifest(&module.manifest_path, &settings.lock, |m| {
        m.set_coverage(coverage, &observed_at)
    })?;

    ledger.append(&CoverageLedgerEntry {
        ts: observed_at.clone(),
        module: module.id.clone(),
        coverage,
        xml_path: report_path.to_string_lossy().to_string(),
    })?;

    info!(module = %module.id, coverage, "coverage recorded");
    Ok(CoverageOutcome::Success(CoverageObservation {
        module: module.id,
        coverage,
        observed_at,
        report_path,
    }))
}
