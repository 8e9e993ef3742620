//! Coverage gate.
//!
//! Reads every manifest, resolves each tested module's effective target and
//! renders a single CI decision. Violations are collected across all modules
//! before deciding, so one run shows the full backlog. The gate never writes.

use crate::core::config::{MissingObservation, Settings};
use crate::core::error::LanegateError;
use crate::core::lanes::{self, Lane, LaneTable, TargetSource};
use crate::core::manifest::{self, Manifest};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    BelowTarget,
    MissingObservation,
    InvalidManifest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub module: String,
    pub observed: Option<f64>,
    pub target: f64,
    pub lane: Lane,
    pub target_source: TargetSource,
    pub reason: ViolationReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateReport {
    pub checked: usize,
    pub passed: usize,
    pub exempt: Vec<String>,
    pub violations: Vec<Violation>,
}

impl GateReport {
    pub fn is_pass(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_pass() { 0 } else { 1 }
    }
}

/// What the gate knows about one module, independent of where it came from.
#[derive(Debug, Clone)]
pub struct GateInput {
    pub module: String,
    pub has_tests: bool,
    pub manifest: Result<Manifest, String>,
}

#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub lanes: LaneTable,
    pub missing_observation: MissingObservation,
}

impl GatePolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            lanes: settings.lanes.clone(),
            missing_observation: settings.gate.missing_observation,
        }
    }
}

/// Pure decision over already-loaded inputs. Output is sorted by module id.
pub fn evaluate(inputs: &[GateInput], policy: &GatePolicy) -> GateReport {
    let mut ordered: Vec<&GateInput> = inputs.iter().collect();
    ordered.sort_by(|a, b| a.module.cmp(&b.module));

    let mut report = GateReport {
        checked: 0,
        passed: 0,
        exempt: Vec::new(),
        violations: Vec::new(),
    };

    for input in ordered {
        if !input.has_tests {
            debug!(module = %input.module, "no test directory; exempt from gate");
            report.exempt.push(input.module.clone());
            continue;
        }
        report.checked += 1;

        match judge(input, policy) {
            Some(violation) => report.violations.push(violation),
            None => report.passed += 1,
        }
    }
    report
}

fn judge(input: &GateInput, policy: &GatePolicy) -> Option<Violation> {
    let untagged = lanes::effective_target(&policy.lanes, None, None);
    let invalid = |detail: String| Violation {
        module: input.module.clone(),
        observed: None,
        target: untagged.target,
        lane: untagged.lane,
        target_source: untagged.source,
        reason: ViolationReason::InvalidManifest,
        detail: Some(detail),
    };

    let manifest = match &input.manifest {
        Ok(m) => m,
        Err(e) => return Some(invalid(e.clone())),
    };
    let (tags, testing) = match (manifest.tags(), manifest.testing()) {
        (Ok(t), Ok(s)) => (t, s),
        (Err(e), _) | (_, Err(e)) => return Some(invalid(e.to_string())),
    };

    let resolution = lanes::lane_from_tags(&tags);
    if !resolution.unknown.is_empty() {
        warn!(module = %input.module, tags = ?resolution.unknown, "ignoring unrecognised lane tags");
    }
    let effective = lanes::effective_target(&policy.lanes, resolution.lane, testing.coverage_target);

    let violation = |observed: Option<f64>, reason: ViolationReason| Violation {
        module: input.module.clone(),
        observed,
        target: effective.target,
        lane: effective.lane,
        target_source: effective.source,
        reason,
        detail: None,
    };

    match testing.coverage_observed {
        Some(observed) if observed < effective.target => {
            Some(violation(Some(observed), ViolationReason::BelowTarget))
        }
        Some(_) => None,
        None => match policy.missing_observation {
            MissingObservation::Violation => {
                Some(violation(None, ViolationReason::MissingObservation))
            }
            MissingObservation::Exempt => None,
        },
    }
}

/// Discover every module under the configured root and evaluate it.
pub fn run_gate(settings: &Settings) -> Result<GateReport, LanegateError> {
    let modules = manifest::discover_modules(settings)?;
    let inputs: Vec<GateInput> = modules
        .iter()
        .map(|m| GateInput {
            module: m.id.clone(),
            has_tests: m.has_tests(settings),
            manifest: Manifest::load(&m.manifest_path).map_err(|e| e.to_string()),
        })
        .collect();

    let report = evaluate(&inputs, &GatePolicy::from_settings(settings));
    info!(
        checked = report.checked,
        exempt = report.exempt.len(),
        violations = report.violations.len(),
        "coverage gate evaluated"
    );
    Ok(report)
}
