//! Lane tiers and the coverage targets they imply.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

static LANE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^lane:(L[0-9]+)$").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Lane {
    L0,
    L1,
    L2,
    L3,
    L4,
    L5,
}

impl Lane {
    pub const ALL: [Lane; 6] = [Lane::L0, Lane::L1, Lane::L2, Lane::L3, Lane::L4, Lane::L5];

    /// Lane applied to modules that carry no lane tag.
    pub const UNTAGGED: Lane = Lane::L2;

    pub fn parse(name: &str) -> Option<Lane> {
        match name {
            "L0" => Some(Lane::L0),
            "L1" => Some(Lane::L1),
            "L2" => Some(Lane::L2),
            "L3" => Some(Lane::L3),
            "L4" => Some(Lane::L4),
            "L5" => Some(Lane::L5),
            _ => None,
        }
    }

    fn default_target(self) -> f64 {
        match self {
            Lane::L0 => 70.0,
            Lane::L1 => 75.0,
            Lane::L2 => 80.0,
            Lane::L3 => 85.0,
            Lane::L4 | Lane::L5 => 90.0,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaneTable {
    targets: BTreeMap<Lane, f64>,
}

impl Default for LaneTable {
    fn default() -> Self {
        Self {
            targets: Lane::ALL.iter().map(|l| (*l, l.default_target())).collect(),
        }
    }
}

impl LaneTable {
    pub fn target(&self, lane: Lane) -> f64 {
        self.targets
            .get(&lane)
            .copied()
            .unwrap_or_else(|| lane.default_target())
    }

    pub fn set(&mut self, lane: Lane, target: f64) {
        self.targets.insert(lane, target);
    }
}

/// Outcome of scanning a module's tags for `lane:L{n}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneResolution {
    pub lane: Option<Lane>,
    /// Lane tags that did not name a known lane.
    pub unknown: Vec<String>,
}

/// Extract the lane from tags. When several lane tags are present the
/// strictest (highest) lane wins.
pub fn lane_from_tags<S: AsRef<str>>(tags: &[S]) -> LaneResolution {
    let mut lane: Option<Lane> = None;
    let mut unknown = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if let Some(caps) = LANE_TAG.captures(tag) {
            match Lane::parse(&caps[1]) {
                Some(found) => lane = Some(lane.map_or(found, |cur| cur.max(found))),
                None => unknown.push(tag.to_string()),
            }
        } else if tag.starts_with("lane:") {
            unknown.push(tag.to_string());
        }
    }
    LaneResolution { lane, unknown }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    Override,
    Lane,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EffectiveTarget {
    pub target: f64,
    pub lane: Lane,
    pub source: TargetSource,
}

/// Explicit override, else the tagged lane's default, else the untagged default.
pub fn effective_target(
    table: &LaneTable,
    lane: Option<Lane>,
    coverage_target: Option<f64>,
) -> EffectiveTarget {
    let resolved_lane = lane.unwrap_or(Lane::UNTAGGED);
    match (coverage_target, lane) {
        (Some(target), _) => EffectiveTarget {
            target,
            lane: resolved_lane,
            source: TargetSource::Override,
        },
        (None, Some(l)) => EffectiveTarget {
            target: table.target(l),
            lane: l,
            source: TargetSource::Lane,
        },
        (None, None) => EffectiveTarget {
            target: table.target(Lane::UNTAGGED),
            lane: Lane::UNTAGGED,
            source: TargetSource::Default,
        },
    }
}
