// SPDX-License-Identifier: Apache-2.0

//! The two formal backends and the protocol each one speaks.
//!
//! Both backends report success differently, so everything that differs
//! between them lives in one table keyed by `SolverMode` instead of being
//! spread across call sites.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SolverMode {
    /// SMT cover checking: exit code 0 means the cover statement was reached.
    #[serde(alias = "smt")]
    CoverReachability,
    /// SAT/AIGER bounded model checking on the negated property: exit code 2
    /// means the property was falsified.
    #[serde(alias = "sat")]
    BoundedAssertion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Waveform,
    Witness,
}

#[derive(Debug)]
pub struct ModeProtocol {
    pub pass_code: i32,
    pub artifact_kind: ArtifactKind,
    /// File name of the trace inside `<job>/engine_0/`.
    pub artifact_file: &'static str,
    /// Regex over log lines; group 1 is the step/depth reached.
    pub step_pattern: &'static str,
    pub sby_mode: &'static str,
    pub engines: &'static str,
    /// Statement kind `chformal -remove` strips from everything except the
    /// targeted label.
    pub stripped_statement: &'static str,
    pub needs_ric3: bool,
}

static COVER_REACHABILITY: ModeProtocol = ModeProtocol {
    pass_code: 0,
    artifact_kind: ArtifactKind::Waveform,
    artifact_file: "trace0.vcd",
    step_pattern: r"Checking cover reachability in step (\d+)\.\.",
    sby_mode: "cover",
    engines: "smtbmc bitwuzla",
    stripped_statement: "cover",
    needs_ric3: false,
};

static BOUNDED_ASSERTION: ModeProtocol = ModeProtocol {
    pass_code: 2,
    artifact_kind: ArtifactKind::Witness,
    artifact_file: "trace0_aiw.yw",
    step_pattern: r"bmc depth: (\d+)",
    sby_mode: "bmc",
    engines: "aiger rIC3",
    stripped_statement: "assert",
    needs_ric3: true,
};

impl SolverMode {
    pub fn protocol(self) -> &'static ModeProtocol {
        match self {
            SolverMode::CoverReachability => &COVER_REACHABILITY,
            SolverMode::BoundedAssertion => &BOUNDED_ASSERTION,
        }
    }

    pub fn all() -> [SolverMode; 2] {
        [SolverMode::CoverReachability, SolverMode::BoundedAssertion]
    }
}

impl Default for SolverMode {
    fn default() -> Self {
        SolverMode::CoverReachability
    }
}

impl fmt::Display for SolverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SolverMode::CoverReachability => "cover-reachability",
            SolverMode::BoundedAssertion => "bounded-assertion",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SolverMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cover-reachability" | "smt" => Ok(SolverMode::CoverReachability),
            "bounded-assertion" | "sat" => Ok(SolverMode::BoundedAssertion),
            _ => Err(format!("invalid solver mode: {}", s)),
        }
    }
}
