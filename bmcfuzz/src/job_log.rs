// SPDX-License-Identifier: Apache-2.0

//! Best-effort summary of a solver job's `logfile.txt`.

use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::solver_mode::SolverMode;

static SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"summary: Elapsed clock time \[H:MM:SS \(secs\)\]: (\d+:\d+:\d+) \((\d+)\)")
        .unwrap()
});
static DONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"DONE \((\S+), rc=(\d+)\)").unwrap());
static COVER_STEP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(SolverMode::CoverReachability.protocol().step_pattern).unwrap());
static BMC_STEP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(SolverMode::BoundedAssertion.protocol().step_pattern).unwrap());

fn step_regex(mode: SolverMode) -> &'static Regex {
    match mode {
        SolverMode::CoverReachability => &COVER_STEP_RE,
        SolverMode::BoundedAssertion => &BMC_STEP_RE,
    }
}

pub const JOB_LOG_FILE: &str = "logfile.txt";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobLogSummary {
    pub step: Option<u32>,
    /// `H:MM:SS` as printed by the solver.
    pub elapsed: Option<String>,
    pub elapsed_secs: Option<u64>,
    pub status: Option<String>,
    pub return_code: Option<i32>,
}

impl JobLogSummary {
    pub fn is_empty(&self) -> bool {
        *self == JobLogSummary::default()
    }
}

impl fmt::Display for JobLogSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_q<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(|x| x.to_string()).unwrap_or_else(|| "?".to_string())
        }
        write!(
            f,
            "time:{} step:{} return:({}, rc={})",
            or_q(&self.elapsed),
            or_q(&self.step),
            or_q(&self.status),
            or_q(&self.return_code)
        )
    }
}

/// Scans from the last line backwards, stopping at the last step line. The
/// summary and `DONE` lines the solver prints after it are picked up on the
/// way.
pub fn parse_job_log(text: &str, mode: SolverMode) -> JobLogSummary {
    let step_re = step_regex(mode);
    let mut summary = JobLogSummary::default();
    for line in text.lines().rev() {
        if let Some(caps) = step_re.captures(line) {
            summary.step = caps[1].parse().ok();
            break;
        }
        if let Some(caps) = SUMMARY_RE.captures(line) {
            summary.elapsed = Some(caps[1].to_string());
            summary.elapsed_secs = caps[2].parse().ok();
        }
        if let Some(caps) = DONE_RE.captures(line) {
            summary.status = Some(caps[1].to_string());
            summary.return_code = caps[2].parse().ok();
        }
    }
    summary
}

/// Reads `<job_dir>/logfile.txt`. A missing or unreadable log is a warning,
/// never an error.
pub fn read_job_log(job_dir: &Path, mode: SolverMode) -> Option<JobLogSummary> {
    let path = job_dir.join(JOB_LOG_FILE);
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let summary = parse_job_log(&text, mode);
            if summary.is_empty() {
                log::warn!("job log {} has no recognizable summary", path.display());
            }
            Some(summary)
        }
        Err(e) => {
            log::warn!("job log {} unreadable: {}", path.display(), e);
            None
        }
    }
}
