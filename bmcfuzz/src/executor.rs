// SPDX-License-Identifier: Apache-2.0

//! Parallel dispatch of per-point formal jobs.
//!
//! One solver process per point, fanned out over a bounded rayon pool and
//! joined before `run_batch` returns. Jobs share nothing but the read-only
//! RTL tree; each owns its descriptor and job directory. A failure or panic
//! inside one job only marks that point as not covered.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::artifact::{ArtifactConverter, TraceArtifact};
use crate::bmcfuzz_error::BmcfuzzError;
use crate::job_descriptor::{descriptor_path, job_dir};
use crate::job_log::{read_job_log, JobLogSummary};
use crate::process::{command_line, run_command, shell_command, ProcessOutcome};
use crate::solver_mode::SolverMode;
use crate::PointId;

pub const DEFAULT_MAX_WORKERS: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobVerdict {
    Reached,
    NotReached,
    /// Pass code without a trace artifact; nothing to seed the fuzzer with.
    MissingArtifact,
    /// The job itself failed (spawn error, conversion error, panic).
    Failed,
    Cancelled,
}

/// Applies the mode's pass code to a finished job.
pub fn classify_outcome(mode: SolverMode, exit_code: i32, artifact_exists: bool) -> JobVerdict {
    if exit_code != mode.protocol().pass_code {
        JobVerdict::NotReached
    } else if artifact_exists {
        JobVerdict::Reached
    } else {
        JobVerdict::MissingArtifact
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub point: PointId,
    pub verdict: JobVerdict,
    pub artifact: Option<PathBuf>,
    pub image: Option<PathBuf>,
    pub elapsed: Duration,
    pub log: Option<JobLogSummary>,
    pub exit_code: i32,
}

impl JobOutcome {
    pub fn reached(&self) -> bool {
        self.verdict == JobVerdict::Reached
    }

    fn failed(point: PointId, elapsed: Duration) -> Self {
        JobOutcome {
            point,
            verdict: JobVerdict::Failed,
            artifact: None,
            image: None,
            elapsed,
            log: None,
            exit_code: -1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Reached points, ascending.
    pub covered: Vec<PointId>,
    /// One entry per dispatched point, in dispatch order.
    pub outcomes: Vec<JobOutcome>,
    pub elapsed: Duration,
}

/// How to launch the solver for one descriptor.
#[derive(Debug, Clone)]
pub struct SolverCommand {
    pub sby_path: PathBuf,
    pub ric3_path: Option<PathBuf>,
    pub env_script: Option<PathBuf>,
}

impl SolverCommand {
    pub fn command(&self, mode: SolverMode, descriptor: &Path) -> Command {
        let mut line = format!("{} -f {}", self.sby_path.display(), descriptor.display());
        if mode.protocol().needs_ric3 {
            if let Some(ric3) = &self.ric3_path {
                line.push_str(&format!(" --rIC3 {}", ric3.display()));
            }
        }
        shell_command(self.env_script.as_deref(), &line)
    }

    /// Fails with `Setup` when the environment script does not load or the
    /// solver entry point cannot be found.
    pub fn check_environment(&self, mode: SolverMode, cancel: &AtomicBool) -> Result<(), BmcfuzzError> {
        if let Some(env) = &self.env_script {
            log::info!("try to load env: {}", env.display());
            let outcome = run_command(&mut shell_command(Some(env), "env"), cancel)?;
            if outcome.is_cancelled() {
                return Err(BmcfuzzError::Interrupted);
            }
            if !outcome.success() {
                return Err(BmcfuzzError::Setup(format!(
                    "env load failed: {} exited with {}",
                    env.display(),
                    outcome.code()
                )));
            }
        }
        if !self.sby_path.exists() && which::which(&self.sby_path).is_err() {
            return Err(BmcfuzzError::Setup(format!(
                "solver not found: {}",
                self.sby_path.display()
            )));
        }
        if mode.protocol().needs_ric3 {
            match &self.ric3_path {
                Some(p) if p.exists() => {}
                Some(p) => {
                    return Err(BmcfuzzError::Setup(format!(
                        "rIC3 not found: {}",
                        p.display()
                    )))
                }
                None => {
                    return Err(BmcfuzzError::Setup(
                        "bounded-assertion mode needs a rIC3 path".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

pub struct Executor {
    mode: SolverMode,
    cover_tasks_dir: PathBuf,
    solver: SolverCommand,
    converter: Arc<dyn ArtifactConverter>,
    max_workers: usize,
    retain_job_workspace: bool,
    cancel: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(
        mode: SolverMode,
        cover_tasks_dir: PathBuf,
        solver: SolverCommand,
        converter: Arc<dyn ArtifactConverter>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Executor {
            mode,
            cover_tasks_dir,
            solver,
            converter,
            max_workers: DEFAULT_MAX_WORKERS,
            retain_job_workspace: false,
            cancel,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_retain_job_workspace(mut self, retain: bool) -> Self {
        self.retain_job_workspace = retain;
        self
    }

    pub fn set_converter(&mut self, converter: Arc<dyn ArtifactConverter>) {
        self.converter = converter;
    }

    pub fn mode(&self) -> SolverMode {
        self.mode
    }

    pub fn solver(&self) -> &SolverCommand {
        &self.solver
    }

    /// min(configured cap, CPU count), never zero.
    pub fn worker_count(&self) -> usize {
        std::cmp::max(1, std::cmp::min(self.max_workers, num_cpus::get()))
    }

    /// Runs one job per point and joins them all.
    ///
    /// Returns `Interrupted` if the cancel flag was raised during the batch;
    /// the partial outcomes are discarded so the round is abandoned whole.
    pub fn run_batch(&self, points: &[PointId]) -> Result<BatchResult, BmcfuzzError> {
        let start = Instant::now();
        let workers = self.worker_count();
        log::info!(
            "executor: dispatching {} {} jobs on {} workers",
            points.len(),
            self.mode,
            workers
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("bmcfuzz-job-{}", i))
            .build()
            .map_err(|e| BmcfuzzError::Setup(format!("building worker pool: {}", e)))?;
        let outcomes: Vec<JobOutcome> =
            pool.install(|| points.par_iter().map(|&p| self.run_job(p)).collect());
        if self.cancel.load(Ordering::Relaxed) {
            log::warn!("executor: batch interrupted");
            return Err(BmcfuzzError::Interrupted);
        }
        let mut covered: Vec<PointId> = outcomes
            .iter()
            .filter(|o| o.reached())
            .map(|o| o.point)
            .collect();
        covered.sort_unstable();
        let elapsed = start.elapsed();
        log::info!(
            "executor: all tasks completed, total time: {:.2} seconds, found {} cases",
            elapsed.as_secs_f64(),
            covered.len()
        );
        Ok(BatchResult {
            covered,
            outcomes,
            elapsed,
        })
    }

    fn run_job(&self, point: PointId) -> JobOutcome {
        let start = Instant::now();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.execute_job(point)));
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                log::error!("cover_{} task failed: {}", point, e);
                let mut o = JobOutcome::failed(point, start.elapsed());
                if e.is_interrupted() {
                    o.verdict = JobVerdict::Cancelled;
                }
                o
            }
            Err(_) => {
                log::error!("cover_{} task panicked", point);
                JobOutcome::failed(point, start.elapsed())
            }
        };
        if !self.retain_job_workspace {
            self.remove_job_files(point);
        }
        outcome
    }

    fn execute_job(&self, point: PointId) -> Result<JobOutcome, BmcfuzzError> {
        let protocol = self.mode.protocol();
        let descriptor = descriptor_path(&self.cover_tasks_dir, point);
        let mut cmd = self.solver.command(self.mode, &descriptor);
        cmd.current_dir(&self.cover_tasks_dir);
        log::debug!("cover_{}: {}", point, command_line(&cmd));

        let start = Instant::now();
        let process = run_command(&mut cmd, &self.cancel)?;
        let elapsed = start.elapsed();
        log::debug!(
            "cover_{} sby finished, time: {:.2} seconds, return code: {}",
            point,
            elapsed.as_secs_f64(),
            process.code()
        );
        if process == ProcessOutcome::Cancelled {
            return Err(BmcfuzzError::Interrupted);
        }

        let dir = job_dir(&self.cover_tasks_dir, point);
        let log = read_job_log(&dir, self.mode);
        if let Some(summary) = &log {
            log::info!("cover:{}, {}", point, summary);
        }

        let artifact = dir.join("engine_0").join(protocol.artifact_file);
        let verdict = classify_outcome(self.mode, process.code(), artifact.exists());
        let mut outcome = JobOutcome {
            point,
            verdict,
            artifact: None,
            image: None,
            elapsed,
            log,
            exit_code: process.code(),
        };
        match verdict {
            JobVerdict::Reached => {
                log::info!("found case: cover_{}", point);
                let image = self.converter.convert(
                    &TraceArtifact {
                        point,
                        kind: protocol.artifact_kind,
                        path: &artifact,
                    },
                    &self.cancel,
                )?;
                outcome.artifact = Some(artifact);
                outcome.image = Some(image);
            }
            JobVerdict::MissingArtifact => {
                log::warn!(
                    "cover_{}: pass code {} but no {}; treating as not covered",
                    point,
                    protocol.pass_code,
                    protocol.artifact_file
                );
            }
            _ => {
                log::info!(
                    "case({}) not covered, return code: {}",
                    point,
                    process.code()
                );
            }
        }
        Ok(outcome)
    }

    fn remove_job_files(&self, point: PointId) {
        let descriptor = descriptor_path(&self.cover_tasks_dir, point);
        if descriptor.exists() {
            if let Err(e) = std::fs::remove_file(&descriptor) {
                log::warn!("could not remove {}: {}", descriptor.display(), e);
            }
        }
        let dir = job_dir(&self.cover_tasks_dir, point);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                log::warn!("could not remove {}: {}", dir.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(SolverMode::CoverReachability, 0, true, JobVerdict::Reached)]
    #[test_case(SolverMode::CoverReachability, 0, false, JobVerdict::MissingArtifact)]
    #[test_case(SolverMode::CoverReachability, 1, true, JobVerdict::NotReached)]
    #[test_case(SolverMode::CoverReachability, 2, true, JobVerdict::NotReached)]
    #[test_case(SolverMode::BoundedAssertion, 2, true, JobVerdict::Reached)]
    #[test_case(SolverMode::BoundedAssertion, 2, false, JobVerdict::MissingArtifact)]
    #[test_case(SolverMode::BoundedAssertion, 0, true, JobVerdict::NotReached)]
    #[test_case(SolverMode::BoundedAssertion, -1, true, JobVerdict::NotReached)]
    fn test_classify_outcome(mode: SolverMode, code: i32, artifact: bool, want: JobVerdict) {
        assert_eq!(classify_outcome(mode, code, artifact), want);
    }

    #[test]
    fn test_solver_command_adds_ric3_only_for_bmc() {
        let solver = SolverCommand {
            sby_path: PathBuf::from("/opt/sby/sby.py"),
            ric3_path: Some(PathBuf::from("/opt/bin/rIC3")),
            env_script: Some(PathBuf::from("/opt/env")),
        };
        let d = Path::new("/w/cover_3.sby");
        let cover = command_line(&solver.command(SolverMode::CoverReachability, d));
        assert_eq!(cover, "bash -c source /opt/env && /opt/sby/sby.py -f /w/cover_3.sby");
        let bmc = command_line(&solver.command(SolverMode::BoundedAssertion, d));
        assert!(bmc.ends_with("-f /w/cover_3.sby --rIC3 /opt/bin/rIC3"), "{}", bmc);
    }

    #[test]
    fn test_check_environment_rejects_missing_solver() {
        let solver = SolverCommand {
            sby_path: PathBuf::from("/definitely/not/here/sby.py"),
            ric3_path: None,
            env_script: None,
        };
        let cancel = AtomicBool::new(false);
        let err = solver
            .check_environment(SolverMode::CoverReachability, &cancel)
            .unwrap_err();
        assert!(matches!(err, BmcfuzzError::Setup(_)));
    }
}
