// SPDX-License-Identifier: Apache-2.0

//! Campaign entry points: the outer snapshot loop around the hybrid
//! scheduler, and wiring of the production collaborators from `Settings`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::artifact::ToolchainArtifactConverter;
use crate::bmcfuzz_error::BmcfuzzError;
use crate::config::Settings;
use crate::cover_report::write_empty_cover_report;
use crate::executor::{Executor, SolverCommand};
use crate::fuzzer::{FuzzPass, FuzzPhase, FuzzerBuild, ToolchainFuzzPass};
use crate::job_descriptor::JobDescriptorWriter;
use crate::point_table::PointTable;
use crate::points_log::PointsLog;
use crate::scheduler::{FormalBatchRunner, HybridScheduler, SchedulerStats, ToolchainFormalRunner};
use crate::snapshot::{
    bootstrap_snapshot, CommandSnapshotSource, RankedSnapshots, Snapshot, SnapshotId,
    SnapshotSource,
};
use crate::solver_mode::ArtifactKind;

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total_points: usize,
    pub covered: usize,
    pub formal_covered: usize,
    pub fuzz_covered: usize,
    pub coverage_rate: f64,
    pub formal_cover_rate: f64,
    pub stats: SchedulerStats,
    pub snapshots_visited: Vec<SnapshotId>,
    pub elapsed_secs: f64,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn from_scheduler<R: FormalBatchRunner, F: FuzzPass>(
        scheduler: &HybridScheduler<R, F>,
        snapshots_visited: Vec<SnapshotId>,
        elapsed: Duration,
        interrupted: bool,
    ) -> Self {
        let ledger = scheduler.ledger();
        RunSummary {
            total_points: ledger.total(),
            covered: ledger.covered_count(),
            formal_covered: ledger.formal_covered(),
            fuzz_covered: ledger.fuzz_covered(),
            coverage_rate: ledger.rate(),
            formal_cover_rate: ledger.formal_cover_rate(),
            stats: scheduler.stats().clone(),
            snapshots_visited,
            elapsed_secs: elapsed.as_secs_f64(),
            interrupted,
        }
    }
}

pub struct Campaign<R: FormalBatchRunner, F: FuzzPass> {
    scheduler: HybridScheduler<R, F>,
    source: Box<dyn SnapshotSource>,
    wave_dir: PathBuf,
    snapshot_dir: PathBuf,
    bootstrap_command: Option<String>,
    env_script: Option<PathBuf>,
    // Where `errors/` and `crashes/` are reset before a campaign.
    noop_home: Option<PathBuf>,
    logs_dir: PathBuf,
    snapshots_visited: Vec<SnapshotId>,
    started: Instant,
    cancel: Arc<AtomicBool>,
}

impl<R: FormalBatchRunner, F: FuzzPass> Campaign<R, F> {
    pub fn new(
        scheduler: HybridScheduler<R, F>,
        source: Box<dyn SnapshotSource>,
        wave_dir: PathBuf,
        snapshot_dir: PathBuf,
        logs_dir: PathBuf,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Campaign {
            scheduler,
            source,
            wave_dir,
            snapshot_dir,
            bootstrap_command: None,
            env_script: None,
            noop_home: None,
            logs_dir,
            snapshots_visited: Vec::new(),
            started: Instant::now(),
            cancel,
        }
    }

    pub fn with_bootstrap(mut self, command: Option<String>, env_script: Option<PathBuf>) -> Self {
        self.bootstrap_command = command;
        self.env_script = env_script;
        self
    }

    pub fn with_noop_home(mut self, noop_home: Option<PathBuf>) -> Self {
        self.noop_home = noop_home;
        self
    }

    pub fn scheduler(&self) -> &HybridScheduler<R, F> {
        &self.scheduler
    }

    pub fn snapshots_visited(&self) -> &[SnapshotId] {
        &self.snapshots_visited
    }

    fn prepare_workspace(&self) -> Result<(), BmcfuzzError> {
        std::fs::create_dir_all(&self.logs_dir)
            .map_err(|e| BmcfuzzError::io(format!("creating {}", self.logs_dir.display()), e))?;
        if let Some(noop) = &self.noop_home {
            for name in ["errors", "crashes"] {
                let dir = noop.join(name);
                if dir.exists() {
                    std::fs::remove_dir_all(&dir).map_err(|e| {
                        BmcfuzzError::io(format!("removing {}", dir.display()), e)
                    })?;
                }
                std::fs::create_dir_all(&dir)
                    .map_err(|e| BmcfuzzError::io(format!("creating {}", dir.display()), e))?;
            }
        }
        write_empty_cover_report(
            self.scheduler.cover_report_path(),
            self.scheduler.table().len(),
        )
    }

    /// Initial fuzz pass from reset, then one hybrid pass per snapshot until
    /// the score source runs out.
    pub fn run(&mut self) -> Result<RunSummary, BmcfuzzError> {
        self.prepare_workspace()?;
        log::info!("campaign: initial fuzz pass");
        self.scheduler
            .fuzz_pass_mut()
            .prepare(None, &self.cancel)?;
        self.scheduler.fuzz_and_merge(FuzzPhase::Initial, &[])?;
        self.source.update(&self.cancel)?;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(BmcfuzzError::Interrupted);
            }
            let Some(best) = self.source.next_best(&self.cancel)? else {
                log::info!("campaign: no snapshots left");
                break;
            };
            match best.score {
                Some(score) => log::info!("campaign: snapshot {} (score {:.4})", best.id, score),
                None => log::info!("campaign: snapshot {}", best.id),
            }
            self.run_snapshot(best.id, best.score)?;
        }
        self.finish()
    }

    /// Bootstraps one snapshot and runs a single hybrid pass from it.
    pub fn run_single_snapshot(&mut self, id: SnapshotId) -> Result<RunSummary, BmcfuzzError> {
        self.prepare_workspace()?;
        self.run_snapshot(id, None)?;
        self.finish()
    }

    fn run_snapshot(&mut self, id: SnapshotId, score: Option<f64>) -> Result<(), BmcfuzzError> {
        let snapshot = Snapshot::locate(id, &self.wave_dir, &self.snapshot_dir, score);
        if let Some(command) = &self.bootstrap_command {
            bootstrap_snapshot(command, &snapshot, self.env_script.as_deref(), &self.cancel)?;
        }
        self.scheduler
            .fuzz_pass_mut()
            .prepare(Some(&snapshot), &self.cancel)?;
        self.scheduler.set_snapshot(Some(snapshot));
        self.scheduler.reset_context()?;
        // Scores are refreshed after every fuzz pass of the loop.
        let source = &mut self.source;
        let cancel = &self.cancel;
        self.scheduler
            .run_hybrid_loop_with(|| source.update(cancel))?;
        self.snapshots_visited.push(id);
        Ok(())
    }

    fn finish(&self) -> Result<RunSummary, BmcfuzzError> {
        let summary = self.summary(false);
        self.write_summary(&summary)?;
        Ok(summary)
    }

    pub fn summary(&self, interrupted: bool) -> RunSummary {
        RunSummary::from_scheduler(
            &self.scheduler,
            self.snapshots_visited.clone(),
            self.started.elapsed(),
            interrupted,
        )
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf, BmcfuzzError> {
        write_run_summary(&self.logs_dir, summary)
    }
}

pub fn write_run_summary(logs_dir: &Path, summary: &RunSummary) -> Result<PathBuf, BmcfuzzError> {
    std::fs::create_dir_all(logs_dir)
        .map_err(|e| BmcfuzzError::io(format!("creating {}", logs_dir.display()), e))?;
    let path = logs_dir.join(RUN_SUMMARY_FILE);
    let text = serde_json::to_string_pretty(summary)
        .map_err(|e| BmcfuzzError::Parse(format!("serializing run summary: {}", e)))?;
    std::fs::write(&path, text)
        .map_err(|e| BmcfuzzError::io(format!("writing {}", path.display()), e))?;
    log::info!("campaign: summary written to {}", path.display());
    Ok(path)
}

pub type ToolchainScheduler<F> = HybridScheduler<ToolchainFormalRunner, F>;
pub type ToolchainCampaign = Campaign<ToolchainFormalRunner, ToolchainFuzzPass>;

/// Descriptor writer, solver launcher, converter and executor for `settings`.
/// Fails with `Setup` when the solver environment is unusable.
pub fn toolchain_formal_runner(
    settings: &Settings,
    total_points: usize,
    cancel: Arc<AtomicBool>,
) -> Result<ToolchainFormalRunner, BmcfuzzError> {
    let mode = settings.solver_mode;
    let solver = SolverCommand {
        sby_path: settings.sby_path.clone(),
        ric3_path: Some(settings.ric3_path.clone()),
        env_script: settings.solver_env_script.clone(),
    };
    solver.check_environment(mode, &cancel)?;
    let noop_home = match mode.protocol().artifact_kind {
        ArtifactKind::Witness => settings.require_noop_home()?.to_path_buf(),
        ArtifactKind::Waveform => settings.noop_home.clone().unwrap_or_default(),
    };
    let converter = ToolchainArtifactConverter {
        hexbin_dir: settings.hexbin_dir(),
        solver_env_script: settings.solver_env_script.clone(),
        noop_home,
        cover_type: settings.cover_type.clone(),
        snapshot_file: None,
        cpu: settings.cpu.clone(),
        retain_intermediates: settings.retain_job_workspace,
    };
    let writer = JobDescriptorWriter::from_template_file(
        &settings.sby_template,
        settings.cover_tasks_dir.clone(),
        settings.rtl_dir.clone(),
        mode,
        settings.depth,
        settings.timeout_secs,
        total_points,
    )?;
    let executor = Executor::new(
        mode,
        settings.cover_tasks_dir.clone(),
        solver,
        Arc::new(converter.clone()),
        cancel,
    )
    .with_max_workers(settings.max_workers)
    .with_retain_job_workspace(settings.retain_job_workspace);
    Ok(ToolchainFormalRunner::new(writer, executor, converter)
        .with_rtl_prepare(settings.rtl_prepare_command.clone()))
}

pub fn toolchain_fuzz_pass(settings: &Settings) -> Result<ToolchainFuzzPass, BmcfuzzError> {
    let noop_home = settings.require_noop_home()?.to_path_buf();
    let build = FuzzerBuild {
        noop_home: noop_home.clone(),
        cover_type: settings.cover_type.clone(),
        snapshot_top: settings.snapshot_top.clone(),
        difftest_mem_helper: settings.difftest_mem_helper.clone(),
        make_log_file: settings.logs_dir.join("make_fuzzer.log"),
        jobs: settings.make_jobs,
    };
    let mut pass = ToolchainFuzzPass::new(
        noop_home,
        settings.cover_type.clone(),
        settings.cover_report_path(),
        settings.fuzz_log_dir.clone(),
        build,
    );
    pass.corpus_dir = settings.corpus_dir.clone();
    pass.init_corpus = settings.init_corpus.clone();
    Ok(pass)
}

/// The configured snapshot score source: the select command if set,
/// otherwise a static score file.
pub fn snapshot_source(settings: &Settings) -> Result<Box<dyn SnapshotSource>, BmcfuzzError> {
    if let Some(select) = &settings.snapshot_select_command {
        return Ok(Box::new(CommandSnapshotSource {
            select_command: select.clone(),
            update_command: settings.snapshot_update_command.clone(),
            capture_path: settings.logs_dir.join("snapshot_select.out"),
        }));
    }
    if let Some(scores) = &settings.snapshot_scores {
        return Ok(Box::new(RankedSnapshots::from_file(scores)?));
    }
    Err(BmcfuzzError::Setup(
        "no snapshot score source (snapshot_select_command or snapshot_scores)".to_string(),
    ))
}

pub fn toolchain_scheduler<F: FuzzPass>(
    settings: &Settings,
    table: PointTable,
    fuzz: F,
    cancel: Arc<AtomicBool>,
) -> Result<ToolchainScheduler<F>, BmcfuzzError> {
    let runner = toolchain_formal_runner(settings, table.len(), cancel.clone())?;
    Ok(HybridScheduler::new(
        table,
        settings.max_point_num,
        runner,
        fuzz,
        PointsLog::new(settings.logs_dir.clone()),
        settings.cover_report_path(),
        cancel,
    )
    .with_max_zero_progress_retries(settings.max_zero_progress_retries))
}

pub fn toolchain_campaign(
    settings: &Settings,
    cancel: Arc<AtomicBool>,
) -> Result<ToolchainCampaign, BmcfuzzError> {
    let table = PointTable::from_file(&settings.point_table)?;
    let fuzz = toolchain_fuzz_pass(settings)?;
    let scheduler = toolchain_scheduler(settings, table, fuzz, cancel.clone())?;
    let source = snapshot_source(settings)?;
    Ok(Campaign::new(
        scheduler,
        source,
        settings.wave_dir.clone(),
        settings.snapshot_dir.clone(),
        settings.logs_dir.clone(),
        cancel,
    )
    .with_bootstrap(
        settings.snapshot_bootstrap_command.clone(),
        settings.solver_env_script.clone(),
    )
    .with_noop_home(settings.noop_home.clone()))
}

/// Stand-in fuzz pass for the formal-only sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFuzzPass;

impl FuzzPass for NoFuzzPass {
    fn run(
        &mut self,
        _request: &crate::fuzzer::FuzzRequest<'_>,
        _cancel: &AtomicBool,
    ) -> Result<PathBuf, BmcfuzzError> {
        Err(BmcfuzzError::Setup(
            "fuzzing is not available in this mode".to_string(),
        ))
    }
}
