// SPDX-License-Identifier: Apache-2.0

//! Command line driver for hybrid formal + fuzzing coverage closure.
//!
//! ```shell
//! $ bmcfuzz-driver --config bmcfuzz.toml run
//! $ bmcfuzz-driver --config bmcfuzz.toml --max-point-num 50 hybrid --snapshot-id 3
//! $ bmcfuzz-driver --solver-mode bounded-assertion formal-sweep
//! ```

mod report_cli_error;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bmcfuzz::campaign::{
    toolchain_campaign, toolchain_scheduler, write_run_summary, Campaign, NoFuzzPass, RunSummary,
};
use bmcfuzz::config::{BmcfuzzConfig, Settings};
use bmcfuzz::cover_report::write_empty_cover_report;
use bmcfuzz::fuzzer::FuzzPass;
use bmcfuzz::point_table::PointTable;
use bmcfuzz::scheduler::FormalBatchRunner;
use bmcfuzz::snapshot::SnapshotId;
use bmcfuzz::solver_mode::SolverMode;
use bmcfuzz::BmcfuzzError;
use clap::{Parser, Subcommand};
use report_cli_error::{report_bmcfuzz_error_and_exit, report_cli_error_and_exit};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::low_level as siglow;

const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "bmcfuzz-driver")]
#[command(about = "Hybrid formal + fuzzing coverage closure for CPU RTL designs")]
struct Cli {
    /// TOML file with a `[bmcfuzz]` table.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Send the log stream to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// CPU design under test (rocket, nutshell, boom, ...).
    #[arg(long, global = true)]
    cpu: Option<String>,

    /// Coverage metric the fuzzer is built with.
    #[arg(long, global = true)]
    cover_type: Option<String>,

    /// cover-reachability (smt) or bounded-assertion (sat).
    #[arg(long, global = true)]
    solver_mode: Option<SolverMode>,

    /// Ceiling on concurrent formal jobs; also capped by the CPU count.
    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// Points dispatched per formal batch.
    #[arg(long, global = true)]
    max_point_num: Option<usize>,

    /// Keep job descriptors, job directories and conversion intermediates.
    #[arg(long, global = true, default_value_t = false)]
    retain_job_workspace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Initial fuzz pass, then one hybrid pass per ranked snapshot.
    Run,
    /// One hybrid pass from a single snapshot.
    Hybrid {
        #[arg(long)]
        snapshot_id: SnapshotId,
    },
    /// Dispatch every uncovered point once, without fuzzing.
    FormalSweep,
    /// Write an all-uncovered coverage report for the point table.
    InitCoverReport {
        /// Defaults to `<cover_tasks_dir>/cover_points.csv`.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print module and point counts.
    Points,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Run => "run",
            Command::Hybrid { .. } => "hybrid",
            Command::FormalSweep => "formal-sweep",
            Command::InitCoverReport { .. } => "init-cover-report",
            Command::Points => "points",
        }
    }
}

impl Cli {
    fn flag_overrides(&self) -> BmcfuzzConfig {
        BmcfuzzConfig {
            cpu: self.cpu.clone(),
            cover_type: self.cover_type.clone(),
            solver_mode: self.solver_mode,
            max_workers: self.max_workers,
            max_point_num: self.max_point_num,
            retain_job_workspace: self.retain_job_workspace.then_some(true),
            ..Default::default()
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    let _ = builder.try_init();
    Ok(())
}

fn load_settings(cli: &Cli) -> Settings {
    let file_config = match &cli.config {
        Some(path) => {
            if !path.exists() {
                report_cli_error_and_exit(
                    "config file does not exist",
                    None,
                    vec![("path", &path.display().to_string())],
                );
            }
            match BmcfuzzConfig::from_file(path) {
                Ok(config) => config,
                Err(e) => report_bmcfuzz_error_and_exit(
                    &e,
                    None,
                    vec![("path", &path.display().to_string())],
                ),
            }
        }
        None => BmcfuzzConfig::default(),
    };
    match file_config.overlay(cli.flag_overrides()).resolve_from_env() {
        Ok(settings) => settings,
        Err(e) => report_bmcfuzz_error_and_exit(&e, Some(cli.command.name()), vec![]),
    }
}

fn load_point_table(settings: &Settings) -> Result<PointTable, BmcfuzzError> {
    PointTable::from_file(&settings.point_table)
}

fn handle_points(settings: &Settings) -> Result<(), BmcfuzzError> {
    let table = load_point_table(settings)?;
    println!("modules: {}", table.module_count());
    println!("points: {}", table.len());
    for (module, size) in table.module_sizes().iter().enumerate() {
        println!("  {}: {}", table.module_name(module).unwrap_or("?"), size);
    }
    Ok(())
}

fn handle_init_cover_report(settings: &Settings, output: Option<&Path>) -> Result<(), BmcfuzzError> {
    let table = load_point_table(settings)?;
    let path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| settings.cover_report_path());
    write_empty_cover_report(&path, table.len())?;
    println!("wrote {} points to {}", table.len(), path.display());
    Ok(())
}

fn report_summary(summary: &RunSummary) {
    println!(
        "covered {}/{} ({:.2}%): formal {}, fuzz {}",
        summary.covered,
        summary.total_points,
        summary.coverage_rate * 100.0,
        summary.formal_covered,
        summary.fuzz_covered
    );
}

/// On interrupt, logs the ledger and records a partial summary before the
/// error is handed back.
fn conclude_campaign<R: FormalBatchRunner, F: FuzzPass>(
    campaign: &Campaign<R, F>,
    result: Result<RunSummary, BmcfuzzError>,
) -> Result<(), BmcfuzzError> {
    match result {
        Ok(summary) => {
            report_summary(&summary);
            Ok(())
        }
        Err(e) if e.is_interrupted() => {
            campaign.scheduler().ledger().log_summary();
            campaign.write_summary(&campaign.summary(true))?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn handle_formal_sweep(settings: &Settings, cancel: Arc<AtomicBool>) -> Result<(), BmcfuzzError> {
    let start = Instant::now();
    let table = load_point_table(settings)?;
    write_empty_cover_report(&settings.cover_report_path(), table.len())?;
    let mut scheduler = toolchain_scheduler(settings, table, NoFuzzPass, cancel)?;
    let result = scheduler.run_formal_sweep();
    let interrupted = matches!(&result, Err(e) if e.is_interrupted());
    let summary = RunSummary::from_scheduler(&scheduler, Vec::new(), start.elapsed(), interrupted);
    if interrupted {
        scheduler.ledger().log_summary();
    }
    if result.is_ok() || interrupted {
        write_run_summary(&settings.logs_dir, &summary)?;
    }
    result?;
    report_summary(&summary);
    Ok(())
}

fn dispatch(
    command: &Command,
    settings: &Settings,
    cancel: Arc<AtomicBool>,
) -> Result<(), BmcfuzzError> {
    match command {
        Command::Run => {
            let mut campaign = toolchain_campaign(settings, cancel)?;
            let result = campaign.run();
            conclude_campaign(&campaign, result)
        }
        Command::Hybrid { snapshot_id } => {
            let mut campaign = toolchain_campaign(settings, cancel)?;
            let result = campaign.run_single_snapshot(*snapshot_id);
            conclude_campaign(&campaign, result)
        }
        Command::FormalSweep => handle_formal_sweep(settings, cancel),
        Command::InitCoverReport { output } => handle_init_cover_report(settings, output.as_deref()),
        Command::Points => handle_points(settings),
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;
    let settings = load_settings(&cli);
    log::debug!("settings: {:?}", settings);

    // Run-scoped cancellation flag, set from SIGINT/SIGTERM/SIGHUP.
    let cancel = Arc::new(AtomicBool::new(false));
    let mut sig_ids = Vec::new();
    for sig in [SIGINT, SIGTERM, SIGHUP] {
        let flag = Arc::clone(&cancel);
        match unsafe { siglow::register(sig, move || flag.store(true, Ordering::Relaxed)) } {
            Ok(id) => sig_ids.push(id),
            Err(e) => log::warn!("failed to register signal {}: {}", sig, e),
        }
    }

    let result = dispatch(&cli.command, &settings, cancel);

    for id in sig_ids.drain(..) {
        let _ = siglow::unregister(id);
    }

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) if e.is_interrupted() => {
            log::warn!("{}: interrupted", cli.command.name());
            Ok(ExitCode::from(INTERRUPTED_EXIT_CODE))
        }
        Err(e) => {
            log::error!("{}: {}", cli.command.name(), e);
            Err(e.into())
        }
    }
}
