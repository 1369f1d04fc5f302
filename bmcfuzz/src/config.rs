// SPDX-License-Identifier: Apache-2.0

//! Campaign configuration.
//!
//! A `[bmcfuzz]` TOML table supplies any subset of the fields; command-line
//! flags are layered on top with `overlay`, and `resolve` fills the rest from
//! environment variables and built-in defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bmcfuzz_error::BmcfuzzError;
use crate::executor::DEFAULT_MAX_WORKERS;
use crate::job_descriptor::default_depth_and_timeout;
use crate::solver_mode::SolverMode;

pub const DEFAULT_CPU: &str = "rocket";
pub const DEFAULT_COVER_TYPE: &str = "toggle";
pub const DEFAULT_MAX_POINT_NUM: usize = 20;
pub const DEFAULT_MAKE_JOBS: usize = 16;
pub const COVER_REPORT_FILE: &str = "cover_points.csv";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BmcfuzzConfig {
    /// CPU design under test, e.g. `rocket`, `nutshell`, `boom`.
    pub cpu: Option<String>,
    /// Coverage metric the fuzzer is built with, e.g. `toggle`.
    pub cover_type: Option<String>,
    pub solver_mode: Option<SolverMode>,
    pub max_workers: Option<usize>,
    /// Batch cap on points dispatched per formal round.
    pub max_point_num: Option<usize>,
    /// Keep descriptors, job directories and conversion intermediates.
    pub retain_job_workspace: Option<bool>,
    pub max_zero_progress_retries: Option<usize>,
    pub depth: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub make_jobs: Option<usize>,

    pub bmcfuzz_home: Option<PathBuf>,
    pub noop_home: Option<PathBuf>,
    pub cover_tasks_dir: Option<PathBuf>,
    pub sby_template: Option<PathBuf>,
    pub solver_env_script: Option<PathBuf>,
    pub sby_path: Option<PathBuf>,
    pub ric3_path: Option<PathBuf>,
    /// Generated `firrtl-cover.cpp` listing the point names.
    pub point_table: Option<PathBuf>,
    pub rtl_dir: Option<PathBuf>,
    pub corpus_dir: Option<PathBuf>,
    pub init_corpus: Option<PathBuf>,
    pub snapshot_dir: Option<PathBuf>,
    pub wave_dir: Option<PathBuf>,
    pub snapshot_top: Option<PathBuf>,
    pub difftest_mem_helper: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
    pub fuzz_log_dir: Option<PathBuf>,
    /// `id score` lines; used when no select command is configured.
    pub snapshot_scores: Option<PathBuf>,

    pub rtl_prepare_command: Option<String>,
    pub snapshot_bootstrap_command: Option<String>,
    pub snapshot_select_command: Option<String>,
    pub snapshot_update_command: Option<String>,
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    bmcfuzz: BmcfuzzConfig,
}

impl BmcfuzzConfig {
    pub fn parse(text: &str) -> Result<Self, BmcfuzzError> {
        let file: ConfigFile = toml::from_str(text)
            .map_err(|e| BmcfuzzError::Parse(format!("config: {}", e)))?;
        Ok(file.bmcfuzz)
    }

    pub fn from_file(path: &Path) -> Result<Self, BmcfuzzError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BmcfuzzError::io(format!("reading config {}", path.display()), e))?;
        BmcfuzzConfig::parse(&text)
    }

    /// Fields set in `flags` win over fields set here.
    pub fn overlay(self, flags: BmcfuzzConfig) -> BmcfuzzConfig {
        BmcfuzzConfig {
            cpu: flags.cpu.or(self.cpu),
            cover_type: flags.cover_type.or(self.cover_type),
            solver_mode: flags.solver_mode.or(self.solver_mode),
            max_workers: flags.max_workers.or(self.max_workers),
            max_point_num: flags.max_point_num.or(self.max_point_num),
            retain_job_workspace: flags.retain_job_workspace.or(self.retain_job_workspace),
            max_zero_progress_retries: flags
                .max_zero_progress_retries
                .or(self.max_zero_progress_retries),
            depth: flags.depth.or(self.depth),
            timeout_secs: flags.timeout_secs.or(self.timeout_secs),
            make_jobs: flags.make_jobs.or(self.make_jobs),
            bmcfuzz_home: flags.bmcfuzz_home.or(self.bmcfuzz_home),
            noop_home: flags.noop_home.or(self.noop_home),
            cover_tasks_dir: flags.cover_tasks_dir.or(self.cover_tasks_dir),
            sby_template: flags.sby_template.or(self.sby_template),
            solver_env_script: flags.solver_env_script.or(self.solver_env_script),
            sby_path: flags.sby_path.or(self.sby_path),
            ric3_path: flags.ric3_path.or(self.ric3_path),
            point_table: flags.point_table.or(self.point_table),
            rtl_dir: flags.rtl_dir.or(self.rtl_dir),
            corpus_dir: flags.corpus_dir.or(self.corpus_dir),
            init_corpus: flags.init_corpus.or(self.init_corpus),
            snapshot_dir: flags.snapshot_dir.or(self.snapshot_dir),
            wave_dir: flags.wave_dir.or(self.wave_dir),
            snapshot_top: flags.snapshot_top.or(self.snapshot_top),
            difftest_mem_helper: flags.difftest_mem_helper.or(self.difftest_mem_helper),
            logs_dir: flags.logs_dir.or(self.logs_dir),
            fuzz_log_dir: flags.fuzz_log_dir.or(self.fuzz_log_dir),
            snapshot_scores: flags.snapshot_scores.or(self.snapshot_scores),
            rtl_prepare_command: flags.rtl_prepare_command.or(self.rtl_prepare_command),
            snapshot_bootstrap_command: flags
                .snapshot_bootstrap_command
                .or(self.snapshot_bootstrap_command),
            snapshot_select_command: flags
                .snapshot_select_command
                .or(self.snapshot_select_command),
            snapshot_update_command: flags
                .snapshot_update_command
                .or(self.snapshot_update_command),
        }
    }

    /// Resolves against the process environment.
    pub fn resolve_from_env(&self) -> Result<Settings, BmcfuzzError> {
        self.resolve(|name| std::env::var_os(name).map(PathBuf::from))
    }

    /// Fills unset fields from `env` (for the variables that have one) and
    /// then from defaults.
    pub fn resolve(
        &self,
        env: impl Fn(&str) -> Option<PathBuf>,
    ) -> Result<Settings, BmcfuzzError> {
        let path_or_env = |value: &Option<PathBuf>, var: &str| value.clone().or_else(|| env(var));

        let cpu = self.cpu.clone().unwrap_or_else(|| DEFAULT_CPU.to_string());
        let cover_type = self
            .cover_type
            .clone()
            .unwrap_or_else(|| DEFAULT_COVER_TYPE.to_string());
        let max_point_num = self.max_point_num.unwrap_or(DEFAULT_MAX_POINT_NUM);
        if max_point_num == 0 {
            return Err(BmcfuzzError::Setup(
                "max_point_num must be at least 1".to_string(),
            ));
        }
        let (default_depth, default_timeout) = default_depth_and_timeout(&cpu);

        let home = path_or_env(&self.bmcfuzz_home, "BMCFUZZ_HOME")
            .unwrap_or_else(|| PathBuf::from("."));
        let formal = home.join("Formal");
        let init_values = home.join("SetInitValues");
        let logs_dir = self.logs_dir.clone().unwrap_or_else(|| home.join("logs"));

        Ok(Settings {
            max_workers: self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS),
            max_point_num,
            solver_mode: self.solver_mode.unwrap_or_default(),
            retain_job_workspace: self.retain_job_workspace.unwrap_or(false),
            max_zero_progress_retries: self.max_zero_progress_retries,
            depth: self.depth.unwrap_or(default_depth),
            timeout_secs: self.timeout_secs.unwrap_or(default_timeout),
            make_jobs: self.make_jobs.unwrap_or(DEFAULT_MAKE_JOBS),
            noop_home: path_or_env(&self.noop_home, "NOOP_HOME"),
            cover_tasks_dir: path_or_env(&self.cover_tasks_dir, "COVER_POINTS_OUT")
                .unwrap_or_else(|| formal.join("coverTasks")),
            sby_template: path_or_env(&self.sby_template, "SBY_TEMPLATE")
                .unwrap_or_else(|| formal.join("template.sby")),
            solver_env_script: path_or_env(&self.solver_env_script, "OSS_CAD_SUITE_HOME"),
            sby_path: self
                .sby_path
                .clone()
                .unwrap_or_else(|| home.join("sby").join("sbysrc").join("sby.py")),
            ric3_path: self
                .ric3_path
                .clone()
                .unwrap_or_else(|| formal.join("bin").join("rIC3")),
            point_table: self.point_table.clone().unwrap_or_else(|| {
                formal.join("demo").join(&cpu).join("firrtl-cover.cpp")
            }),
            rtl_dir: self
                .rtl_dir
                .clone()
                .unwrap_or_else(|| formal.join("coverTasks").join("rtl")),
            corpus_dir: path_or_env(&self.corpus_dir, "CORPUS_DIR"),
            init_corpus: path_or_env(&self.init_corpus, "LINEARIZED_CORPUS"),
            snapshot_dir: self
                .snapshot_dir
                .clone()
                .unwrap_or_else(|| init_values.join("csr_snapshot")),
            wave_dir: self
                .wave_dir
                .clone()
                .unwrap_or_else(|| init_values.join("csr_wave")),
            snapshot_top: self
                .snapshot_top
                .clone()
                .unwrap_or_else(|| init_values.join("SimTop_init.sv")),
            difftest_mem_helper: self
                .difftest_mem_helper
                .clone()
                .unwrap_or_else(|| init_values.join("MemRWHelper_difftest.v")),
            fuzz_log_dir: path_or_env(&self.fuzz_log_dir, "FUZZ_LOG")
                .unwrap_or_else(|| logs_dir.join("fuzz")),
            logs_dir,
            snapshot_scores: self.snapshot_scores.clone(),
            rtl_prepare_command: self.rtl_prepare_command.clone(),
            snapshot_bootstrap_command: self.snapshot_bootstrap_command.clone(),
            snapshot_select_command: self.snapshot_select_command.clone(),
            snapshot_update_command: self.snapshot_update_command.clone(),
            cpu,
            cover_type,
            bmcfuzz_home: home,
        })
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub cpu: String,
    pub cover_type: String,
    pub solver_mode: SolverMode,
    pub max_workers: usize,
    pub max_point_num: usize,
    pub retain_job_workspace: bool,
    pub max_zero_progress_retries: Option<usize>,
    pub depth: u32,
    pub timeout_secs: u64,
    pub make_jobs: usize,
    pub bmcfuzz_home: PathBuf,
    pub noop_home: Option<PathBuf>,
    pub cover_tasks_dir: PathBuf,
    pub sby_template: PathBuf,
    pub solver_env_script: Option<PathBuf>,
    pub sby_path: PathBuf,
    pub ric3_path: PathBuf,
    pub point_table: PathBuf,
    pub rtl_dir: PathBuf,
    pub corpus_dir: Option<PathBuf>,
    pub init_corpus: Option<PathBuf>,
    pub snapshot_dir: PathBuf,
    pub wave_dir: PathBuf,
    pub snapshot_top: PathBuf,
    pub difftest_mem_helper: PathBuf,
    pub logs_dir: PathBuf,
    pub fuzz_log_dir: PathBuf,
    pub snapshot_scores: Option<PathBuf>,
    pub rtl_prepare_command: Option<String>,
    pub snapshot_bootstrap_command: Option<String>,
    pub snapshot_select_command: Option<String>,
    pub snapshot_update_command: Option<String>,
}

impl Settings {
    pub fn cover_report_path(&self) -> PathBuf {
        self.cover_tasks_dir.join(COVER_REPORT_FILE)
    }

    pub fn hexbin_dir(&self) -> PathBuf {
        self.cover_tasks_dir.join("hexbin")
    }

    pub fn require_noop_home(&self) -> Result<&Path, BmcfuzzError> {
        self.noop_home.as_deref().ok_or_else(|| {
            BmcfuzzError::Setup(
                "fuzzer build tree is not set (noop_home or NOOP_HOME)".to_string(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn no_env(_: &str) -> Option<PathBuf> {
        None
    }

    #[test]
    fn test_defaults() {
        let s = BmcfuzzConfig::default().resolve(no_env).unwrap();
        assert_eq!(s.cpu, "rocket");
        assert_eq!(s.cover_type, "toggle");
        assert_eq!(s.solver_mode, SolverMode::CoverReachability);
        assert_eq!(s.max_workers, 250);
        assert_eq!(s.max_point_num, 20);
        assert_eq!((s.depth, s.timeout_secs), (75, 3 * 60 * 60));
        assert_eq!(s.cover_tasks_dir, PathBuf::from("./Formal/coverTasks"));
        assert_eq!(
            s.cover_report_path(),
            PathBuf::from("./Formal/coverTasks/cover_points.csv")
        );
        assert_eq!(
            s.point_table,
            PathBuf::from("./Formal/demo/rocket/firrtl-cover.cpp")
        );
        assert_eq!(s.fuzz_log_dir, PathBuf::from("./logs/fuzz"));
        assert!(s.noop_home.is_none());
        assert!(s.require_noop_home().is_err());
    }

    #[test]
    fn test_parse_toml_table() {
        let cfg = BmcfuzzConfig::parse(
            r#"
[bmcfuzz]
cpu = "nutshell"
solver_mode = "sat"
max_point_num = 8
noop_home = "/work/NutShell"
snapshot_select_command = "python3 select.py"
"#,
        )
        .unwrap();
        assert_eq!(cfg.solver_mode, Some(SolverMode::BoundedAssertion));
        let s = cfg.resolve(no_env).unwrap();
        assert_eq!((s.depth, s.timeout_secs), (90, 2 * 60 * 60));
        assert_eq!(s.max_point_num, 8);
        assert_eq!(s.require_noop_home().unwrap(), Path::new("/work/NutShell"));
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        assert_eq!(BmcfuzzConfig::parse("").unwrap(), BmcfuzzConfig::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = BmcfuzzConfig::parse("[bmcfuzz]\nmax_pointnum = 3\n").unwrap_err();
        assert!(matches!(err, BmcfuzzError::Parse(_)));
    }

    #[test]
    fn test_precedence_flag_then_toml_then_env() {
        let env = |name: &str| match name {
            "COVER_POINTS_OUT" => Some(PathBuf::from("/env/cover")),
            "NOOP_HOME" => Some(PathBuf::from("/env/noop")),
            "CORPUS_DIR" => Some(PathBuf::from("/env/corpus")),
            _ => None,
        };
        let toml = BmcfuzzConfig {
            cover_tasks_dir: Some(PathBuf::from("/toml/cover")),
            noop_home: Some(PathBuf::from("/toml/noop")),
            max_point_num: Some(5),
            ..Default::default()
        };
        let flags = BmcfuzzConfig {
            cover_tasks_dir: Some(PathBuf::from("/flag/cover")),
            ..Default::default()
        };
        let s = toml.overlay(flags).resolve(env).unwrap();
        assert_eq!(s.cover_tasks_dir, PathBuf::from("/flag/cover"));
        assert_eq!(s.noop_home, Some(PathBuf::from("/toml/noop")));
        assert_eq!(s.corpus_dir, Some(PathBuf::from("/env/corpus")));
        assert_eq!(s.max_point_num, 5);
    }

    #[test]
    fn test_zero_batch_cap_rejected() {
        let cfg = BmcfuzzConfig {
            max_point_num: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            cfg.resolve(no_env).unwrap_err(),
            BmcfuzzError::Setup(_)
        ));
    }
}
