// SPDX-License-Identifier: Apache-2.0

//! Building and running the greybox fuzzer.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use crate::bmcfuzz_error::BmcfuzzError;
use crate::process::{run_checked, run_command, shell_command};
use crate::snapshot::Snapshot;

/// Fuzzer command-line options. Defaults match the fuzzer's own defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzArgs {
    pub fuzzing: bool,
    pub cover_type: String,
    /// 0 leaves the run count to the fuzzer.
    pub max_runs: u64,
    pub corpus_input: Option<PathBuf>,
    pub continue_on_errors: bool,
    pub insert_nop: bool,
    pub save_errors: bool,
    pub only_fuzz: bool,
    /// Passed only when positive.
    pub formal_cover_rate: f64,
    pub max_instr: u64,
    pub max_cycle: u64,
    pub dump_csr: bool,
    pub wave_path: Option<PathBuf>,
    pub snapshot_file: Option<PathBuf>,
    pub no_diff: bool,
    pub dump_footprints: Option<PathBuf>,
    pub as_footprints: bool,
    pub output_file: Option<PathBuf>,
}

impl Default for FuzzArgs {
    fn default() -> Self {
        FuzzArgs {
            fuzzing: true,
            cover_type: "toggle".to_string(),
            max_runs: 0,
            corpus_input: None,
            continue_on_errors: false,
            insert_nop: false,
            save_errors: false,
            only_fuzz: false,
            formal_cover_rate: -1.0,
            max_instr: 100,
            max_cycle: 500,
            dump_csr: false,
            wave_path: None,
            snapshot_file: None,
            no_diff: false,
            dump_footprints: None,
            as_footprints: false,
            output_file: None,
        }
    }
}

impl FuzzArgs {
    /// The shell line run from the fuzzer's build tree.
    pub fn command_line(&self, noop_home: &Path) -> String {
        let mut line = format!(
            "cd {} && source env.sh && build/fuzzer",
            noop_home.display()
        );
        if self.fuzzing {
            line.push_str(" -f");
        }
        line.push_str(&format!(" -c firrtl.{}", self.cover_type));
        if self.max_runs > 0 {
            line.push_str(&format!(" --max-runs {}", self.max_runs));
        }
        if let Some(corpus) = &self.corpus_input {
            line.push_str(&format!(" --corpus-input {}", corpus.display()));
        }
        if self.continue_on_errors {
            line.push_str(" --continue-on-errors");
        }
        if self.insert_nop {
            line.push_str(" --insert-nop");
        }
        if self.save_errors {
            line.push_str(" --save-errors");
        }
        if self.only_fuzz {
            line.push_str(" --only-fuzz");
        }
        if self.formal_cover_rate > 0.0 {
            line.push_str(&format!(" --formal-cover-rate {}", self.formal_cover_rate));
        }
        line.push_str(" --");
        line.push_str(&format!(" -I {} -C {}", self.max_instr, self.max_cycle));
        if self.dump_csr {
            line.push_str(" --dump-csr-change");
        }
        if let Some(wave) = &self.wave_path {
            line.push_str(&format!(" --dump-wave-full --wave-path {}", wave.display()));
        }
        if let Some(snapshot) = &self.snapshot_file {
            line.push_str(&format!(
                " --run-snapshot --load-snapshot {}",
                snapshot.display()
            ));
        }
        if self.no_diff {
            line.push_str(" --no-diff");
        }
        if let Some(footprints) = &self.dump_footprints {
            line.push_str(&format!(" --dump-footprints {}", footprints.display()));
        }
        if self.as_footprints {
            line.push_str(" --as-footprints");
        }
        if let Some(out) = &self.output_file {
            line.push_str(&format!(" > {} 2>&1", out.display()));
        }
        line
    }
}

/// Rebuilds the emulator/fuzzer; in snapshot mode also swaps in the
/// snapshot-initialized RTL before the final `make fuzzer`.
#[derive(Debug, Clone)]
pub struct FuzzerBuild {
    pub noop_home: PathBuf,
    pub cover_type: String,
    /// `SimTop_init.sv` produced by the snapshot bootstrap hook.
    pub snapshot_top: PathBuf,
    /// Difftest flavour of `MemRWHelper.v`.
    pub difftest_mem_helper: PathBuf,
    pub make_log_file: PathBuf,
    pub jobs: usize,
}

impl FuzzerBuild {
    fn make_target(&self, target: &str) -> String {
        format!(
            "make {} REF=$(pwd)/ready-to-run/riscv64-spike-so BMCFUZZ=1 FIRRTL_COVER={} \
             EMU_TRACE=1 EMU_SNAPSHOT=1 -j{}",
            target, self.cover_type, self.jobs
        )
    }

    pub fn build(&self, run_snapshot: bool, cancel: &AtomicBool) -> Result<(), BmcfuzzError> {
        if let Some(parent) = self.make_log_file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BmcfuzzError::io(format!("creating {}", parent.display()), e))?;
        }
        let prefix = format!(
            "cd {} && source env.sh && unset VERILATOR_ROOT",
            self.noop_home.display()
        );
        let emu = format!(
            "{} && make clean && {} > {} 2>&1",
            prefix,
            self.make_target("emu"),
            self.make_log_file.display()
        );
        run_checked("make emu", None, &emu, cancel)?;
        if !run_snapshot {
            return Ok(());
        }
        install_snapshot_rtl(
            &self.snapshot_top,
            &self.difftest_mem_helper,
            &self.noop_home.join("build").join("rtl"),
        )?;
        let fuzzer = format!(
            "{} && {} >> {} 2>&1",
            prefix,
            self.make_target("fuzzer"),
            self.make_log_file.display()
        );
        run_checked("make fuzzer", None, &fuzzer, cancel)
    }
}

/// Replaces the generated `SimTop.sv` with the snapshot top (minus its
/// `assume` lines), swaps in the difftest memory helper and drops
/// `array_0_ext.v`.
pub fn install_snapshot_rtl(
    snapshot_top: &Path,
    difftest_mem_helper: &Path,
    rtl_dir: &Path,
) -> Result<(), BmcfuzzError> {
    let io_err = |what: &str, p: &Path, e| BmcfuzzError::io(format!("{} {}", what, p.display()), e);
    let text = std::fs::read_to_string(snapshot_top).map_err(|e| io_err("reading", snapshot_top, e))?;
    let kept: String = text
        .split_inclusive('\n')
        .filter(|line| !line.starts_with("assume"))
        .collect();
    let top = rtl_dir.join("SimTop.sv");
    log::info!("replace {}", top.display());
    std::fs::write(&top, kept).map_err(|e| io_err("writing", &top, e))?;

    let helper = rtl_dir.join("MemRWHelper.v");
    log::info!("replace {}", helper.display());
    std::fs::copy(difftest_mem_helper, &helper).map_err(|e| io_err("copying to", &helper, e))?;

    let ext = rtl_dir.join("array_0_ext.v");
    if ext.exists() {
        log::info!("delete {}", ext.display());
        std::fs::remove_file(&ext).map_err(|e| io_err("removing", &ext, e))?;
    }
    Ok(())
}

/// Clears and recreates `<noop_home>/tmp/fuzz_run`.
pub fn clean_fuzz_run_dir(noop_home: &Path) -> Result<PathBuf, BmcfuzzError> {
    let dir = noop_home.join("tmp").join("fuzz_run");
    if dir.exists() {
        std::fs::remove_dir_all(&dir)
            .map_err(|e| BmcfuzzError::io(format!("removing {}", dir.display()), e))?;
    }
    std::fs::create_dir_all(&dir)
        .map_err(|e| BmcfuzzError::io(format!("creating {}", dir.display()), e))?;
    Ok(dir)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzPhase {
    /// First run from the reset state; seeds the snapshot pool.
    Initial,
    /// Run inside a hybrid loop, after a formal merge.
    Hybrid,
}

#[derive(Debug, Clone, Copy)]
pub struct FuzzRequest<'a> {
    pub phase: FuzzPhase,
    pub formal_cover_rate: f64,
    pub snapshot: Option<&'a Snapshot>,
}

/// The fuzzing half of a hybrid round, as the scheduler sees it.
pub trait FuzzPass {
    /// Gets the fuzzer ready for `snapshot` (or the reset state).
    fn prepare(&mut self, _snapshot: Option<&Snapshot>, _cancel: &AtomicBool) -> Result<(), BmcfuzzError> {
        Ok(())
    }

    /// Runs the fuzzer and returns the coverage report it wrote.
    fn run(&mut self, request: &FuzzRequest<'_>, cancel: &AtomicBool) -> Result<PathBuf, BmcfuzzError>;
}

#[derive(Debug, Clone)]
pub struct ToolchainFuzzPass {
    pub noop_home: PathBuf,
    pub cover_type: String,
    /// Where the fuzzer writes `Index,Covered`.
    pub report_path: PathBuf,
    pub corpus_dir: Option<PathBuf>,
    pub init_corpus: Option<PathBuf>,
    pub fuzz_log_dir: PathBuf,
    pub build: FuzzerBuild,
    pub no_diff: bool,
    runs: usize,
}

impl ToolchainFuzzPass {
    pub fn new(
        noop_home: PathBuf,
        cover_type: String,
        report_path: PathBuf,
        fuzz_log_dir: PathBuf,
        build: FuzzerBuild,
    ) -> Self {
        ToolchainFuzzPass {
            noop_home,
            cover_type,
            report_path,
            corpus_dir: None,
            init_corpus: None,
            fuzz_log_dir,
            build,
            no_diff: false,
            runs: 0,
        }
    }

    /// Arguments for one run.
    pub fn args_for(&self, request: &FuzzRequest<'_>, output_file: PathBuf) -> FuzzArgs {
        let mut args = FuzzArgs {
            cover_type: self.cover_type.clone(),
            continue_on_errors: true,
            no_diff: self.no_diff,
            output_file: Some(output_file),
            ..FuzzArgs::default()
        };
        let wave = self.noop_home.join("tmp").join("run_wave.vcd");
        match (request.phase, request.snapshot) {
            (FuzzPhase::Initial, _) => {
                args.max_runs = 3000;
                args.max_instr = 10000;
                args.max_cycle = 10000;
                args.dump_csr = true;
                args.wave_path = Some(wave);
                args.corpus_input = self.init_corpus.clone();
            }
            (FuzzPhase::Hybrid, Some(snapshot)) => {
                args.save_errors = true;
                args.formal_cover_rate = request.formal_cover_rate;
                args.max_instr = 5000;
                args.max_cycle = 5000;
                args.dump_csr = true;
                args.wave_path = Some(wave);
                args.snapshot_file = Some(snapshot.snapshot_file.clone());
                args.corpus_input = self.corpus_dir.clone();
            }
            (FuzzPhase::Hybrid, None) => {
                args.only_fuzz = true;
                args.formal_cover_rate = request.formal_cover_rate;
                args.max_instr = 5000;
                args.max_cycle = 5000;
                args.corpus_input = self.corpus_dir.clone();
            }
        }
        args
    }
}

impl FuzzPass for ToolchainFuzzPass {
    fn prepare(&mut self, snapshot: Option<&Snapshot>, cancel: &AtomicBool) -> Result<(), BmcfuzzError> {
        self.build.build(snapshot.is_some(), cancel)
    }

    fn run(&mut self, request: &FuzzRequest<'_>, cancel: &AtomicBool) -> Result<PathBuf, BmcfuzzError> {
        std::fs::create_dir_all(&self.fuzz_log_dir).map_err(|e| {
            BmcfuzzError::io(format!("creating {}", self.fuzz_log_dir.display()), e)
        })?;
        let output_file = match request.phase {
            FuzzPhase::Initial => self.fuzz_log_dir.join("fuzz_init.log"),
            FuzzPhase::Hybrid => {
                self.runs += 1;
                self.fuzz_log_dir.join(format!("fuzz_{:04}.log", self.runs))
            }
        };
        let args = self.args_for(request, output_file);
        clean_fuzz_run_dir(&self.noop_home)?;
        let line = args.command_line(&self.noop_home);
        log::info!("fuzz command: {}", line);
        let start = std::time::Instant::now();
        let outcome = run_command(&mut shell_command(None, &line), cancel)?;
        if outcome.is_cancelled() {
            return Err(BmcfuzzError::Interrupted);
        }
        log::info!(
            "fuzz return code: {} ({:.2}s)",
            outcome.code(),
            start.elapsed().as_secs_f64()
        );
        Ok(self.report_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pass(dir: &Path) -> ToolchainFuzzPass {
        let build = FuzzerBuild {
            noop_home: dir.join("noop"),
            cover_type: "toggle".to_string(),
            snapshot_top: dir.join("SimTop_init.sv"),
            difftest_mem_helper: dir.join("MemRWHelper_difftest.v"),
            make_log_file: dir.join("logs").join("make_fuzzer.log"),
            jobs: 16,
        };
        let mut p = ToolchainFuzzPass::new(
            PathBuf::from("/noop"),
            "toggle".to_string(),
            dir.join("cover_points.csv"),
            dir.join("logs").join("fuzz"),
            build,
        );
        p.corpus_dir = Some(PathBuf::from("/corpus"));
        p.init_corpus = Some(PathBuf::from("/linear"));
        p
    }

    #[test]
    fn test_default_command_line() {
        let line = FuzzArgs::default().command_line(Path::new("/noop"));
        assert_eq!(
            line,
            "cd /noop && source env.sh && build/fuzzer -f -c firrtl.toggle -- -I 100 -C 500"
        );
    }

    #[test]
    fn test_initial_run_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let p = pass(dir.path());
        let request = FuzzRequest {
            phase: FuzzPhase::Initial,
            formal_cover_rate: -1.0,
            snapshot: None,
        };
        let line = p
            .args_for(&request, PathBuf::from("/logs/fuzz_init.log"))
            .command_line(Path::new("/noop"));
        assert_eq!(
            line,
            "cd /noop && source env.sh && build/fuzzer -f -c firrtl.toggle --max-runs 3000 \
             --corpus-input /linear --continue-on-errors -- -I 10000 -C 10000 --dump-csr-change \
             --dump-wave-full --wave-path /noop/tmp/run_wave.vcd > /logs/fuzz_init.log 2>&1"
        );
    }

    #[test]
    fn test_snapshot_run_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let p = pass(dir.path());
        let snapshot = Snapshot::locate(4, Path::new("/waves"), Path::new("/snaps"), None);
        let request = FuzzRequest {
            phase: FuzzPhase::Hybrid,
            formal_cover_rate: 0.5,
            snapshot: Some(&snapshot),
        };
        let line = p
            .args_for(&request, PathBuf::from("/logs/fuzz_0001.log"))
            .command_line(Path::new("/noop"));
        assert_eq!(
            line,
            "cd /noop && source env.sh && build/fuzzer -f -c firrtl.toggle --corpus-input /corpus \
             --continue-on-errors --save-errors --formal-cover-rate 0.5 -- -I 5000 -C 5000 \
             --dump-csr-change --dump-wave-full --wave-path /noop/tmp/run_wave.vcd \
             --run-snapshot --load-snapshot /snaps/4 > /logs/fuzz_0001.log 2>&1"
        );
    }

    #[test]
    fn test_cover_rate_omitted_when_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let p = pass(dir.path());
        let request = FuzzRequest {
            phase: FuzzPhase::Hybrid,
            formal_cover_rate: -1.0,
            snapshot: None,
        };
        let line = p
            .args_for(&request, PathBuf::from("/l"))
            .command_line(Path::new("/noop"));
        assert!(!line.contains("--formal-cover-rate"));
        assert!(line.contains("--only-fuzz"));
    }

    #[test]
    fn test_install_snapshot_rtl() {
        let dir = tempfile::tempdir().unwrap();
        let rtl = dir.path().join("rtl");
        std::fs::create_dir_all(&rtl).unwrap();
        std::fs::write(rtl.join("SimTop.sv"), "old\n").unwrap();
        std::fs::write(rtl.join("array_0_ext.v"), "x\n").unwrap();
        let top = dir.path().join("SimTop_init.sv");
        std::fs::write(&top, "module SimTop;\nassume (a);\n  assume (b);\nendmodule\n").unwrap();
        let helper = dir.path().join("MemRWHelper_difftest.v");
        std::fs::write(&helper, "module MemRWHelper; endmodule\n").unwrap();

        install_snapshot_rtl(&top, &helper, &rtl).unwrap();

        assert_eq!(
            std::fs::read_to_string(rtl.join("SimTop.sv")).unwrap(),
            "module SimTop;\n  assume (b);\nendmodule\n"
        );
        assert_eq!(
            std::fs::read_to_string(rtl.join("MemRWHelper.v")).unwrap(),
            "module MemRWHelper; endmodule\n"
        );
        assert!(!rtl.join("array_0_ext.v").exists());
    }

    #[test]
    fn test_clean_fuzz_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path().join("tmp").join("fuzz_run");
        std::fs::create_dir_all(&run).unwrap();
        std::fs::write(run.join("stale"), "x").unwrap();
        let got = clean_fuzz_run_dir(dir.path()).unwrap();
        assert_eq!(got, run);
        assert_eq!(std::fs::read_dir(&run).unwrap().count(), 0);
    }
}
