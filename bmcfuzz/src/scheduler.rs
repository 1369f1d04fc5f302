// SPDX-License-Identifier: Apache-2.0

//! The hybrid formal/fuzz loop over one snapshot context.
//!
//! A single control thread drives
//! `Select -> Dispatch -> (zero covered? Select : Merge) -> Fuzz -> MergeFuzz -> Select`
//! until the selector runs dry. The scheduler owns the ledger, the selector
//! and both halves of the loop; nothing is shared implicitly.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::artifact::ToolchainArtifactConverter;
use crate::bmcfuzz_error::BmcfuzzError;
use crate::cover_report::{read_cover_report, write_cover_report};
use crate::coverage::CoverageLedger;
use crate::executor::{BatchResult, Executor};
use crate::fuzzer::{FuzzPass, FuzzPhase, FuzzRequest};
use crate::job_descriptor::{clean_job_workspace, JobDescriptorWriter};
use crate::point_selector::PointSelector;
use crate::point_table::PointTable;
use crate::points_log::PointsLog;
use crate::process::run_checked;
use crate::snapshot::Snapshot;
use crate::PointId;

/// The formal half of a round, as the scheduler sees it.
pub trait FormalBatchRunner {
    /// Prepares and dispatches one job per point and joins them.
    fn dispatch(&mut self, points: &[PointId], cancel: &AtomicBool)
        -> Result<BatchResult, BmcfuzzError>;

    /// Switches artifact conversion and RTL preparation to `snapshot`.
    fn set_snapshot(&mut self, _snapshot: Option<&Snapshot>) {}
}

/// Descriptors, workspace cleanup and the parallel executor.
pub struct ToolchainFormalRunner {
    writer: JobDescriptorWriter,
    executor: Executor,
    converter: ToolchainArtifactConverter,
    rtl_prepare_command: Option<String>,
    snapshot_active: bool,
}

impl ToolchainFormalRunner {
    pub fn new(
        writer: JobDescriptorWriter,
        executor: Executor,
        converter: ToolchainArtifactConverter,
    ) -> Self {
        ToolchainFormalRunner {
            writer,
            executor,
            converter,
            rtl_prepare_command: None,
            snapshot_active: false,
        }
    }

    /// Hook that regenerates the instrumented RTL before each dispatch while
    /// a snapshot is active.
    pub fn with_rtl_prepare(mut self, command: Option<String>) -> Self {
        self.rtl_prepare_command = command;
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

impl FormalBatchRunner for ToolchainFormalRunner {
    fn dispatch(
        &mut self,
        points: &[PointId],
        cancel: &AtomicBool,
    ) -> Result<BatchResult, BmcfuzzError> {
        if self.snapshot_active {
            if let Some(line) = &self.rtl_prepare_command {
                run_checked("rtl prepare", None, line, cancel)?;
            }
        }
        clean_job_workspace(self.writer.cover_tasks_dir())?;
        self.writer.write(points)?;
        self.executor.run_batch(points)
    }

    fn set_snapshot(&mut self, snapshot: Option<&Snapshot>) {
        self.snapshot_active = snapshot.is_some();
        let mut converter = self.converter.clone();
        converter.snapshot_file = snapshot.map(|s| s.snapshot_file.clone());
        self.executor.set_converter(Arc::new(converter));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Select,
    Dispatch,
    Merge,
    Fuzz,
    MergeFuzz,
    Terminated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub rounds: usize,
    pub formal_batches: usize,
    pub zero_progress_retries: usize,
    pub fuzz_merges: usize,
}

pub struct HybridScheduler<R: FormalBatchRunner, F: FuzzPass> {
    table: PointTable,
    ledger: CoverageLedger,
    selector: PointSelector,
    runner: R,
    fuzz: F,
    points_log: PointsLog,
    cover_report: PathBuf,
    max_zero_progress_retries: Option<usize>,
    snapshot: Option<Snapshot>,
    phase: Phase,
    stats: SchedulerStats,
    cancel: Arc<AtomicBool>,
}

impl<R: FormalBatchRunner, F: FuzzPass> HybridScheduler<R, F> {
    pub fn new(
        table: PointTable,
        max_point_num: usize,
        runner: R,
        fuzz: F,
        points_log: PointsLog,
        cover_report: PathBuf,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let ledger = CoverageLedger::new(table.len());
        let selector = PointSelector::from_table(&table, max_point_num);
        HybridScheduler {
            table,
            ledger,
            selector,
            runner,
            fuzz,
            points_log,
            cover_report,
            max_zero_progress_retries: None,
            snapshot: None,
            phase: Phase::Select,
            stats: SchedulerStats::default(),
            cancel,
        }
    }

    pub fn with_max_zero_progress_retries(mut self, retries: Option<usize>) -> Self {
        self.max_zero_progress_retries = retries;
        self
    }

    pub fn table(&self) -> &PointTable {
        &self.table
    }

    pub fn ledger(&self) -> &CoverageLedger {
        &self.ledger
    }

    pub fn selector(&self) -> &PointSelector {
        &self.selector
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn fuzz_pass_mut(&mut self) -> &mut F {
        &mut self.fuzz
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn cover_report_path(&self) -> &Path {
        &self.cover_report
    }

    fn enter(&mut self, phase: Phase) {
        log::debug!("scheduler: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn check_cancel(&self) -> Result<(), BmcfuzzError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(BmcfuzzError::Interrupted);
        }
        Ok(())
    }

    pub fn set_snapshot(&mut self, snapshot: Option<Snapshot>) {
        self.snapshot = snapshot;
        self.runner.set_snapshot(self.snapshot.as_ref());
    }

    /// Re-admits every uncovered point; used when the seed context changes.
    pub fn reset_context(&mut self) -> Result<(), BmcfuzzError> {
        self.selector.reset_uncovered(self.ledger.covered())?;
        self.phase = Phase::Select;
        Ok(())
    }

    fn merge_formal_batch(&mut self, result: &BatchResult) -> Result<(), BmcfuzzError> {
        let newly = self.ledger.merge_formal(&result.covered)?;
        let rate = self
            .ledger
            .record_formal_timing(result.covered.len(), result.elapsed);
        write_cover_report(&self.cover_report, self.ledger.covered())?;
        log::info!(
            "formal: {} cases, {} newly covered, cover rate {:.4}",
            result.covered.len(),
            newly,
            rate
        );
        Ok(())
    }

    /// Selects and dispatches until a batch covers something.
    ///
    /// Returns the covered points, or `None` once the selector is exhausted
    /// (or the zero-progress retry bound is hit).
    pub fn run_formal(&mut self) -> Result<Option<Vec<PointId>>, BmcfuzzError> {
        let mut retries = 0usize;
        loop {
            self.check_cancel()?;
            self.enter(Phase::Select);
            let batch = self.selector.select_batch(self.ledger.covered())?;
            self.points_log.write_selection(
                &batch,
                &self.selector.unselected_remainder(),
                &self.table,
            )?;
            if batch.is_empty() {
                log::info!("scheduler: no uncovered points left to select");
                return Ok(None);
            }
            log::info!("scheduler: selected {} points", batch.len());

            self.enter(Phase::Dispatch);
            let result = self.runner.dispatch(&batch, &self.cancel)?;
            self.stats.formal_batches += 1;
            if !result.covered.is_empty() {
                self.enter(Phase::Merge);
                self.merge_formal_batch(&result)?;
                return Ok(Some(result.covered));
            }
            self.ledger.record_formal_timing(0, result.elapsed);
            retries += 1;
            self.stats.zero_progress_retries += 1;
            if let Some(max) = self.max_zero_progress_retries {
                if retries > max {
                    log::warn!(
                        "scheduler: {} batches in a row covered nothing; ending pass",
                        retries
                    );
                    return Ok(None);
                }
            }
            log::info!("scheduler: no case found, reselecting (retry {})", retries);
        }
    }

    /// Runs the fuzzer and folds its report into the ledger. Returns the
    /// points the report newly covered.
    pub fn fuzz_and_merge(
        &mut self,
        phase: FuzzPhase,
        formal_claimed: &[PointId],
    ) -> Result<Vec<PointId>, BmcfuzzError> {
        self.enter(Phase::Fuzz);
        let request = FuzzRequest {
            phase,
            formal_cover_rate: self.ledger.formal_cover_rate(),
            snapshot: self.snapshot.as_ref(),
        };
        let report = self.fuzz.run(&request, &self.cancel)?;
        self.enter(Phase::MergeFuzz);
        self.merge_fuzz_report(&report, formal_claimed)
    }

    /// Reads a fuzzer coverage report and merges it.
    pub fn merge_fuzz_report(
        &mut self,
        report: &Path,
        formal_claimed: &[PointId],
    ) -> Result<Vec<PointId>, BmcfuzzError> {
        let external = if report.exists() {
            read_cover_report(report, self.table.len())?
        } else {
            log::warn!(
                "fuzz: no coverage report at {}; nothing to merge",
                report.display()
            );
            self.ledger.covered().to_vec()
        };
        for &p in formal_claimed {
            if !external.get(p).copied().unwrap_or(false) {
                log::info!(
                    "fuzz: formal point {}:{} not confirmed by fuzz report",
                    p,
                    self.table.display_name(p)
                );
            }
        }
        let delta = self.ledger.merge_fuzz(&external)?;
        self.selector.update(self.ledger.covered())?;
        self.stats.fuzz_merges += 1;
        self.points_log
            .write_fuzz_delta(self.stats.fuzz_merges, &delta, &self.table)?;
        self.points_log
            .write_uncovered(&self.ledger.uncovered(), &self.table)?;
        log::info!("fuzz: {} points newly covered", delta.len());
        self.ledger.log_summary();
        Ok(delta)
    }

    /// One full hybrid pass over the current context.
    pub fn run_hybrid_loop(&mut self) -> Result<(), BmcfuzzError> {
        self.run_hybrid_loop_with(|| Ok(()))
    }

    /// Like [`run_hybrid_loop`](Self::run_hybrid_loop), calling `after_fuzz`
    /// once after every fuzz pass.
    pub fn run_hybrid_loop_with<H>(&mut self, mut after_fuzz: H) -> Result<(), BmcfuzzError>
    where
        H: FnMut() -> Result<(), BmcfuzzError>,
    {
        loop {
            self.check_cancel()?;
            let Some(found) = self.run_formal()? else {
                break;
            };
            self.stats.rounds += 1;
            self.fuzz_and_merge(FuzzPhase::Hybrid, &found)?;
            after_fuzz()?;
        }
        self.enter(Phase::Terminated);
        self.points_log
            .write_uncovered(&self.ledger.uncovered(), &self.table)?;
        self.ledger.log_summary();
        Ok(())
    }

    /// Dispatches every uncovered point once, merges, and stops. No fuzzing.
    pub fn run_formal_sweep(&mut self) -> Result<Vec<PointId>, BmcfuzzError> {
        self.selector.reset_uncovered(self.ledger.covered())?;
        let saved = self.selector.max_point_num();
        self.selector.set_max_point_num(self.table.len());
        let result = self.sweep_once();
        self.selector.set_max_point_num(saved);
        result
    }

    fn sweep_once(&mut self) -> Result<Vec<PointId>, BmcfuzzError> {
        self.enter(Phase::Select);
        let batch = self.selector.select_batch(self.ledger.covered())?;
        self.points_log
            .write_selection(&batch, &self.selector.unselected_remainder(), &self.table)?;
        let mut covered = Vec::new();
        if !batch.is_empty() {
            self.enter(Phase::Dispatch);
            let result = self.runner.dispatch(&batch, &self.cancel)?;
            self.stats.formal_batches += 1;
            self.enter(Phase::Merge);
            self.merge_formal_batch(&result)?;
            covered = result.covered;
        }
        self.enter(Phase::Terminated);
        self.points_log
            .write_uncovered(&self.ledger.uncovered(), &self.table)?;
        self.ledger.log_summary();
        Ok(covered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeRunner {
        // Covered points per dispatch, intersected with the batch.
        answers: VecDeque<Vec<PointId>>,
        dispatched: Vec<Vec<PointId>>,
    }

    impl FormalBatchRunner for FakeRunner {
        fn dispatch(
            &mut self,
            points: &[PointId],
            _cancel: &AtomicBool,
        ) -> Result<BatchResult, BmcfuzzError> {
            self.dispatched.push(points.to_vec());
            let answer = self.answers.pop_front().unwrap_or_default();
            let covered = answer.into_iter().filter(|p| points.contains(p)).collect();
            Ok(BatchResult {
                covered,
                outcomes: Vec::new(),
                elapsed: Duration::from_millis(10),
            })
        }
    }

    struct FakeFuzz {
        report: PathBuf,
        // Report contents per run; the last one repeats.
        reports: VecDeque<Vec<bool>>,
        requests: Vec<(FuzzPhase, f64)>,
    }

    impl FuzzPass for FakeFuzz {
        fn run(
            &mut self,
            request: &FuzzRequest<'_>,
            _cancel: &AtomicBool,
        ) -> Result<PathBuf, BmcfuzzError> {
            self.requests
                .push((request.phase, request.formal_cover_rate));
            let vector = if self.reports.len() > 1 {
                self.reports.pop_front().unwrap()
            } else {
                self.reports.front().cloned().unwrap()
            };
            write_cover_report(&self.report, &vector)?;
            Ok(self.report.clone())
        }
    }

    fn scheduler(
        dir: &Path,
        pairs: &[(&str, &str)],
        cap: usize,
        answers: Vec<Vec<PointId>>,
        reports: Vec<Vec<bool>>,
    ) -> HybridScheduler<FakeRunner, FakeFuzz> {
        let table = PointTable::from_pairs(pairs.iter().copied());
        let fuzz = FakeFuzz {
            report: dir.join("fuzz_report.csv"),
            reports: reports.into(),
            requests: Vec::new(),
        };
        HybridScheduler::new(
            table,
            cap,
            FakeRunner {
                answers: answers.into(),
                dispatched: Vec::new(),
            },
            fuzz,
            PointsLog::new(dir.join("logs")),
            dir.join("cover_points.csv"),
            Arc::new(AtomicBool::new(false)),
        )
    }

    const SIX: [(&str, &str); 6] = [
        ("A", "a0"),
        ("A", "a1"),
        ("B", "b0"),
        ("B", "b1"),
        ("C", "c0"),
        ("C", "c1"),
    ];

    #[test]
    fn test_all_covered_terminates_without_dispatch() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path(), &SIX, 3, vec![], vec![vec![true; 6]]);
        s.fuzz_and_merge(FuzzPhase::Initial, &[]).unwrap();
        s.reset_context().unwrap();
        s.run_hybrid_loop().unwrap();
        assert!(s.runner().dispatched.is_empty());
        assert_eq!(s.phase(), Phase::Terminated);
        assert_eq!(s.ledger().covered_count(), 6);
    }

    #[test]
    fn test_hybrid_loop_merges_formal_then_fuzz() {
        let dir = tempfile::tempdir().unwrap();
        // Round 1 covers 0 formally; fuzz adds 3. Later batches cover nothing.
        let mut s = scheduler(
            dir.path(),
            &SIX,
            3,
            vec![vec![0]],
            vec![vec![true, false, false, true, false, false]],
        );
        s.run_hybrid_loop().unwrap();

        let dispatched = &s.runner().dispatched;
        assert_eq!(dispatched[0], vec![0, 2, 4]);
        // Point 3 was covered by fuzzing before the second selection.
        assert_eq!(dispatched[1], vec![1, 5]);
        assert_eq!(dispatched.len(), 2);
        assert_eq!(s.ledger().formal_covered(), 1);
        assert_eq!(s.ledger().fuzz_covered(), 1);
        assert_eq!(s.ledger().uncovered(), vec![1, 2, 4, 5]);
        assert_eq!(s.stats().rounds, 1);
        assert_eq!(s.stats().zero_progress_retries, 1);

        let fuzz = &s.fuzz.requests;
        assert_eq!(fuzz.len(), 1);
        assert_eq!(fuzz[0].0, FuzzPhase::Hybrid);
        assert!(fuzz[0].1 > 0.0);

        let uncovered =
            std::fs::read_to_string(dir.path().join("logs").join("uncovered_points.log")).unwrap();
        assert!(uncovered.starts_with("Uncovered points: 4\n"), "{}", uncovered);
        assert!(dir
            .path()
            .join("logs")
            .join("covered_points_0001.log")
            .exists());
    }

    #[test]
    fn test_formal_merge_written_before_fuzz() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path(), &SIX, 6, vec![vec![2, 4]], vec![vec![false; 6]]);
        let found = s.run_formal().unwrap();
        assert_eq!(found, Some(vec![2, 4]));
        let report = read_cover_report(&dir.path().join("cover_points.csv"), 6).unwrap();
        assert_eq!(report, vec![false, false, true, false, true, false]);
        assert_eq!(s.phase(), Phase::Merge);
    }

    #[test]
    fn test_zero_progress_reselects_next_slice() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(
            dir.path(),
            &SIX,
            3,
            vec![vec![], vec![5]],
            vec![vec![false; 6]],
        );
        let found = s.run_formal().unwrap();
        assert_eq!(found, Some(vec![5]));
        assert_eq!(
            s.runner().dispatched,
            vec![vec![0, 2, 4], vec![1, 3, 5]]
        );
    }

    #[test]
    fn test_zero_progress_exhausts_selector() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path(), &SIX, 2, vec![], vec![vec![false; 6]]);
        assert_eq!(s.run_formal().unwrap(), None);
        let mut seen: Vec<PointId> = s.runner().dispatched.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_select_all_zero_progress_ends_pass() {
        let dir = tempfile::tempdir().unwrap();
        let pairs = [("A", "a0"), ("B", "b0"), ("C", "c0")];
        let mut s = scheduler(dir.path(), &pairs, 3, vec![], vec![vec![false; 3]]);
        assert!(s.selector().selects_all());
        assert_eq!(s.run_formal().unwrap(), None);
        assert_eq!(s.runner().dispatched, vec![vec![0, 1, 2]]);
        assert_eq!(s.stats().zero_progress_retries, 1);
    }

    #[test]
    fn test_select_all_hybrid_loop_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let pairs = [("A", "a0"), ("B", "b0"), ("C", "c0")];
        // One formal hit, then nothing; the loop must still end.
        let mut s = scheduler(
            dir.path(),
            &pairs,
            3,
            vec![vec![1]],
            vec![vec![false; 3]],
        );
        s.run_hybrid_loop().unwrap();
        assert_eq!(s.runner().dispatched, vec![vec![0, 1, 2]]);
        assert_eq!(s.phase(), Phase::Terminated);
    }

    #[test]
    fn test_hybrid_loop_hook_runs_after_each_fuzz_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(
            dir.path(),
            &SIX,
            1,
            vec![vec![0], vec![2], vec![]],
            vec![vec![false; 6]],
        )
        .with_max_zero_progress_retries(Some(0));
        let mut calls = 0usize;
        s.run_hybrid_loop_with(|| {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(s.fuzz.requests.len(), 2);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_zero_progress_retry_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path(), &SIX, 1, vec![], vec![vec![false; 6]])
            .with_max_zero_progress_retries(Some(2));
        assert_eq!(s.run_formal().unwrap(), None);
        assert_eq!(s.runner().dispatched.len(), 3);
    }

    #[test]
    fn test_missing_fuzz_report_merges_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path(), &SIX, 3, vec![], vec![vec![false; 6]]);
        let delta = s
            .merge_fuzz_report(&dir.path().join("absent.csv"), &[])
            .unwrap();
        assert!(delta.is_empty());
        assert_eq!(s.ledger().covered_count(), 0);
    }

    #[test]
    fn test_out_of_range_report_aborts_round() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("bad.csv");
        std::fs::write(&report, "Index,Covered\n9,1\n").unwrap();
        let mut s = scheduler(dir.path(), &SIX, 3, vec![], vec![vec![false; 6]]);
        let err = s.merge_fuzz_report(&report, &[]).unwrap_err();
        assert!(matches!(err, BmcfuzzError::PointOutOfRange { point: 9, total: 6 }));
    }

    #[test]
    fn test_formal_sweep_dispatches_everything_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path(), &SIX, 2, vec![vec![1, 3]], vec![vec![false; 6]]);
        let covered = s.run_formal_sweep().unwrap();
        assert_eq!(covered, vec![1, 3]);
        assert_eq!(s.runner().dispatched, vec![vec![0, 1, 2, 3, 4, 5]]);
        assert_eq!(s.selector().max_point_num(), 2);
        assert!(s.fuzz.requests.is_empty());
    }

    #[test]
    fn test_formal_sweep_after_spent_selector() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path(), &SIX, 6, vec![vec![], vec![4]], vec![vec![false; 6]]);
        assert_eq!(s.run_formal().unwrap(), None);
        let covered = s.run_formal_sweep().unwrap();
        assert_eq!(covered, vec![4]);
        assert_eq!(s.runner().dispatched.len(), 2);
        assert_eq!(s.runner().dispatched[1], vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_cancel_interrupts_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path(), &SIX, 3, vec![], vec![vec![false; 6]]);
        s.cancel.store(true, Ordering::Relaxed);
        assert!(s.run_hybrid_loop().unwrap_err().is_interrupted());
    }
}
