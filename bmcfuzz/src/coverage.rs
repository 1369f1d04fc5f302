// SPDX-License-Identifier: Apache-2.0

//! Covered/uncovered state over the fixed point universe.
//!
//! Invariants:
//! - `covered.len()` is fixed at construction.
//! - A covered flag never reverts to false.
//! - `formal_covered + fuzz_covered == covered_count()`.

use std::time::Duration;

use crate::bmcfuzz_error::BmcfuzzError;
use crate::PointId;

#[derive(Debug, Clone)]
pub struct CoverageLedger {
    covered: Vec<bool>,
    covered_count: usize,
    formal_covered: usize,
    fuzz_covered: usize,
    // Cumulative over every formal batch, feeds `formal_cover_rate`.
    formal_cases_found: usize,
    formal_elapsed: Duration,
}

impl CoverageLedger {
    pub fn new(total_points: usize) -> Self {
        CoverageLedger {
            covered: vec![false; total_points],
            covered_count: 0,
            formal_covered: 0,
            fuzz_covered: 0,
            formal_cases_found: 0,
            formal_elapsed: Duration::ZERO,
        }
    }

    pub fn total(&self) -> usize {
        self.covered.len()
    }

    pub fn covered(&self) -> &[bool] {
        &self.covered
    }

    pub fn is_covered(&self, point: PointId) -> bool {
        self.covered.get(point).copied().unwrap_or(false)
    }

    fn check_range(&self, point: PointId) -> Result<(), BmcfuzzError> {
        if point >= self.covered.len() {
            return Err(BmcfuzzError::PointOutOfRange {
                point,
                total: self.covered.len(),
            });
        }
        Ok(())
    }

    /// Marks points a formal job proved reachable. Returns how many were
    /// newly covered.
    ///
    /// All IDs are validated before any flag changes, so an out-of-range ID
    /// leaves the ledger untouched.
    pub fn merge_formal(&mut self, newly_covered: &[PointId]) -> Result<usize, BmcfuzzError> {
        for &point in newly_covered {
            self.check_range(point)?;
        }
        let mut added = 0;
        for &point in newly_covered {
            if !self.covered[point] {
                self.covered[point] = true;
                added += 1;
            }
        }
        self.covered_count += added;
        self.formal_covered += added;
        Ok(added)
    }

    /// Folds one formal batch into the cumulative cover-rate and returns the
    /// updated rate.
    pub fn record_formal_timing(&mut self, cases_found: usize, elapsed: Duration) -> f64 {
        self.formal_cases_found += cases_found;
        self.formal_elapsed += elapsed;
        self.formal_cover_rate()
    }

    /// Formal cases found per second of formal wall-clock time, or -1.0 when
    /// no formal time has been recorded yet. Advisory only.
    pub fn formal_cover_rate(&self) -> f64 {
        let secs = self.formal_elapsed.as_secs_f64();
        if secs <= 0.0 {
            return -1.0;
        }
        self.formal_cases_found as f64 / secs
    }

    /// Unions an externally reported coverage vector into the ledger and
    /// returns the points that flipped from uncovered to covered.
    pub fn merge_fuzz(&mut self, external: &[bool]) -> Result<Vec<PointId>, BmcfuzzError> {
        if external.len() != self.covered.len() {
            return Err(BmcfuzzError::LengthMismatch {
                expected: self.covered.len(),
                got: external.len(),
            });
        }
        let mut delta = Vec::new();
        for (point, (&theirs, ours)) in external.iter().zip(self.covered.iter_mut()).enumerate() {
            if theirs && !*ours {
                *ours = true;
                delta.push(point);
            }
        }
        self.covered_count += delta.len();
        self.fuzz_covered += delta.len();
        Ok(delta)
    }

    pub fn uncovered(&self) -> Vec<PointId> {
        self.covered
            .iter()
            .enumerate()
            .filter(|(_, &c)| !c)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn covered_count(&self) -> usize {
        self.covered_count
    }

    pub fn formal_covered(&self) -> usize {
        self.formal_covered
    }

    pub fn fuzz_covered(&self) -> usize {
        self.fuzz_covered
    }

    /// covered / total; 0.0 for an empty universe.
    pub fn rate(&self) -> f64 {
        if self.covered.is_empty() {
            return 0.0;
        }
        self.covered_count as f64 / self.covered.len() as f64
    }

    pub fn log_summary(&self) {
        log::info!(
            "coverage: covered={}/{} rate={:.2}% formal={} fuzz={} formal_cover_rate={:.4}",
            self.covered_count,
            self.total(),
            self.rate() * 100.0,
            self.formal_covered,
            self.fuzz_covered,
            self.formal_cover_rate()
        );
    }
}
