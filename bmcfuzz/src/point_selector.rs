// SPDX-License-Identifier: Apache-2.0

//! Batched, per-module round-robin selection of uncovered points.
//!
//! Each module owns a pool of points that have not been handed out since the
//! last reset. Pools only shrink between resets; `reset_uncovered` refills
//! them from the current uncovered set.

use std::collections::VecDeque;

use crate::bmcfuzz_error::BmcfuzzError;
use crate::point_table::PointTable;
use crate::{ModuleId, PointId};

#[derive(Debug, Clone)]
pub struct PointSelector {
    point_to_module: Vec<ModuleId>,
    pools: Vec<VecDeque<PointId>>,
    max_point_num: usize,
    // Module the next pass starts from.
    cursor: usize,
    last_batch: Vec<PointId>,
}

impl PointSelector {
    /// Module IDs in `point_to_module` beyond `module_count` grow the pool
    /// vector rather than being dropped.
    pub fn new(module_count: usize, point_to_module: Vec<ModuleId>, max_point_num: usize) -> Self {
        let pool_count = point_to_module
            .iter()
            .map(|&m| m + 1)
            .max()
            .unwrap_or(0)
            .max(module_count);
        let mut selector = PointSelector {
            point_to_module,
            pools: vec![VecDeque::new(); pool_count],
            max_point_num,
            cursor: 0,
            last_batch: Vec::new(),
        };
        selector.refill(|_| true);
        selector
    }

    pub fn from_table(table: &PointTable, max_point_num: usize) -> Self {
        PointSelector::new(table.module_count(), table.point_to_module(), max_point_num)
    }

    pub fn total(&self) -> usize {
        self.point_to_module.len()
    }

    pub fn max_point_num(&self) -> usize {
        self.max_point_num
    }

    pub fn set_max_point_num(&mut self, max_point_num: usize) {
        self.max_point_num = max_point_num;
    }

    /// True when a single batch may hold every point.
    pub fn selects_all(&self) -> bool {
        self.max_point_num >= self.point_to_module.len()
    }

    fn check_len(&self, covered: &[bool]) -> Result<(), BmcfuzzError> {
        if covered.len() != self.point_to_module.len() {
            return Err(BmcfuzzError::LengthMismatch {
                expected: self.point_to_module.len(),
                got: covered.len(),
            });
        }
        Ok(())
    }

    fn refill(&mut self, admit: impl Fn(PointId) -> bool) {
        for pool in self.pools.iter_mut() {
            pool.clear();
        }
        for (point, &module) in self.point_to_module.iter().enumerate() {
            if admit(point) {
                self.pools[module].push_back(point);
            }
        }
        self.cursor = 0;
    }

    /// Rebuilds every pool from the points that are still uncovered.
    pub fn reset_uncovered(&mut self, covered: &[bool]) -> Result<(), BmcfuzzError> {
        self.check_len(covered)?;
        self.refill(|p| !covered[p]);
        self.last_batch.clear();
        log::debug!(
            "selector: reset, {} points admitted",
            self.pools.iter().map(VecDeque::len).sum::<usize>()
        );
        Ok(())
    }

    /// Drops newly covered points from the pools without re-admitting
    /// anything.
    pub fn update(&mut self, covered: &[bool]) -> Result<(), BmcfuzzError> {
        self.check_len(covered)?;
        for pool in self.pools.iter_mut() {
            pool.retain(|&p| !covered[p]);
        }
        Ok(())
    }

    /// Returns up to `max_point_num` uncovered points, one per module per
    /// pass. An empty batch means every pool is exhausted.
    pub fn select_batch(&mut self, covered: &[bool]) -> Result<Vec<PointId>, BmcfuzzError> {
        self.check_len(covered)?;
        let batch = if self.selects_all() {
            // Everything still pooled, then the pools are spent until the
            // next reset.
            let mut all: Vec<PointId> = self
                .pools
                .iter_mut()
                .flat_map(|pool| pool.drain(..))
                .filter(|&p| !covered[p])
                .collect();
            all.sort_unstable();
            all
        } else {
            self.select_round_robin(covered)
        };
        log::debug!("selector: selected {} points", batch.len());
        self.last_batch = batch.clone();
        Ok(batch)
    }

    fn select_round_robin(&mut self, covered: &[bool]) -> Vec<PointId> {
        let module_count = self.pools.len();
        let mut batch = Vec::new();
        if module_count == 0 {
            return batch;
        }
        let mut last_module = None;
        while batch.len() < self.max_point_num {
            let mut progressed = false;
            for step in 0..module_count {
                if batch.len() >= self.max_point_num {
                    break;
                }
                let module = (self.cursor + step) % module_count;
                let pool = &mut self.pools[module];
                while let Some(point) = pool.pop_front() {
                    if !covered[point] {
                        batch.push(point);
                        progressed = true;
                        last_module = Some(module);
                        break;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        if let Some(module) = last_module {
            self.cursor = (module + 1) % module_count;
        }
        batch
    }

    /// Points still waiting in the pools, in ID order.
    pub fn unselected_remainder(&self) -> Vec<PointId> {
        let mut rest: Vec<PointId> = self.pools.iter().flatten().copied().collect();
        rest.sort_unstable();
        rest
    }

    pub fn last_batch(&self) -> &[PointId] {
        &self.last_batch
    }
}
