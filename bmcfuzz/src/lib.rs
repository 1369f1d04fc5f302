// SPDX-License-Identifier: Apache-2.0

//! Hybrid formal + fuzzing coverage closure for CPU RTL designs.
//!
//! The core is the coverage ledger, the per-module round-robin point
//! selector, the parallel formal job executor and the hybrid scheduler that
//! alternates formal batches with fuzz passes. Everything else here is file
//! formats and process plumbing for the external tools.

pub mod artifact;
pub mod bmcfuzz_error;
pub mod campaign;
pub mod config;
pub mod cover_report;
pub mod coverage;
pub mod executor;
pub mod fuzzer;
pub mod job_descriptor;
pub mod job_log;
pub mod memory_image;
pub mod point_selector;
pub mod point_table;
pub mod points_log;
pub mod process;
pub mod scheduler;
pub mod snapshot;
pub mod solver_mode;
pub mod vcd_trace;

/// Index into the point universe, assigned in point-table order.
pub type PointId = usize;

/// Index of a module, assigned in first-seen order.
pub type ModuleId = usize;

pub use bmcfuzz_error::BmcfuzzError;
