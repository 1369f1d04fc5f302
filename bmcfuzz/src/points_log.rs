// SPDX-License-Identifier: Apache-2.0

//! Plain-text point dumps for post-hoc inspection.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::bmcfuzz_error::BmcfuzzError;
use crate::point_table::PointTable;
use crate::PointId;

pub const UNCOVERED_POINTS_FILE: &str = "uncovered_points.log";
pub const SELECTED_POINTS_FILE: &str = "selected_points.log";
pub const UNSELECTED_POINTS_FILE: &str = "unselected_points.log";

/// Renders `<header>: <n>` followed by one `id:module.signal` line per point
/// and a trailing blank line.
pub fn render_points(header: &str, points: &[PointId], table: &PointTable) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}: {}", header, points.len());
    for &p in points {
        let _ = writeln!(out, "{}:{}", p, table.display_name(p));
    }
    out.push('\n');
    out
}

#[derive(Debug, Clone)]
pub struct PointsLog {
    dir: PathBuf,
}

impl PointsLog {
    pub fn new(dir: PathBuf) -> Self {
        PointsLog { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, file: &str, text: &str) -> Result<PathBuf, BmcfuzzError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| BmcfuzzError::io(format!("creating {}", self.dir.display()), e))?;
        let path = self.dir.join(file);
        std::fs::write(&path, text)
            .map_err(|e| BmcfuzzError::io(format!("writing {}", path.display()), e))?;
        Ok(path)
    }

    pub fn write_uncovered(
        &self,
        points: &[PointId],
        table: &PointTable,
    ) -> Result<PathBuf, BmcfuzzError> {
        self.write(
            UNCOVERED_POINTS_FILE,
            &render_points("Uncovered points", points, table),
        )
    }

    /// Rewrites the selected and unselected dumps after a selection.
    pub fn write_selection(
        &self,
        selected: &[PointId],
        unselected: &[PointId],
        table: &PointTable,
    ) -> Result<(), BmcfuzzError> {
        self.write(
            SELECTED_POINTS_FILE,
            &render_points("Selected points", selected, table),
        )?;
        self.write(
            UNSELECTED_POINTS_FILE,
            &render_points("Unselected points", unselected, table),
        )?;
        Ok(())
    }

    /// `covered_points_<round>.log` with the points one fuzz merge added.
    pub fn write_fuzz_delta(
        &self,
        round: usize,
        delta: &[PointId],
        table: &PointTable,
    ) -> Result<PathBuf, BmcfuzzError> {
        self.write(
            &format!("covered_points_{:04}.log", round),
            &render_points("Fuzz covered points", delta, table),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table() -> PointTable {
        PointTable::from_pairs(vec![("Alu", "a"), ("Alu", "b"), ("Lsu", "c.d")])
    }

    #[test]
    fn test_render_points() {
        let text = render_points("Uncovered points", &[0, 2], &table());
        assert_eq!(text, "Uncovered points: 2\n0:Alu.a\n2:Lsu.c.d\n\n");
    }

    #[test]
    fn test_write_selection_and_delta() {
        let dir = tempfile::tempdir().unwrap();
        let log = PointsLog::new(dir.path().join("logs"));
        let t = table();
        log.write_selection(&[1], &[0, 2], &t).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("logs").join(SELECTED_POINTS_FILE)).unwrap(),
            "Selected points: 1\n1:Alu.b\n\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("logs").join(UNSELECTED_POINTS_FILE))
                .unwrap(),
            "Unselected points: 2\n0:Alu.a\n2:Lsu.c.d\n\n"
        );
        let path = log.write_fuzz_delta(3, &[], &t).unwrap();
        assert!(path.ends_with("covered_points_0003.log"));
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "Fuzz covered points: 0\n\n"
        );
    }
}
