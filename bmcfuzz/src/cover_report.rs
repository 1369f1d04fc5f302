// SPDX-License-Identifier: Apache-2.0

//! Two-column `Index,Covered` coverage report shared with the fuzzer.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bmcfuzz_error::BmcfuzzError;

#[derive(Debug, Serialize, Deserialize)]
struct CoverRow {
    #[serde(rename = "Index")]
    index: usize,
    #[serde(rename = "Covered")]
    covered: u64,
}

fn csv_error(path: &Path, e: csv::Error) -> BmcfuzzError {
    match e.into_kind() {
        csv::ErrorKind::Io(io) => {
            BmcfuzzError::io(format!("cover report {}", path.display()), io)
        }
        other => BmcfuzzError::Parse(format!("cover report {}: {:?}", path.display(), other)),
    }
}

pub fn write_cover_report(path: &Path, covered: &[bool]) -> Result<(), BmcfuzzError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BmcfuzzError::io(format!("creating {}", parent.display()), e)
            })?;
        }
    }
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    for (index, &c) in covered.iter().enumerate() {
        writer
            .serialize(CoverRow {
                index,
                covered: c as u64,
            })
            .map_err(|e| csv_error(path, e))?;
    }
    writer
        .flush()
        .map_err(|e| BmcfuzzError::io(format!("flushing {}", path.display()), e))?;
    log::debug!(
        "cover report: wrote {} rows to {}",
        covered.len(),
        path.display()
    );
    Ok(())
}

/// Writes a report with every point uncovered.
pub fn write_empty_cover_report(path: &Path, total_points: usize) -> Result<(), BmcfuzzError> {
    write_cover_report(path, &vec![false; total_points])
}

/// Reads a report into a vector of `total_points` flags.
///
/// Rows may come in any order and missing rows read as uncovered. Any
/// `Covered` value above zero counts as covered.
pub fn read_cover_report(path: &Path, total_points: usize) -> Result<Vec<bool>, BmcfuzzError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| csv_error(path, e))?;
    let mut covered = vec![false; total_points];
    for row in reader.deserialize::<CoverRow>() {
        let row = row.map_err(|e| csv_error(path, e))?;
        if row.index >= total_points {
            return Err(BmcfuzzError::PointOutOfRange {
                point: row.index,
                total: total_points,
            });
        }
        if row.covered > 0 {
            covered[row.index] = true;
        }
    }
    Ok(covered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_report_has_header_and_zero_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover_points.csv");
        write_empty_cover_report(&path, 3).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Index,Covered\n0,0\n1,0\n2,0\n");
    }

    #[test]
    fn test_read_accepts_unordered_rows_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover_points.csv");
        std::fs::write(&path, "Index,Covered\n3, 7\n0,1\n2,0\n").unwrap();
        let covered = read_cover_report(&path, 5).unwrap();
        assert_eq!(covered, vec![true, false, false, true, false]);
    }

    #[test]
    fn test_write_then_read_preserves_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cover_points.csv");
        let flags = vec![true, false, true];
        write_cover_report(&path, &flags).unwrap();
        assert_eq!(read_cover_report(&path, 3).unwrap(), flags);
    }

    #[test]
    fn test_read_rejects_index_outside_universe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover_points.csv");
        std::fs::write(&path, "Index,Covered\n0,1\n4,1\n").unwrap();
        let err = read_cover_report(&path, 4).unwrap_err();
        assert!(matches!(
            err,
            BmcfuzzError::PointOutOfRange { point: 4, total: 4 }
        ));
    }

    #[test]
    fn test_read_rejects_garbage_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover_points.csv");
        std::fs::write(&path, "Index,Covered\nzero,1\n").unwrap();
        let err = read_cover_report(&path, 4).unwrap_err();
        assert!(matches!(err, BmcfuzzError::Parse(_)), "{}", err);
    }

    #[test]
    fn test_read_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_cover_report(&dir.path().join("absent.csv"), 1).unwrap_err();
        assert!(matches!(err, BmcfuzzError::Io { .. }), "{}", err);
    }
}
