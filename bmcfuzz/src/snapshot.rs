// SPDX-License-Identifier: Apache-2.0

//! CPU-state snapshots and the score source that ranks them.
//!
//! Snapshot contents are opaque here: a snapshot is an ID, the waveform it
//! was cut from, and the state file the fuzzer and converter load.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use crate::bmcfuzz_error::BmcfuzzError;
use crate::process::{run_checked, run_command_capturing, shell_command};

pub type SnapshotId = u32;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub wave_path: PathBuf,
    pub snapshot_file: PathBuf,
    pub score: Option<f64>,
}

impl Snapshot {
    /// `<wave_dir>/<id>.vcd` and `<snapshot_dir>/<id>`.
    pub fn locate(id: SnapshotId, wave_dir: &Path, snapshot_dir: &Path, score: Option<f64>) -> Self {
        Snapshot {
            id,
            wave_path: wave_dir.join(format!("{}.vcd", id)),
            snapshot_file: snapshot_dir.join(id.to_string()),
            score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedSnapshot {
    pub id: SnapshotId,
    pub score: Option<f64>,
}

/// Hands out snapshot candidates, best first. `None` ends the snapshot loop.
pub trait SnapshotSource {
    fn next_best(&mut self, cancel: &AtomicBool) -> Result<Option<RankedSnapshot>, BmcfuzzError>;

    /// Refreshes scores after a fuzz pass produced new transitions.
    fn update(&mut self, _cancel: &AtomicBool) -> Result<(), BmcfuzzError> {
        Ok(())
    }
}

/// In-memory ranking; each snapshot is handed out once.
#[derive(Debug, Clone, Default)]
pub struct RankedSnapshots {
    // Sorted so the best candidate is last.
    pending: Vec<(SnapshotId, f64)>,
}

impl RankedSnapshots {
    pub fn new(scores: impl IntoIterator<Item = (SnapshotId, f64)>) -> Self {
        let mut pending: Vec<(SnapshotId, f64)> = scores.into_iter().collect();
        // Ascending score, ties broken so the lower ID pops first.
        pending.sort_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));
        RankedSnapshots { pending }
    }

    /// Parses `id score` lines; blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self, BmcfuzzError> {
        let mut scores = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(id), Some(score), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(BmcfuzzError::Parse(format!(
                    "snapshot scores line {}: expected `id score`, got {:?}",
                    lineno + 1,
                    line
                )));
            };
            let id: SnapshotId = id.parse().map_err(|e| {
                BmcfuzzError::Parse(format!("snapshot scores line {}: id: {}", lineno + 1, e))
            })?;
            let score: f64 = score.parse().map_err(|e| {
                BmcfuzzError::Parse(format!("snapshot scores line {}: score: {}", lineno + 1, e))
            })?;
            scores.push((id, score));
        }
        Ok(RankedSnapshots::new(scores))
    }

    pub fn from_file(path: &Path) -> Result<Self, BmcfuzzError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BmcfuzzError::io(format!("reading {}", path.display()), e))?;
        RankedSnapshots::parse(&text)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl SnapshotSource for RankedSnapshots {
    fn next_best(&mut self, _cancel: &AtomicBool) -> Result<Option<RankedSnapshot>, BmcfuzzError> {
        Ok(self.pending.pop().map(|(id, score)| RankedSnapshot {
            id,
            score: Some(score),
        }))
    }
}

/// Score source backed by the external CSR-transition selector.
///
/// The select command prints the best snapshot ID on stdout, `-1` when none
/// remain.
#[derive(Debug, Clone)]
pub struct CommandSnapshotSource {
    pub select_command: String,
    pub update_command: Option<String>,
    /// Where the select command's stdout is captured.
    pub capture_path: PathBuf,
}

pub fn parse_selected_id(stdout: &str) -> Result<Option<SnapshotId>, BmcfuzzError> {
    let last = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .ok_or_else(|| BmcfuzzError::Parse("snapshot selector printed nothing".to_string()))?;
    let value: i64 = last
        .parse()
        .map_err(|e| BmcfuzzError::Parse(format!("snapshot selector output {:?}: {}", last, e)))?;
    if value == -1 {
        return Ok(None);
    }
    SnapshotId::try_from(value)
        .map(Some)
        .map_err(|_| BmcfuzzError::Parse(format!("snapshot selector output {} out of range", value)))
}

impl SnapshotSource for CommandSnapshotSource {
    fn next_best(&mut self, cancel: &AtomicBool) -> Result<Option<RankedSnapshot>, BmcfuzzError> {
        log::info!("snapshot select: {}", self.select_command);
        let mut cmd = shell_command(None, &self.select_command);
        let (outcome, stdout) = run_command_capturing(&mut cmd, &self.capture_path, cancel)?;
        if outcome.is_cancelled() {
            return Err(BmcfuzzError::Interrupted);
        }
        if !outcome.success() {
            return Err(BmcfuzzError::Setup(format!(
                "snapshot select failed with status {}: {}",
                outcome.code(),
                self.select_command
            )));
        }
        Ok(parse_selected_id(&stdout)?.map(|id| RankedSnapshot { id, score: None }))
    }

    fn update(&mut self, cancel: &AtomicBool) -> Result<(), BmcfuzzError> {
        match &self.update_command {
            Some(line) => run_checked("snapshot update", None, line, cancel),
            None => Ok(()),
        }
    }
}

/// Produces the init files for `snapshot` through the configured hook.
/// `{id}` and `{wave}` in the command are substituted.
pub fn bootstrap_snapshot(
    command_template: &str,
    snapshot: &Snapshot,
    env_script: Option<&Path>,
    cancel: &AtomicBool,
) -> Result<(), BmcfuzzError> {
    let line = command_template
        .replace("{id}", &snapshot.id.to_string())
        .replace("{wave}", &snapshot.wave_path.display().to_string());
    run_checked("snapshot bootstrap", env_script, &line, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ranked_snapshots_best_first() {
        let cancel = AtomicBool::new(false);
        let mut ranked = RankedSnapshots::parse("# id score\n3 0.5\n1 2.0\n\n7 0.5\n").unwrap();
        assert_eq!(ranked.len(), 3);
        let order: Vec<SnapshotId> = std::iter::from_fn(|| ranked.next_best(&cancel).unwrap())
            .map(|r| r.id)
            .collect();
        assert_eq!(order, vec![1, 3, 7]);
        assert!(ranked.next_best(&cancel).unwrap().is_none());
    }

    #[test]
    fn test_ranked_snapshots_rejects_bad_line() {
        assert!(RankedSnapshots::parse("1 2 3\n").is_err());
        assert!(RankedSnapshots::parse("x 1.0\n").is_err());
    }

    #[test]
    fn test_parse_selected_id() {
        assert_eq!(parse_selected_id("scores...\n4\n").unwrap(), Some(4));
        assert_eq!(parse_selected_id("-1\n").unwrap(), None);
        assert!(parse_selected_id("").is_err());
        assert!(parse_selected_id("-5").is_err());
    }

    #[test]
    fn test_locate() {
        let s = Snapshot::locate(2, Path::new("/w"), Path::new("/s"), None);
        assert_eq!(s.wave_path, PathBuf::from("/w/2.vcd"));
        assert_eq!(s.snapshot_file, PathBuf::from("/s/2"));
    }

    #[test]
    fn test_command_source_sentinel_ends() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = AtomicBool::new(false);
        let mut source = CommandSnapshotSource {
            select_command: "echo 5".to_string(),
            update_command: Some("true".to_string()),
            capture_path: dir.path().join("select.out"),
        };
        assert_eq!(
            source.next_best(&cancel).unwrap(),
            Some(RankedSnapshot { id: 5, score: None })
        );
        source.update(&cancel).unwrap();
        source.select_command = "echo -1".to_string();
        assert_eq!(source.next_best(&cancel).unwrap(), None);
    }

    #[test]
    fn test_bootstrap_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("boot.txt");
        let snapshot = Snapshot::locate(9, Path::new("/waves"), Path::new("/snaps"), None);
        let cancel = AtomicBool::new(false);
        let template = format!("echo {{id}} {{wave}} > {}", out.display());
        bootstrap_snapshot(&template, &snapshot, None, &cancel).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "9 /waves/9.vcd\n");
    }
}
