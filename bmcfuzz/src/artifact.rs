// SPDX-License-Identifier: Apache-2.0

//! Turning solver traces into fuzzer seed images.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use crate::bmcfuzz_error::BmcfuzzError;
use crate::memory_image::{
    normalize_image_file, parse_witness_display, render_witness_steps, MemoryImage,
};
use crate::process::{run_command, shell_command, ProcessOutcome};
use crate::solver_mode::ArtifactKind;
use crate::vcd_trace::{image_from_vcd, read_port_for_cpu};
use crate::PointId;

/// Testbench the cover-mode solver writes next to `trace0.vcd`.
pub const TESTBENCH_FILE: &str = "trace0_tb.v";

#[derive(Debug, Clone, Copy)]
pub struct TraceArtifact<'a> {
    pub point: PointId,
    pub kind: ArtifactKind,
    pub path: &'a Path,
}

/// Converts one trace artifact into a binary memory image and returns the
/// image path. Called concurrently from executor workers.
pub trait ArtifactConverter: Send + Sync {
    fn convert(
        &self,
        artifact: &TraceArtifact<'_>,
        cancel: &AtomicBool,
    ) -> Result<PathBuf, BmcfuzzError>;
}

pub fn image_path(hexbin_dir: &Path, point: PointId) -> PathBuf {
    hexbin_dir.join(format!("cover_{}.bin", point))
}

fn image_from_testbench(tb: &Path) -> Result<MemoryImage, BmcfuzzError> {
    let text = std::fs::read_to_string(tb)
        .map_err(|e| BmcfuzzError::io(format!("reading {}", tb.display()), e))?;
    MemoryImage::from_testbench(&text)
}

/// Production converter: read-port reconstruction for waveforms (falling
/// back to the sibling testbench), `yosys-witness` plus the fuzzer's
/// linearizer for witnesses.
#[derive(Debug, Clone)]
pub struct ToolchainArtifactConverter {
    pub hexbin_dir: PathBuf,
    pub solver_env_script: Option<PathBuf>,
    pub noop_home: PathBuf,
    pub cover_type: String,
    pub snapshot_file: Option<PathBuf>,
    /// Selects the read port the waveform is decoded from.
    pub cpu: String,
    pub retain_intermediates: bool,
}

impl ToolchainArtifactConverter {
    fn remove_intermediate(&self, path: &Path) {
        if self.retain_intermediates {
            return;
        }
        if let Err(e) = std::fs::remove_file(path) {
            log::debug!("artifact: could not remove {}: {}", path.display(), e);
        }
    }

    fn convert_waveform(&self, point: PointId, vcd: &Path) -> Result<PathBuf, BmcfuzzError> {
        let from_port = match read_port_for_cpu(&self.cpu) {
            Some(port) => image_from_vcd(vcd, port),
            None => {
                log::debug!("cover_{}: no read port known for {}", point, self.cpu);
                Ok(None)
            }
        };
        let tb = vcd.with_file_name(TESTBENCH_FILE);
        let image = match from_port {
            Ok(Some(image)) => image,
            Ok(None) => image_from_testbench(&tb)?,
            Err(e) if tb.exists() => {
                log::warn!("cover_{}: {}; reading {}", point, e, tb.display());
                image_from_testbench(&tb)?
            }
            Err(e) => return Err(e),
        };
        let out = image_path(&self.hexbin_dir, point);
        image.write_to(&out)?;
        Ok(out)
    }

    fn convert_witness(
        &self,
        point: PointId,
        witness: &Path,
        cancel: &AtomicBool,
    ) -> Result<PathBuf, BmcfuzzError> {
        let display_out = self.hexbin_dir.join(format!("cover_{}.witness", point));
        let display_line = format!(
            "yosys-witness display {} > {}",
            witness.display(),
            display_out.display()
        );
        let mut display_cmd = shell_command(self.solver_env_script.as_deref(), &display_line);
        match run_command(&mut display_cmd, cancel)? {
            ProcessOutcome::Exited(0) => {}
            ProcessOutcome::Cancelled => return Err(BmcfuzzError::Interrupted),
            other => log::warn!(
                "cover_{}: yosys-witness display exited with {}",
                point,
                other.code()
            ),
        }
        let text = std::fs::read_to_string(&display_out)
            .map_err(|e| BmcfuzzError::io(format!("reading {}", display_out.display()), e))?;
        let steps = parse_witness_display(&text, self.snapshot_file.is_some());
        std::fs::write(&display_out, render_witness_steps(&steps)?)
            .map_err(|e| BmcfuzzError::io(format!("writing {}", display_out.display()), e))?;

        let out = image_path(&self.hexbin_dir, point);
        let log_path = self.hexbin_dir.join(format!("cover_{}.log", point));
        let mut line = format!(
            "cd {} && source env.sh && ./build/fuzzer --auto-exit -c firrtl.{} -- {} --as-witness \
             -I 300 -C 3000 --fuzz-id 0 --no-diff",
            self.noop_home.display(),
            self.cover_type,
            display_out.display()
        );
        if let Some(snapshot) = &self.snapshot_file {
            line.push_str(&format!(
                " --run-snapshot --load-snapshot {}",
                snapshot.display()
            ));
        }
        line.push_str(&format!(
            " --dump-linearized {} > {} 2>&1",
            out.display(),
            log_path.display()
        ));
        let outcome = run_command(&mut shell_command(None, &line), cancel)?;
        if outcome.is_cancelled() {
            return Err(BmcfuzzError::Interrupted);
        }
        log::debug!(
            "cover_{}: linearizer exited with {}",
            point,
            outcome.code()
        );
        self.remove_intermediate(&display_out);
        self.remove_intermediate(&log_path);
        normalize_image_file(&out)?;
        Ok(out)
    }
}

impl ArtifactConverter for ToolchainArtifactConverter {
    fn convert(
        &self,
        artifact: &TraceArtifact<'_>,
        cancel: &AtomicBool,
    ) -> Result<PathBuf, BmcfuzzError> {
        std::fs::create_dir_all(&self.hexbin_dir).map_err(|e| {
            BmcfuzzError::io(format!("creating {}", self.hexbin_dir.display()), e)
        })?;
        let out = match artifact.kind {
            ArtifactKind::Waveform => self.convert_waveform(artifact.point, artifact.path)?,
            ArtifactKind::Witness => {
                self.convert_witness(artifact.point, artifact.path, cancel)?
            }
        };
        log::debug!("cover_{}: memory image {}", artifact.point, out.display());
        Ok(out)
    }
}
