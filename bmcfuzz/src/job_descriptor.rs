// SPDX-License-Identifier: Apache-2.0

//! Per-point solver job descriptors (`cover_<id>.sby`).

use std::path::{Path, PathBuf};

use crate::bmcfuzz_error::BmcfuzzError;
use crate::solver_mode::SolverMode;
use crate::PointId;

pub const TOP_MODULE_NAME: &str = "FormalTop";

/// Search depth and timeout (seconds) used when none is configured.
pub fn default_depth_and_timeout(cpu: &str) -> (u32, u64) {
    match cpu {
        "nutshell" => (90, 2 * 60 * 60),
        "rocket" => (75, 3 * 60 * 60),
        "boom" => (75, 4 * 60 * 60),
        _ => (50, 60 * 60),
    }
}

pub fn cover_label(point: PointId) -> String {
    format!("cov_count_{}", point)
}

pub fn descriptor_path(cover_tasks_dir: &Path, point: PointId) -> PathBuf {
    cover_tasks_dir.join(format!("cover_{}.sby", point))
}

/// Directory the solver creates for a descriptor.
pub fn job_dir(cover_tasks_dir: &Path, point: PointId) -> PathBuf {
    cover_tasks_dir.join(format!("cover_{}", point))
}

/// Substitutes `{name}` placeholders; `{{` and `}}` stand for literal braces.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> Result<String, BmcfuzzError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(BmcfuzzError::Parse(format!(
                                "unterminated placeholder `{{{}` in template",
                                name
                            )))
                        }
                    }
                }
                match values.iter().find(|(k, _)| *k == name) {
                    Some((_, v)) => out.push_str(v),
                    None => {
                        return Err(BmcfuzzError::Parse(format!(
                            "unknown placeholder `{{{}}}` in template",
                            name
                        )))
                    }
                }
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => {
                return Err(BmcfuzzError::Parse(
                    "single `}` in template; write `}}` for a literal brace".to_string(),
                ))
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

pub struct JobDescriptorWriter {
    template: String,
    cover_tasks_dir: PathBuf,
    rtl_dir: PathBuf,
    mode: SolverMode,
    depth: u32,
    timeout_secs: u64,
    total_points: usize,
}

impl JobDescriptorWriter {
    pub fn new(
        template: String,
        cover_tasks_dir: PathBuf,
        rtl_dir: PathBuf,
        mode: SolverMode,
        depth: u32,
        timeout_secs: u64,
        total_points: usize,
    ) -> Self {
        JobDescriptorWriter {
            template,
            cover_tasks_dir,
            rtl_dir,
            mode,
            depth,
            timeout_secs,
            total_points,
        }
    }

    pub fn from_template_file(
        template_path: &Path,
        cover_tasks_dir: PathBuf,
        rtl_dir: PathBuf,
        mode: SolverMode,
        depth: u32,
        timeout_secs: u64,
        total_points: usize,
    ) -> Result<Self, BmcfuzzError> {
        let template = std::fs::read_to_string(template_path).map_err(|e| {
            BmcfuzzError::io(format!("reading sby template {}", template_path.display()), e)
        })?;
        Ok(JobDescriptorWriter::new(
            template,
            cover_tasks_dir,
            rtl_dir,
            mode,
            depth,
            timeout_secs,
            total_points,
        ))
    }

    pub fn mode(&self) -> SolverMode {
        self.mode
    }

    pub fn cover_tasks_dir(&self) -> &Path {
        &self.cover_tasks_dir
    }

    fn rtl_files(&self) -> Result<Vec<PathBuf>, BmcfuzzError> {
        let entries = std::fs::read_dir(&self.rtl_dir).map_err(|e| {
            BmcfuzzError::io(format!("listing rtl dir {}", self.rtl_dir.display()), e)
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                BmcfuzzError::io(format!("listing rtl dir {}", self.rtl_dir.display()), e)
            })?;
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }

    /// Renders the descriptor text for one point.
    pub fn render(&self, point: PointId, rtl_files: &[PathBuf]) -> Result<String, BmcfuzzError> {
        if point >= self.total_points {
            return Err(BmcfuzzError::PointOutOfRange {
                point,
                total: self.total_points,
            });
        }
        let protocol = self.mode.protocol();
        let label = cover_label(point);
        let formal_files = rtl_files
            .iter()
            .map(|f| {
                let base = f.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
                format!("read -formal {}", base)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let verilog_files = rtl_files
            .iter()
            .map(|f| f.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        let scripts = format!(
            "chformal -remove -{} c:{} %n\n",
            protocol.stripped_statement, label
        );
        let depth = self.depth.to_string();
        let timeout = self.timeout_secs.to_string();
        render_template(
            &self.template,
            &[
                ("mode", protocol.sby_mode),
                ("depth", depth.as_str()),
                ("timeout", timeout.as_str()),
                ("engines", protocol.engines),
                ("formal_files", formal_files.as_str()),
                ("top_module_name", TOP_MODULE_NAME),
                ("scripts", scripts.as_str()),
                ("cover_label", label.as_str()),
                ("verilog_files", verilog_files.as_str()),
            ],
        )
    }

    /// Writes `cover_<id>.sby` for every point and returns the paths.
    ///
    /// Every ID is checked before anything is written.
    pub fn write(&self, points: &[PointId]) -> Result<Vec<PathBuf>, BmcfuzzError> {
        if let Some(&bad) = points.iter().find(|&&p| p >= self.total_points) {
            return Err(BmcfuzzError::PointOutOfRange {
                point: bad,
                total: self.total_points,
            });
        }
        std::fs::create_dir_all(&self.cover_tasks_dir).map_err(|e| {
            BmcfuzzError::io(format!("creating {}", self.cover_tasks_dir.display()), e)
        })?;
        let rtl_files = self.rtl_files()?;
        let mut written = Vec::with_capacity(points.len());
        for &point in points {
            let text = self.render(point, &rtl_files)?;
            let path = descriptor_path(&self.cover_tasks_dir, point);
            std::fs::write(&path, text)
                .map_err(|e| BmcfuzzError::io(format!("writing {}", path.display()), e))?;
            written.push(path);
        }
        log::info!(
            "descriptors: wrote {} {} jobs (depth={} timeout={}s)",
            written.len(),
            self.mode,
            self.depth,
            self.timeout_secs
        );
        Ok(written)
    }
}

/// Removes every `cover_<id>` descriptor and job directory and empties
/// `hexbin/` under the job workspace. The cover report is kept. A missing
/// workspace is not an error.
pub fn clean_job_workspace(dir: &Path) -> Result<(), BmcfuzzError> {
    if !dir.exists() {
        log::warn!("job workspace {} not found", dir.display());
        return Ok(());
    }
    let io_err = |p: &Path, e| BmcfuzzError::io(format!("cleaning {}", p.display()), e);
    let entries = std::fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let is_dir = entry.file_type().map_err(|e| io_err(&path, e))?.is_dir();
        let is_job_entry = name
            .strip_prefix("cover_")
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_ascii_digit());
        if is_job_entry {
            if is_dir {
                std::fs::remove_dir_all(&path).map_err(|e| io_err(&path, e))?;
            } else {
                std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            }
        } else if name == "hexbin" && is_dir {
            std::fs::remove_dir_all(&path).map_err(|e| io_err(&path, e))?;
            std::fs::create_dir(&path).map_err(|e| io_err(&path, e))?;
        }
    }
    log::debug!("cleaned job workspace {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const TEMPLATE: &str = "[options]\nmode {mode}\ndepth {depth}\ntimeout {timeout}\n\n\
[engines]\n{engines}\n\n[script]\n{formal_files}\n{scripts}prep -top {top_module_name}\n\
# {{{cover_label}}}\n\n[files]\n{verilog_files}\n";

    #[test_case("nutshell", 90, 7200)]
    #[test_case("rocket", 75, 10800)]
    #[test_case("boom", 75, 14400)]
    #[test_case("xiangshan", 50, 3600)]
    fn test_default_depth_and_timeout(cpu: &str, depth: u32, timeout: u64) {
        assert_eq!(default_depth_and_timeout(cpu), (depth, timeout));
    }

    #[test]
    fn test_render_template_escapes() {
        let got = render_template("{{a}} {a} }}", &[("a", "x")]).unwrap();
        assert_eq!(got, "{a} x }");
    }

    #[test]
    fn test_render_template_unknown_placeholder() {
        let err = render_template("{nope}", &[("a", "x")]).unwrap_err();
        assert!(matches!(err, BmcfuzzError::Parse(_)));
    }

    #[test]
    fn test_render_template_unterminated() {
        assert!(render_template("{abc", &[]).is_err());
        assert!(render_template("a } b", &[]).is_err());
    }

    fn writer(dir: &Path, mode: SolverMode, total: usize) -> JobDescriptorWriter {
        let rtl_dir = dir.join("rtl");
        std::fs::create_dir_all(&rtl_dir).unwrap();
        std::fs::write(rtl_dir.join("b.sv"), "module b; endmodule\n").unwrap();
        std::fs::write(rtl_dir.join("a.sv"), "module a; endmodule\n").unwrap();
        JobDescriptorWriter::new(
            TEMPLATE.to_string(),
            dir.join("tasks"),
            rtl_dir,
            mode,
            75,
            10800,
            total,
        )
    }

    #[test]
    fn test_write_bounded_assertion_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), SolverMode::BoundedAssertion, 10);
        let paths = w.write(&[7]).unwrap();
        assert_eq!(paths, vec![dir.path().join("tasks").join("cover_7.sby")]);
        let text = std::fs::read_to_string(&paths[0]).unwrap();
        let rtl = dir.path().join("rtl");
        let want = format!(
            "[options]\nmode bmc\ndepth 75\ntimeout 10800\n\n[engines]\naiger rIC3\n\n[script]\n\
read -formal a.sv\nread -formal b.sv\nchformal -remove -assert c:cov_count_7 %n\n\
prep -top FormalTop\n# {{cov_count_7}}\n\n[files]\n{}\n{}\n",
            rtl.join("a.sv").display(),
            rtl.join("b.sv").display()
        );
        assert_eq!(text, want);
    }

    #[test]
    fn test_cover_mode_strips_other_covers() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), SolverMode::CoverReachability, 10);
        let text = w.render(3, &[]).unwrap();
        assert!(text.contains("mode cover\n"));
        assert!(text.contains("smtbmc bitwuzla"));
        assert!(text.contains("chformal -remove -cover c:cov_count_3 %n"));
    }

    #[test]
    fn test_write_rejects_point_outside_universe() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), SolverMode::CoverReachability, 4);
        let err = w.write(&[1, 4]).unwrap_err();
        assert!(matches!(
            err,
            BmcfuzzError::PointOutOfRange { point: 4, total: 4 }
        ));
        assert!(!descriptor_path(&dir.path().join("tasks"), 1).exists());
    }

    #[test]
    fn test_clean_job_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path();
        std::fs::write(ws.join("cover_1.sby"), "x").unwrap();
        std::fs::create_dir_all(ws.join("cover_1").join("engine_0")).unwrap();
        std::fs::create_dir_all(ws.join("hexbin")).unwrap();
        std::fs::write(ws.join("hexbin").join("cover_1.bin"), "x").unwrap();
        std::fs::write(ws.join("cover_points.csv"), "Index,Covered\n").unwrap();
        clean_job_workspace(ws).unwrap();
        assert!(!ws.join("cover_1.sby").exists());
        assert!(!ws.join("cover_1").exists());
        assert!(ws.join("hexbin").is_dir());
        assert_eq!(std::fs::read_dir(ws.join("hexbin")).unwrap().count(), 0);
        assert!(ws.join("cover_points.csv").exists());
    }

    #[test]
    fn test_clean_missing_workspace_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        clean_job_workspace(&dir.path().join("absent")).unwrap();
    }
}
