// SPDX-License-Identifier: Apache-2.0

//! Fake tools and input files for process-level tests.

use std::path::{Path, PathBuf};

/// Writes an executable `#!/bin/bash` script and returns its path.
#[cfg(unix)]
pub fn write_fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/bash\n{}", body)).expect("write fake tool");
    let mut perms = std::fs::metadata(&path).expect("stat fake tool").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod fake tool");
    log::info!("write_fake_tool; wrote {}", path.display());
    path
}

/// A cover trace whose rocket read port (`FormalTop.dut.mem.srams.mem.helper_0`)
/// reads word index 1 as `0x13`.
pub const ROCKET_READ_PORT_VCD: &str = "$timescale 1ns $end
$scope module FormalTop $end
$scope module dut $end
$scope module mem $end
$scope module srams $end
$scope module mem $end
$scope module helper_0 $end
$var wire 1 ! r_enable $end
$var wire 29 \" r_index [28:0] $end
$var wire 64 # r_data [63:0] $end
$upscope $end
$upscope $end
$upscope $end
$upscope $end
$upscope $end
$upscope $end
$enddefinitions $end
#0
1!
b1 \"
b0 #
#10
0!
b10011 #
#20
";

/// A stand-in for `sby.py -f <dir>/cover_<id>.sby`.
///
/// Points in `reached` exit with `pass_code`; when `with_artifact` is set
/// the job directory also gets `engine_0/<artifact>` and a one-word
/// `trace0_tb.v`. A `.vcd` artifact holds [`ROCKET_READ_PORT_VCD`]. Every
/// other point exits 1.
#[cfg(unix)]
pub fn write_fake_sby(
    dir: &Path,
    reached: &[usize],
    pass_code: i32,
    artifact: &str,
    with_artifact: bool,
) -> PathBuf {
    let cases = if reached.is_empty() {
        "__none__".to_string()
    } else {
        reached
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("|")
    };
    let write_trace = if artifact.ends_with(".vcd") {
        format!(
            "  cat > \"$job/engine_0/{artifact}\" <<'VCD'\n{}VCD\n",
            ROCKET_READ_PORT_VCD
        )
    } else {
        format!("  echo 'witness' > \"$job/engine_0/{artifact}\"\n")
    };
    let make_artifact = if with_artifact {
        format!(
            "  mkdir -p \"$job/engine_0\"\n\
             {write_trace}  \
             echo \"  UUT.helper_0.memory[29'b1] = 64'b10011;\" > \"$job/engine_0/trace0_tb.v\"\n"
        )
    } else {
        String::new()
    };
    let body = format!(
        "desc=\"$2\"\n\
         job=\"${{desc%.sby}}\"\n\
         id=\"${{job##*_}}\"\n\
         mkdir -p \"$job\"\n\
         echo \"summary: Elapsed clock time [H:MM:SS (secs)]: 0:00:01 (1)\" > \"$job/logfile.txt\"\n\
         case \"$id\" in\n  {cases})\n{make_artifact}  exit {pass_code}\n  ;;\nesac\n\
         exit 1\n"
    );
    write_fake_tool(dir, "sby.py", &body)
}

/// Writes a `firrtl-cover.cpp`-style point-name table.
pub fn write_point_table(dir: &Path, names: &[(&str, &str)]) -> PathBuf {
    let mut text = String::from("#include <cstdint>\n\nstatic const char *toggle_NAMES[] = {\n");
    for (module, signal) in names {
        text.push_str(&format!("  \"{}.{}\",\n", module, signal));
    }
    text.push_str("};\n");
    let path = dir.join("firrtl-cover.cpp");
    std::fs::write(&path, text).expect("write point table");
    path
}

/// A minimal sby template using every placeholder.
pub fn write_sby_template(dir: &Path) -> PathBuf {
    let text = "[options]\nmode {mode}\ndepth {depth}\ntimeout {timeout}\n\n\
                [engines]\n{engines}\n\n\
                [script]\n{formal_files}\nprep -top {top_module_name}\n{scripts}\n\
                # target {cover_label}\n\n\
                [files]\n{verilog_files}\n";
    let path = dir.join("template.sby");
    std::fs::write(&path, text).expect("write sby template");
    path
}

/// An RTL directory with a single top file.
pub fn write_rtl_dir(dir: &Path) -> PathBuf {
    let rtl = dir.join("rtl");
    std::fs::create_dir_all(&rtl).expect("create rtl dir");
    std::fs::write(rtl.join("FormalTop.sv"), "module FormalTop; endmodule\n")
        .expect("write rtl");
    rtl
}
