// SPDX-License-Identifier: Apache-2.0

//! Memory reads recovered from the instruction memory read port of a cover
//! trace.
//!
//! Every enable change to `1` that is followed by another enable change
//! yields one word: the index sampled when enable rose and the data sampled
//! at the following enable change.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

use vcd_ng::{FFValueChange, FastFlow, FastFlowToken, Parser, ScopeItem};

use crate::bmcfuzz_error::BmcfuzzError;
use crate::memory_image::{parse_data_word, MemoryImage};

const VCD_BUFFER_SIZE: usize = 65536;

/// Signals of a synchronous memory read port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPort {
    /// Dotted scope path of the module owning the signals.
    pub hier: &'static str,
    pub enable: &'static str,
    pub index: &'static str,
    pub data: &'static str,
}

const fn helper_port(hier: &'static str) -> ReadPort {
    ReadPort {
        hier,
        enable: "r_enable",
        index: "r_index",
        data: "r_data",
    }
}

static READ_PORTS: &[(&str, ReadPort)] = &[
    ("nutshell", helper_port("FormalTop.dut.mem.rdata_mem.helper_0")),
    ("rocket", helper_port("FormalTop.dut.mem.srams.mem.helper_0")),
    ("boom", helper_port("FormalTop.dut.mem.srams.mem.helper_0")),
];

pub fn read_port_for_cpu(cpu: &str) -> Option<&'static ReadPort> {
    READ_PORTS
        .iter()
        .find(|(name, _)| *name == cpu)
        .map(|(_, port)| port)
}

/// Raw value changes of one read port, keyed by timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortTrace {
    pub enable: Vec<(u64, String)>,
    pub index: BTreeMap<u64, String>,
    pub data: BTreeMap<u64, String>,
}

/// Binary digits of a VCD value, `x`/`z` read as 0, at most 64 wide.
fn normalize_bits(raw: &str) -> String {
    let digits: String = raw
        .trim_start_matches(['b', 'B'])
        .chars()
        .map(|c| if c == '1' { '1' } else { '0' })
        .collect();
    match digits.len() {
        0 => "0".to_string(),
        n if n > 64 => digits[n - 64..].to_string(),
        _ => digits,
    }
}

fn is_high(raw: &str) -> bool {
    normalize_bits(raw).trim_start_matches('0') == "1"
}

// Latest value at or before `t`.
fn sample(values: &BTreeMap<u64, String>, t: u64) -> Option<&str> {
    values.range(..=t).next_back().map(|(_, v)| v.as_str())
}

impl PortTrace {
    pub fn to_image(&self) -> Result<MemoryImage, BmcfuzzError> {
        let mut enable = self.enable.clone();
        enable.sort_by_key(|(t, _)| *t);
        let mut image = MemoryImage::new();
        for pair in enable.windows(2) {
            let (t, value) = &pair[0];
            let (next_t, _) = &pair[1];
            if !is_high(value) {
                continue;
            }
            let (Some(index), Some(data)) = (sample(&self.index, *t), sample(&self.data, *next_t))
            else {
                log::debug!("vcd: read at {} has no index or data sample", t);
                continue;
            };
            let (addr, word) = parse_data_word(&normalize_bits(index), &normalize_bits(data))?;
            log::trace!("vcd: t={} addr={:#010x} data={:#018x}", t, addr, word);
            image.insert(addr, word);
        }
        Ok(image)
    }
}

struct PortCodes {
    enable: u64,
    index: u64,
    data: u64,
}

fn find_scope<'a>(items: &'a [ScopeItem], path: &[&str]) -> Option<&'a [ScopeItem]> {
    let Some((first, rest)) = path.split_first() else {
        return Some(items);
    };
    items.iter().find_map(|item| match item {
        ScopeItem::Scope(scope) if scope.identifier == *first => {
            find_scope(&scope.children[..], rest)
        }
        _ => None,
    })
}

fn var_code(items: &[ScopeItem], name: &str) -> Option<u64> {
    items.iter().find_map(|item| match item {
        ScopeItem::Var(var) if var.reference == name => Some(var.code.0),
        _ => None,
    })
}

fn port_codes(items: &[ScopeItem], port: &ReadPort) -> Option<PortCodes> {
    let path: Vec<&str> = port.hier.split('.').collect();
    let scope = find_scope(items, &path)?;
    Some(PortCodes {
        enable: var_code(scope, port.enable)?,
        index: var_code(scope, port.index)?,
        data: var_code(scope, port.data)?,
    })
}

/// Collects the port's value changes from a VCD file. `None` when the
/// header does not declare all three signals under `port.hier`.
pub fn read_port_trace(path: &Path, port: &ReadPort) -> Result<Option<PortTrace>, BmcfuzzError> {
    let file = File::open(path)
        .map_err(|e| BmcfuzzError::io(format!("opening {}", path.display()), e))?;
    let mut reader = BufReader::with_capacity(VCD_BUFFER_SIZE, file);
    let mut parser = Parser::new(&mut reader);
    let header = parser
        .parse_header()
        .map_err(|e| BmcfuzzError::Parse(format!("{}: VCD header: {}", path.display(), e)))?;
    drop(parser);
    let Some(codes) = port_codes(&header.items[..], port) else {
        log::debug!("vcd: {} has no read port under {}", path.display(), port.hier);
        return Ok(None);
    };

    let mut file = reader.into_inner();
    file.seek(SeekFrom::Start(0))
        .map_err(|e| BmcfuzzError::io(format!("rewinding {}", path.display()), e))?;
    let mut flow = FastFlow::new(file, VCD_BUFFER_SIZE);
    let mut trace = PortTrace::default();
    let mut now = 0u64;
    while let Some(tok) = flow
        .next_token()
        .map_err(|e| BmcfuzzError::Parse(format!("{}: VCD body: {}", path.display(), e)))?
    {
        match tok {
            FastFlowToken::Timestamp(t) => now = t,
            FastFlowToken::Value(FFValueChange { id, bits }) => {
                let code = id.0;
                if code != codes.enable && code != codes.index && code != codes.data {
                    continue;
                }
                let value = String::from_utf8_lossy(bits).into_owned();
                if code == codes.enable {
                    trace.enable.push((now, value.clone()));
                }
                if code == codes.index {
                    trace.index.insert(now, value.clone());
                }
                if code == codes.data {
                    trace.data.insert(now, value);
                }
            }
        }
    }
    Ok(Some(trace))
}

pub fn image_from_vcd(path: &Path, port: &ReadPort) -> Result<Option<MemoryImage>, BmcfuzzError> {
    match read_port_trace(path, port)? {
        Some(trace) => trace.to_image().map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmcfuzz_test_helpers::ROCKET_READ_PORT_VCD;
    use pretty_assertions::assert_eq;

    fn owned(values: &[(u64, &str)]) -> Vec<(u64, String)> {
        values.iter().map(|(t, s)| (*t, s.to_string())).collect()
    }

    fn trace(enable: &[(u64, &str)], index: &[(u64, &str)], data: &[(u64, &str)]) -> PortTrace {
        PortTrace {
            enable: owned(enable),
            index: owned(index).into_iter().collect(),
            data: owned(data).into_iter().collect(),
        }
    }

    #[test]
    fn test_cpu_table() {
        assert_eq!(
            read_port_for_cpu("nutshell").map(|p| p.hier),
            Some("FormalTop.dut.mem.rdata_mem.helper_0")
        );
        assert_eq!(read_port_for_cpu("rocket"), read_port_for_cpu("boom"));
        assert_eq!(read_port_for_cpu("xiangshan"), None);
    }

    #[test]
    fn test_index_at_enable_data_at_next_change() {
        let t = trace(
            &[(10, "0"), (0, "1"), (20, "1"), (30, "0")],
            &[(0, "b10"), (20, "b11")],
            &[(0, "b0"), (10, "b111"), (30, "b1010")],
        );
        let image = t.to_image().unwrap();
        let bytes = image.to_bytes();
        assert_eq!(image.len(), 2);
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[16], 0b111);
        assert_eq!(bytes[24], 0b1010);
    }

    #[test]
    fn test_unknown_bits_read_as_zero() {
        let t = trace(&[(0, "1"), (5, "0")], &[(0, "bx1")], &[(5, "bz101")]);
        let image = t.to_image().unwrap();
        assert_eq!(image.to_bytes()[8], 0b101);
    }

    #[test]
    fn test_trailing_enable_is_not_a_read() {
        let t = trace(&[(0, "1")], &[(0, "b1")], &[(0, "b1")]);
        assert!(t.to_image().unwrap().is_empty());
    }

    #[test]
    fn test_reads_rocket_port_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let vcd = dir.path().join("trace0.vcd");
        std::fs::write(&vcd, ROCKET_READ_PORT_VCD).unwrap();
        let port = read_port_for_cpu("rocket").unwrap();

        let trace = read_port_trace(&vcd, port).unwrap().unwrap();
        assert_eq!(trace.enable.len(), 2);

        let bytes = image_from_vcd(&vcd, port).unwrap().unwrap().to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[8], 0x13);
    }

    #[test]
    fn test_other_hierarchy_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let vcd = dir.path().join("trace0.vcd");
        std::fs::write(&vcd, ROCKET_READ_PORT_VCD).unwrap();
        let port = read_port_for_cpu("nutshell").unwrap();
        assert_eq!(image_from_vcd(&vcd, port).unwrap(), None);
    }
}
