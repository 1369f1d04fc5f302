// SPDX-License-Identifier: Apache-2.0

//! Binary memory images handed to the fuzzer as seeds.
//!
//! Layout: 64-bit little-endian words at byte address `word_index * 8`,
//! gaps from address 0 zero-filled. An image with no words serializes to a
//! single `13 00 00 00` (a no-op instruction) so consumers never see an
//! empty file.

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::bmcfuzz_error::BmcfuzzError;

pub const EMPTY_IMAGE_PLACEHOLDER: [u8; 4] = [0x13, 0x00, 0x00, 0x00];

static TESTBENCH_MEMORY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\.helper_0\.memory\[29'b([01]+)\] = 64'b([01]+);").unwrap()
});

/// Decodes a binary word index and a binary data word into a byte address
/// and value.
pub fn parse_data_word(addr_bits: &str, data_bits: &str) -> Result<(u64, u64), BmcfuzzError> {
    let index = u64::from_str_radix(addr_bits, 2)
        .map_err(|e| BmcfuzzError::Parse(format!("address bits {:?}: {}", addr_bits, e)))?;
    let addr = index
        .checked_mul(8)
        .ok_or_else(|| BmcfuzzError::Parse(format!("address bits {:?} overflow", addr_bits)))?;
    let data = u64::from_str_radix(data_bits, 2)
        .map_err(|e| BmcfuzzError::Parse(format!("data bits {:?}: {}", data_bits, e)))?;
    Ok((addr, data))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    words: BTreeMap<u64, u64>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later writes to the same address win.
    pub fn insert(&mut self, addr: u64, word: u64) {
        self.words.insert(addr, word);
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Reads the memory initialisation a solver writes into `trace0_tb.v`.
    pub fn from_testbench(text: &str) -> Result<Self, BmcfuzzError> {
        let mut image = MemoryImage::new();
        for caps in TESTBENCH_MEMORY_RE.captures_iter(text) {
            let (addr, data) = parse_data_word(&caps[1], &caps[2])?;
            log::trace!(
                "memory: addr={:#010x} data={:#010x} {:#010x}",
                addr,
                data & 0xffff_ffff,
                data >> 32
            );
            image.insert(addr, data);
        }
        Ok(image)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        if self.words.is_empty() {
            return EMPTY_IMAGE_PLACEHOLDER.to_vec();
        }
        let mut out = Vec::new();
        let mut current: u64 = 0;
        for (&addr, &word) in &self.words {
            if current < addr {
                log::trace!(
                    "memory: filling gap of {} bytes from {:#010x} to {:#010x}",
                    addr - current,
                    current,
                    addr
                );
                out.resize(out.len() + (addr - current) as usize, 0);
                current = addr;
            }
            out.extend_from_slice(&word.to_le_bytes());
            current += 8;
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<(), BmcfuzzError> {
        std::fs::write(path, self.to_bytes())
            .map_err(|e| BmcfuzzError::io(format!("writing memory image {}", path.display()), e))?;
        log::debug!(
            "memory: wrote {} words to {}",
            self.words.len(),
            path.display()
        );
        Ok(())
    }
}

/// Extracts the per-step random input bits from `yosys-witness display`
/// output. The first two steps are reset cycles and are dropped unless the
/// run starts from a snapshot.
pub fn parse_witness_display(text: &str, from_snapshot: bool) -> Vec<String> {
    let steps: Vec<String> = text
        .lines()
        .filter(|line| line.contains("rand_value"))
        .filter_map(|line| line.split_whitespace().last())
        .map(str::to_string)
        .collect();
    if from_snapshot {
        steps
    } else {
        steps.into_iter().skip(2).collect()
    }
}

/// Renders the witness file the fuzzer reads: the step count, then one
/// zero-padded hex word per step.
pub fn render_witness_steps(steps: &[String]) -> Result<String, BmcfuzzError> {
    let mut out = format!("{}\n", steps.len());
    for (i, bits) in steps.iter().enumerate() {
        let value = u128::from_str_radix(bits, 2).map_err(|e| {
            BmcfuzzError::Parse(format!("witness step {} bits {:?}: {}", i + 1, bits, e))
        })?;
        out.push_str(&format!("{:#018x}\n", value));
        if value != 0 && value != u64::MAX as u128 {
            log::trace!("witness: step {}: {:#018x}", i + 1, value);
        }
    }
    Ok(out)
}

/// Rewrites an empty image file with the placeholder. Returns whether the
/// file was rewritten.
pub fn normalize_image_file(path: &Path) -> Result<bool, BmcfuzzError> {
    let len = std::fs::metadata(path)
        .map_err(|e| BmcfuzzError::io(format!("reading {}", path.display()), e))?
        .len();
    if len > 0 {
        return Ok(false);
    }
    std::fs::write(path, EMPTY_IMAGE_PLACEHOLDER)
        .map_err(|e| BmcfuzzError::io(format!("writing {}", path.display()), e))?;
    log::debug!("memory: {} was empty, wrote placeholder", path.display());
    Ok(true)
}
