// SPDX-License-Identifier: Apache-2.0

//! The coverage point universe, read from the generated cover-name listing.
//!
//! The listing is a C array of `"Module.signal"` strings; declaration order
//! defines point IDs and first-seen order defines module IDs.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::bmcfuzz_error::BmcfuzzError;
use crate::{ModuleId, PointId};

static NAMES_BEGIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"static const char \*\w+_NAMES\[\] = \{").unwrap());
static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]*)""#).unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointInfo {
    pub module: ModuleId,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointTable {
    points: Vec<PointInfo>,
    modules: Vec<String>,
}

impl PointTable {
    /// Builds a table from `(module, signal)` pairs in declaration order.
    pub fn from_pairs<I, M, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (M, S)>,
        M: AsRef<str>,
        S: Into<String>,
    {
        let mut table = PointTable::default();
        let mut module_ids: HashMap<String, ModuleId> = HashMap::new();
        for (module, signal) in pairs {
            let module = module.as_ref();
            let module_id = match module_ids.get(module) {
                Some(&id) => id,
                None => {
                    let id = table.modules.len();
                    table.modules.push(module.to_string());
                    module_ids.insert(module.to_string(), id);
                    id
                }
            };
            table.points.push(PointInfo {
                module: module_id,
                name: signal.into(),
            });
        }
        table
    }

    pub fn parse(text: &str) -> Self {
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut in_names = false;
        for line in text.lines() {
            if !in_names {
                in_names = NAMES_BEGIN.is_match(line);
                continue;
            }
            if line.contains("};") {
                break;
            }
            if let Some(caps) = QUOTED.captures(line) {
                let full = &caps[1];
                let (module, signal) = match full.split_once('.') {
                    Some((m, s)) => (m, s),
                    None => (full, ""),
                };
                pairs.push((module.to_string(), signal.to_string()));
            }
        }
        PointTable::from_pairs(pairs)
    }

    pub fn from_file(path: &Path) -> Result<Self, BmcfuzzError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BmcfuzzError::io(format!("reading point table {}", path.display()), e)
        })?;
        let table = PointTable::parse(&text);
        log::info!(
            "point table {}: modules={} points={}",
            path.display(),
            table.module_count(),
            table.len()
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn point_to_module(&self) -> Vec<ModuleId> {
        self.points.iter().map(|p| p.module).collect()
    }

    pub fn module_of(&self, point: PointId) -> Option<ModuleId> {
        self.points.get(point).map(|p| p.module)
    }

    pub fn module_name(&self, module: ModuleId) -> Option<&str> {
        self.modules.get(module).map(String::as_str)
    }

    pub fn point_name(&self, point: PointId) -> Option<&str> {
        self.points.get(point).map(|p| p.name.as_str())
    }

    /// `module.signal`, or `?` for an unknown point.
    pub fn display_name(&self, point: PointId) -> String {
        match self.points.get(point) {
            Some(p) => format!("{}.{}", self.modules[p.module], p.name),
            None => "?".to_string(),
        }
    }

    pub fn module_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.modules.len()];
        for p in &self.points {
            sizes[p.module] += 1;
        }
        sizes
    }
}
