//! Translates monitored node indices into offsets inside the synchronized
//! variable vector (`pmudata.vars`).
//!
//! The simulator streams one `[vm, am, w]` triple per bus, so bus `i` sits at
//! `3i-3..3i` regardless of what `Idxvgs` says. Simulators that stream the full
//! variable vector instead are served by reading the offsets from `Idxvgs`.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::bus::Idxvgs;
use crate::error::{ConfigError, IndexMapError};

/// Where a bus's values sit in `pmudata.vars`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndexLayout {
    /// One `[vm, am, w]` triple per bus, in bus order.
    #[default]
    Interleaved,
    /// `vars` is the full simulation vector; offsets come from `Idxvgs`.
    Idxvgs,
}

impl FromStr for IndexLayout {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interleaved" => Ok(IndexLayout::Interleaved),
            "idxvgs" => Ok(IndexLayout::Idxvgs),
            _ => Err(ConfigError::invalid(
                "layout",
                format!("expected 'interleaved' or 'idxvgs', got '{}'", s),
            )),
        }
    }
}

impl fmt::Display for IndexLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexLayout::Interleaved => write!(f, "interleaved"),
            IndexLayout::Idxvgs => write!(f, "idxvgs"),
        }
    }
}

/// Offsets of each monitored node's voltage magnitude, voltage angle and
/// frequency. The three lists are parallel to `nodes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMap {
    nodes: Vec<u32>,
    vm: Vec<usize>,
    am: Vec<usize>,
    w: Vec<usize>,
}

fn offsets(
    field: &'static str,
    table: &[f64],
    nodes: &[u32],
) -> Result<Vec<usize>, IndexMapError> {
    let mut seen = HashSet::with_capacity(nodes.len());
    let mut result = Vec::with_capacity(nodes.len());
    for &node in nodes {
        let value = (node as usize)
            .checked_sub(1)
            .and_then(|i| table.get(i))
            .copied()
            .ok_or(IndexMapError::MissingEntry {
                field,
                node,
                len: table.len(),
            })?;
        if !value.is_finite() || value < 1.0 || value.fract() != 0.0 {
            return Err(IndexMapError::InvalidEntry { field, node, value });
        }
        let offset = value as usize - 1;
        if !seen.insert(offset) {
            return Err(IndexMapError::DuplicateOffset { field, offset });
        }
        result.push(offset);
    }
    Ok(result)
}

impl IndexMap {
    /// Builds the mapping for `nodes` (1-based bus indices) in `layout`.
    pub fn build(
        layout: IndexLayout,
        idxvgs: &Idxvgs,
        nodes: &[u32],
    ) -> Result<Self, IndexMapError> {
        match layout {
            IndexLayout::Interleaved => Self::interleaved(nodes),
            IndexLayout::Idxvgs => Self::from_idxvgs(idxvgs, nodes),
        }
    }

    /// Bus `i` at `vm = 3i-3`, `am = 3i-2`, `w = 3i-1`.
    pub fn interleaved(nodes: &[u32]) -> Result<Self, IndexMapError> {
        if nodes.is_empty() {
            return Err(IndexMapError::EmptyIndices);
        }
        let mut seen = HashSet::with_capacity(nodes.len());
        for &node in nodes {
            if node == 0 {
                return Err(IndexMapError::InvalidEntry {
                    field: "node",
                    node,
                    value: 0.0,
                });
            }
            if !seen.insert(node) {
                return Err(IndexMapError::DuplicateOffset {
                    field: "vm",
                    offset: 3 * (node as usize - 1),
                });
            }
        }
        let base = |shift: usize| nodes.iter().map(|&n| 3 * (n as usize - 1) + shift).collect();
        Ok(IndexMap {
            nodes: nodes.to_vec(),
            vm: base(0),
            am: base(1),
            w: base(2),
        })
    }

    /// Builds the mapping for `nodes` from the offsets listed in `Idxvgs`.
    pub fn from_idxvgs(idxvgs: &Idxvgs, nodes: &[u32]) -> Result<Self, IndexMapError> {
        if nodes.is_empty() {
            return Err(IndexMapError::EmptyIndices);
        }
        Ok(IndexMap {
            nodes: nodes.to_vec(),
            vm: offsets("Pmu.vm", &idxvgs.pmu.vm, nodes)?,
            am: offsets("Pmu.am", &idxvgs.pmu.am, nodes)?,
            w: offsets("Bus.w_Busfreq", &idxvgs.bus.w_busfreq, nodes)?,
        })
    }

    pub fn nodes(&self) -> &[u32] {
        &self.nodes
    }

    pub fn vm(&self) -> &[usize] {
        &self.vm
    }

    pub fn am(&self) -> &[usize] {
        &self.am
    }

    pub fn w(&self) -> &[usize] {
        &self.w
    }

    /// Largest offset read from the variable vector.
    pub fn max_offset(&self) -> usize {
        self.vm
            .iter()
            .chain(&self.am)
            .chain(&self.w)
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// Width of a selected row: `[vm.., am.., w..]`.
    pub fn width(&self) -> usize {
        3 * self.nodes.len()
    }

    /// Picks the monitored values out of a full variable vector.
    pub fn select(&self, vars: &[f64]) -> Result<Vec<f64>, IndexMapError> {
        self.vm
            .iter()
            .chain(&self.am)
            .chain(&self.w)
            .map(|&offset| {
                vars.get(offset)
                    .copied()
                    .ok_or(IndexMapError::VectorTooShort {
                        offset,
                        len: vars.len(),
                    })
            })
            .collect()
    }

    /// Column names matching `select`'s layout.
    pub fn column_names(&self) -> Vec<String> {
        column_names(&self.nodes)
    }
}

/// `vm_<node>.., am_<node>.., w_<node>..` for a row selected for `nodes`.
pub fn column_names(nodes: &[u32]) -> Vec<String> {
    ["vm", "am", "w"]
        .iter()
        .flat_map(|field| nodes.iter().map(move |n| format!("{}_{}", field, n)))
        .collect()
}
