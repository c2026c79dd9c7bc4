//! CPU topology: hyperthread sibling discovery and the two CPU orderings
//! derived from it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::CpError;

/// Abstraction over where topology facts come from, so tests can supply a
/// fixture instead of touching `/sys`.
pub trait TopologySource {
    /// Number of physical cores, derived from CPU 0's `core_siblings_list`.
    fn core_count(&self) -> Result<usize, CpError>;

    /// Thread siblings (as physical cpu ids) of the given physical cpu.
    fn thread_siblings(&self, physical_cpu: u32) -> Result<Vec<u32>, CpError>;

    /// Available scaling frequencies, ascending, in kHz.
    fn available_frequencies_khz(&self) -> Result<Vec<u64>, CpError>;
}

pub struct SysfsTopologySource {
    root: PathBuf,
}

impl SysfsTopologySource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn read_list(path: &Path) -> Result<Vec<u32>, CpError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CpError::TopologyUnavailable(format!("{}: {}", path.display(), e)))?;
        parse_cpu_list(text.trim())
            .map_err(|e| CpError::TopologyUnavailable(format!("{}: {}", path.display(), e)))
    }
}

/// Parses a comma/dash cpulist such as `0,2` or `0-3,8`.
fn parse_cpu_list(s: &str) -> Result<Vec<u32>, String> {
    let mut out = Vec::new();
    for tok in s.split(',') {
        let tok = tok.trim();
        if tok.is_empty() {
            continue;
        }
        if let Some((a, b)) = tok.split_once('-') {
            let a: u32 = a.trim().parse().map_err(|_| format!("bad range {tok}"))?;
            let b: u32 = b.trim().parse().map_err(|_| format!("bad range {tok}"))?;
            out.extend(a..=b);
        } else {
            out.push(tok.parse().map_err(|_| format!("bad cpu id {tok}"))?);
        }
    }
    Ok(out)
}

impl TopologySource for SysfsTopologySource {
    fn core_count(&self) -> Result<usize, CpError> {
        let siblings = Self::read_list(
            &self
                .root
                .join("cpu0/topology/core_siblings_list"),
        )?;
        if siblings.is_empty() {
            return Err(CpError::TopologyUnavailable(
                "core_siblings_list is empty".to_string(),
            ));
        }
        Ok(siblings.len() / 2)
    }

    fn thread_siblings(&self, physical_cpu: u32) -> Result<Vec<u32>, CpError> {
        Self::read_list(&self.root.join(format!(
            "cpu{physical_cpu}/topology/thread_siblings_list"
        )))
    }

    fn available_frequencies_khz(&self) -> Result<Vec<u64>, CpError> {
        let path = self.root.join("cpu0/cpufreq/scaling_available_frequencies");
        let text = std::fs::read_to_string(&path)
            .map_err(|e| CpError::TopologyUnavailable(format!("{}: {}", path.display(), e)))?;
        let mut freqs: Vec<u64> = text
            .split_whitespace()
            .map(|tok| tok.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|e| CpError::TopologyUnavailable(format!("{}: {}", path.display(), e)))?;
        freqs.sort_unstable();
        Ok(freqs)
    }
}

/// Fixture topology source for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTopologySource {
    pub core_count: usize,
    pub siblings: HashMap<u32, Vec<u32>>,
    pub frequencies_khz: Vec<u64>,
}

impl TopologySource for StaticTopologySource {
    fn core_count(&self) -> Result<usize, CpError> {
        Ok(self.core_count)
    }

    fn thread_siblings(&self, physical_cpu: u32) -> Result<Vec<u32>, CpError> {
        Ok(self.siblings.get(&physical_cpu).cloned().unwrap_or_default())
    }

    fn available_frequencies_khz(&self) -> Result<Vec<u64>, CpError> {
        Ok(self.frequencies_khz.clone())
    }
}

/// The two CPU orderings derived from topology, indexed by logical cpu.
#[derive(Debug, Clone, Default)]
pub struct CpuLists {
    /// Siblings adjacent: "first N" selects whole cores when N is even.
    pub ht_interleaved: Vec<usize>,
    /// Primaries first, siblings appended: "first N" (N <= cores) selects
    /// N distinct physical cores.
    pub ht_at_the_end: Vec<usize>,
}

/// Computes [`CpuLists`] for `nr_cpus` logical cpus whose physical ids are
/// `cpu_table[0..nr_cpus]`, using `source` for sibling lookups.
pub fn compute_cpu_lists(
    source: &dyn TopologySource,
    cpu_table: &[i32],
) -> Result<CpuLists, CpError> {
    let nr_cpus = cpu_table.len();
    let mut reverse_map: HashMap<i32, usize> = HashMap::new();
    for (logical, &physical) in cpu_table.iter().enumerate() {
        reverse_map.insert(physical, logical);
    }

    let mut ht_interleaved = Vec::with_capacity(nr_cpus);
    let mut ht_at_the_end = Vec::with_capacity(nr_cpus);
    let mut later: Vec<usize> = Vec::new();
    let mut emitted = vec![false; nr_cpus];

    for logical in 0..nr_cpus {
        if emitted[logical] {
            continue;
        }
        ht_interleaved.push(logical);
        ht_at_the_end.push(logical);
        emitted[logical] = true;

        let physical = cpu_table[logical];
        let siblings = source.thread_siblings(physical as u32)?;
        for sibling_physical in siblings {
            if let Some(&sibling_logical) = reverse_map.get(&(sibling_physical as i32)) {
                if sibling_logical == logical || emitted[sibling_logical] {
                    continue;
                }
                ht_interleaved.push(sibling_logical);
                later.push(sibling_logical);
                emitted[sibling_logical] = true;
            }
        }
    }
    ht_at_the_end.extend(later);

    Ok(CpuLists {
        ht_interleaved,
        ht_at_the_end,
    })
}
