//! Resource requests: cores, node class, processes and wall-clock limit.
//!
//! A `Resources` value is immutable; escalation after a TIMEOUT or MEMORY
//! failure produces a new value (see [`Resources::bigger`]).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::core::task::TaskState;
use crate::{Error, Result};

/// Default wall-clock limit: 10 minutes.
pub const DEFAULT_TMAX: u64 = 600;

/// Upper bound for TIMEOUT escalation: 2 days.
pub const MAX_TMAX: u64 = 2 * 86_400;

/// Time units, largest first.
const TIME_UNITS: [(char, u64); 4] = [('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)];

/// A node class as configured (or reported by `Scheduler::get_config`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub cores: u32,
    /// Memory per node, e.g. `"256G"` or `"191GB"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// Extra submission arguments for this node class.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl Node {
    pub fn new(name: &str, cores: u32) -> Self {
        Self {
            name: name.to_string(),
            cores,
            memory: None,
            extra_args: Vec::new(),
        }
    }

    /// Memory of the node in bytes, if advertised.
    pub fn memory_bytes(&self) -> Result<Option<u64>> {
        self.memory.as_deref().map(parse_memory).transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resources {
    cores: u32,
    nodename: Option<String>,
    processes: u32,
    tmax: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cores: 1,
            nodename: None,
            processes: 1,
            tmax: DEFAULT_TMAX,
        }
    }
}

impl Resources {
    /// Create a resource request. `processes == 0` means one process per core.
    pub fn new(cores: u32, nodename: Option<String>, processes: u32, tmax: u64) -> Result<Self> {
        if cores == 0 {
            return Err(Error::InvalidResources(
                "cores must be at least 1".to_string(),
            ));
        }
        if nodename.as_deref() == Some("") {
            return Err(Error::InvalidResources("empty node name".to_string()));
        }
        Ok(Self {
            cores,
            nodename,
            processes: if processes == 0 { cores } else { processes },
            tmax,
        })
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    pub fn nodename(&self) -> Option<&str> {
        self.nodename.as_deref()
    }

    pub fn processes(&self) -> u32 {
        self.processes
    }

    /// Wall-clock limit in seconds.
    pub fn tmax(&self) -> u64 {
        self.tmax
    }

    /// Pick a node class and the number of nodes needed.
    ///
    /// With an explicit node name, that node must exist. Otherwise the
    /// first node (in list order) whose core count divides the request
    /// wins; failing that, the node with the fewest cores (ties go to the
    /// smaller name).
    pub fn select<'a>(&self, nodes: &'a [Node]) -> Result<(u32, &'a Node)> {
        if let Some(name) = &self.nodename {
            let node = nodes
                .iter()
                .find(|node| &node.name == name)
                .ok_or_else(|| Error::NoSuchNode(name.clone()))?;
            return Ok((node_count(self.cores, node)?, node));
        }

        let node = nodes
            .iter()
            .find(|node| node.cores > 0 && self.cores % node.cores == 0)
            .or_else(|| {
                nodes
                    .iter()
                    .min_by(|a, b| a.cores.cmp(&b.cores).then_with(|| a.name.cmp(&b.name)))
            })
            .ok_or_else(|| Error::Validation("No nodes configured".to_string()))?;
        Ok((node_count(self.cores, node)?, node))
    }

    /// Escalate after a failure.
    ///
    /// TIMEOUT doubles `tmax` (capped at `maxtmax`). MEMORY moves to the
    /// smallest `n * node_cores` (n = 1, 2, ...) above the current cores.
    pub fn bigger(&self, state: TaskState, nodes: &[Node], maxtmax: u64) -> Result<Resources> {
        match state {
            TaskState::Timeout => Ok(Resources {
                tmax: self.tmax.max(1).saturating_mul(2).min(maxtmax),
                ..self.clone()
            }),
            TaskState::Memory => {
                let sizes: BTreeSet<u64> = nodes
                    .iter()
                    .filter(|node| node.cores > 0)
                    .map(|node| u64::from(node.cores))
                    .collect();
                if sizes.is_empty() {
                    return Err(Error::Validation("No nodes configured".to_string()));
                }
                let current = u64::from(self.cores);
                let cores = (1u64..)
                    .find_map(|n| sizes.iter().map(|c| n * c).find(|total| *total > current))
                    .ok_or_else(|| Error::Validation("No bigger node configuration".to_string()))?;
                let cores = u32::try_from(cores)
                    .map_err(|_| Error::InvalidResources(format!("{} cores", cores)))?;
                let processes = if self.processes == self.cores {
                    cores
                } else {
                    self.processes
                };
                Ok(Resources {
                    cores,
                    processes,
                    ..self.clone()
                })
            }
            other => Err(Error::InvalidEscalation(other.to_string())),
        }
    }
}

fn node_count(cores: u32, node: &Node) -> Result<u32> {
    if node.cores == 0 {
        return Err(Error::Validation(format!(
            "Node {:?} has zero cores",
            node.name
        )));
    }
    Ok(cores.div_ceil(node.cores))
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cores)?;
        if let Some(name) = &self.nodename {
            write!(f, ":{}", name)?;
        }
        if self.processes != self.cores {
            write!(f, ":{}", self.processes)?;
        }
        write!(f, ":{}", seconds_to_time_string(self.tmax))
    }
}

impl FromStr for Resources {
    type Err = Error;

    /// Parse `cores[:nodename][:processes]:tmax`, e.g. `24:xeon24:1h`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidResources(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        let (cores, nodename, processes, tmax) = match parts.as_slice() {
            [cores, tmax] => (*cores, None, None, *tmax),
            [cores, middle, tmax] => {
                if middle.parse::<u32>().is_ok() {
                    (*cores, None, Some(*middle), *tmax)
                } else {
                    (*cores, Some(*middle), None, *tmax)
                }
            }
            [cores, nodename, processes, tmax] => (*cores, Some(*nodename), Some(*processes), *tmax),
            _ => return Err(bad()),
        };
        let cores = cores.parse::<u32>().map_err(|_| bad())?;
        let processes = match processes {
            Some(p) => p.parse::<u32>().map_err(|_| bad())?,
            None => 0,
        };
        let tmax = parse_time(tmax)?;
        Resources::new(cores, nodename.map(str::to_string), processes, tmax).map_err(|_| bad())
    }
}

impl TryFrom<String> for Resources {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Resources> for String {
    fn from(r: Resources) -> Self {
        r.to_string()
    }
}

fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)([smhd])$").expect("valid regex"))
}

fn memory_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(\d+(?:\.\d+)?)\s*([kmgt]?)b?$").expect("valid regex"))
}

/// Parse `<int><unit>` with unit one of `s`, `m`, `h`, `d` into seconds.
pub fn parse_time(s: &str) -> Result<u64> {
    let caps = time_regex()
        .captures(s)
        .ok_or_else(|| Error::InvalidResources(format!("bad time: {:?}", s)))?;
    let value: u64 = caps[1]
        .parse()
        .map_err(|_| Error::InvalidResources(format!("bad time: {:?}", s)))?;
    let unit = caps[2].chars().next().unwrap_or('s');
    let factor = TIME_UNITS
        .iter()
        .find(|(u, _)| *u == unit)
        .map(|(_, f)| *f)
        .unwrap_or(1);
    value
        .checked_mul(factor)
        .ok_or_else(|| Error::InvalidResources(format!("time out of range: {:?}", s)))
}

/// Render seconds with the largest unit that divides them evenly.
pub fn seconds_to_time_string(seconds: u64) -> String {
    if seconds == 0 {
        return "0s".to_string();
    }
    for (unit, factor) in TIME_UNITS {
        if seconds % factor == 0 {
            return format!("{}{}", seconds / factor, unit);
        }
    }
    format!("{}s", seconds)
}

/// Parse a memory string such as `191GB`, `64G` or `512M` into bytes.
pub fn parse_memory(s: &str) -> Result<u64> {
    let caps = memory_regex()
        .captures(s.trim())
        .ok_or_else(|| Error::InvalidResources(format!("bad memory: {:?}", s)))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|_| Error::InvalidResources(format!("bad memory: {:?}", s)))?;
    let factor: u64 = match caps[2].to_ascii_uppercase().as_str() {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        _ => 1 << 40,
    };
    Ok((value * factor as f64) as u64)
}
