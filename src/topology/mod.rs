//! CPU topology discovery and co-residency verification.
//!
//! `CpuTopology` is a read-only snapshot of the online logical CPUs taken once at startup;
//! CPU hotplug is not tracked. `CoresidencyVerifier` proves that two logical CPUs share a
//! last-level cache, the hard precondition for the flush+reload channel.
pub mod affinity;
mod coresidency;

pub use self::affinity::{current_cpu, pin_current_thread};
pub use self::coresidency::{sample_reloads, CoresidencyResult, CoresidencyVerifier};

use std::{
    fs,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use serde::Serialize;

const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CpuInfo {
    pub logical_id: usize,
    pub socket_id: usize,
    pub core_id: usize,
    pub is_ht_sibling: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct CpuTopology {
    cpus: Vec<CpuInfo>,
    core_count: usize,
    socket_count: usize,
}

impl CpuTopology {
    /// Enumerate online CPUs from sysfs.
    pub fn detect() -> Self {
        let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        let online = if online < 1 { 1 } else { online as usize };
        Self::detect_from(Path::new(SYSFS_CPU_ROOT), online)
    }

    /// Read socket and core ids for CPUs `0..num_cpus` below `root`. Missing or malformed
    /// entries read as 0.
    pub fn detect_from(root: &Path, num_cpus: usize) -> Self {
        let ids = (0..num_cpus)
            .map(|cpu| {
                let topo = root.join(format!("cpu{}", cpu)).join("topology");
                (
                    read_id(topo.join("physical_package_id")),
                    read_id(topo.join("core_id")),
                )
            })
            .collect::<Vec<_>>();
        Self::from_ids(&ids)
    }

    /// Build a topology from `(socket_id, core_id)` pairs indexed by logical CPU.
    pub fn from_ids(ids: &[(usize, usize)]) -> Self {
        let mut cpus = ids
            .iter()
            .enumerate()
            .map(|(logical_id, &(socket_id, core_id))| CpuInfo {
                logical_id,
                socket_id,
                core_id,
                is_ht_sibling: false,
            })
            .collect::<Vec<_>>();
        // pairwise scan, P is small
        for i in 0..cpus.len() {
            for j in i + 1..cpus.len() {
                if cpus[i].socket_id == cpus[j].socket_id && cpus[i].core_id == cpus[j].core_id {
                    cpus[i].is_ht_sibling = true;
                    cpus[j].is_ht_sibling = true;
                }
            }
        }
        let core_count = cpus.iter().map(|c| c.core_id).max().map_or(0, |m| m + 1);
        let socket_count = cpus.iter().map(|c| c.socket_id).max().map_or(0, |m| m + 1);
        CpuTopology {
            cpus,
            core_count,
            socket_count,
        }
    }

    pub fn cpus(&self) -> &[CpuInfo] {
        &self.cpus
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn core_count(&self) -> usize {
        self.core_count
    }

    pub fn socket_count(&self) -> usize {
        self.socket_count
    }

    pub fn cpu(&self, logical_id: usize) -> Option<&CpuInfo> {
        self.cpus.get(logical_id)
    }

    /// True if both CPUs exist and share socket and core id.
    pub fn are_siblings(&self, a: usize, b: usize) -> bool {
        match (self.cpu(a), self.cpu(b)) {
            (Some(a), Some(b)) => a.socket_id == b.socket_id && a.core_id == b.core_id,
            _ => false,
        }
    }

    /// The first other logical CPU on the same physical core.
    pub fn ht_sibling_of(&self, cpu: usize) -> Option<usize> {
        self.cpus
            .iter()
            .map(|c| c.logical_id)
            .find(|&other| other != cpu && self.are_siblings(cpu, other))
    }

    /// All other logical CPUs on the same socket.
    pub fn llc_sharers(&self, cpu: usize) -> Vec<usize> {
        let Some(target) = self.cpu(cpu) else {
            return vec![];
        };
        self.cpus
            .iter()
            .filter(|c| c.logical_id != cpu && c.socket_id == target.socket_id)
            .map(|c| c.logical_id)
            .collect()
    }

    /// Pairs `(a, b)` with `a < b` on the same socket, in scan order.
    pub fn same_socket_pairs(&self) -> Vec<(usize, usize)> {
        self.cpus
            .iter()
            .tuple_combinations()
            .filter(|(a, b)| a.socket_id == b.socket_id)
            .map(|(a, b)| (a.logical_id, b.logical_id))
            .collect()
    }

    pub fn log(&self) {
        info!(
            "CPU topology: {} CPUs, {} cores, {} sockets",
            self.num_cpus(),
            self.core_count,
            self.socket_count
        );
        for cpu in &self.cpus {
            debug!(
                "  CPU {:>3}  socket {:>2}  core {:>3}  HT {}",
                cpu.logical_id,
                cpu.socket_id,
                cpu.core_id,
                if cpu.is_ht_sibling { "Y" } else { "N" }
            );
        }
    }
}

fn read_id(path: PathBuf) -> usize {
    match fs::read_to_string(&path) {
        Ok(s) => s.trim().parse().unwrap_or_else(|e| {
            warn!("Malformed topology entry {:?}: {}", path, e);
            0
        }),
        Err(e) => {
            debug!("Cannot read {:?}: {}", path, e);
            0
        }
    }
}
