//! Memory aggregation over a process subtree
//!
//! Sums the memory of a root process and every process transitively parented
//! under it, in either resident (RSS) or proportional (PSS) mode.

use std::collections::HashSet;
use std::fmt;

use nix::unistd::{sysconf, SysconfVar};
use serde::{Deserialize, Serialize};

use crate::discovery::ProcessTable;
use crate::procfs::{ProcError, ProcFs};

const FALLBACK_PAGE_SIZE: u64 = 4096;

/// How the memory of one process is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    /// Resident pages from `stat`, shared pages counted in full
    Rss,
    /// Proportional set size from `smaps_rollup`, shared pages apportioned
    Pss,
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryMode::Rss => write!(f, "RSS"),
            MemoryMode::Pss => write!(f, "PSS"),
        }
    }
}

/// System page size in bytes
pub fn page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Memory of one subtree at one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub bytes: u64,
    /// Every pid visited by the walk, root first
    pub pids: Vec<u32>,
    /// Visited processes that still had a record to read
    pub live: usize,
}

/// Walks a process subtree and sums its memory
#[derive(Debug)]
pub struct MemoryAggregator {
    procfs: ProcFs,
    mode: MemoryMode,
    page_size: u64,
    /// Set once a PSS read succeeded, so later misses mean "process gone"
    pss_confirmed: bool,
    /// Pids whose `smaps_rollup` is unreadable to us; measured by RSS instead
    pss_denied: HashSet<u32>,
}

impl MemoryAggregator {
    pub fn new(procfs: ProcFs, mode: MemoryMode, page_size: u64) -> Self {
        Self {
            procfs,
            mode,
            page_size,
            pss_confirmed: false,
            pss_denied: HashSet::new(),
        }
    }

    /// Current mode; may have dropped from PSS to RSS during the run
    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    /// Sum memory over `root_pid` and all of its descendants in `table`.
    ///
    /// The root is visited even when the table does not list it. Each pid is
    /// visited at most once.
    pub fn aggregate_memory(&mut self, root_pid: u32, table: &ProcessTable) -> MemorySample {
        let mut visited = HashSet::new();
        let mut stack = vec![root_pid];
        let mut sample = MemorySample::default();

        while let Some(pid) = stack.pop() {
            if !visited.insert(pid) {
                continue;
            }
            if let Some(bytes) = self.measure(pid) {
                sample.bytes += bytes;
                sample.live += 1;
            }
            sample.pids.push(pid);
            stack.extend(table.children(pid).iter().rev());
        }

        sample
    }

    /// Memory of a single process in bytes; zero if it is gone or unreadable
    pub fn read_memory(&mut self, pid: u32) -> u64 {
        self.measure(pid).unwrap_or(0)
    }

    /// `None` when the process has no record left to read
    fn measure(&mut self, pid: u32) -> Option<u64> {
        if self.mode == MemoryMode::Pss && !self.pss_denied.contains(&pid) {
            match self.procfs.pss_kib(pid) {
                Ok(Some(kib)) => {
                    self.pss_confirmed = true;
                    return Some(kib * 1024);
                }
                Ok(None) if !self.pss_confirmed && self.procfs.exists(pid) => {
                    tracing::warn!(
                        "PSS memory requested but this kernel has no smaps_rollup; \
                         falling back to RSS for the rest of the run"
                    );
                    self.mode = MemoryMode::Rss;
                }
                Ok(None) => return None,
                Err(ProcError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::PermissionDenied =>
                {
                    tracing::warn!("No access to PSS of pid {}; measuring its RSS instead", pid);
                    self.pss_denied.insert(pid);
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    return Some(0);
                }
            }
        }

        match self.procfs.stat(pid) {
            Ok(stat) => stat.map(|s| s.rss_pages * self.page_size),
            Err(e) => {
                tracing::warn!("{}", e);
                Some(0)
            }
        }
    }
}
