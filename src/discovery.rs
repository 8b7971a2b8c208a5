//! Process discovery: the live pid set and its parent/child relation
//!
//! A [`ProcessTable`] is rebuilt from scratch on every tick and discarded
//! afterwards; nothing here persists between invocations.

use std::collections::HashMap;

use crate::procfs::{ProcError, ProcFs};

/// Parent of every kernel thread on Linux
pub const KTHREADD_PID: u32 = 2;

/// Decides whether a discovered process may be part of a tracked tree
pub type TrackablePredicate = fn(&ProcessRecord) -> bool;

/// A live process and its immediate parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent_pid: u32,
}

/// Default predicate: reject kernel threads, which all hang off `kthreadd`
pub fn not_kernel_thread(record: &ProcessRecord) -> bool {
    record.parent_pid != KTHREADD_PID
}

/// Immediate parent of `pid`, or `None` if the process vanished.
///
/// A record that exists but cannot be parsed is logged and treated as
/// vanished.
pub fn read_parent(procfs: &ProcFs, pid: u32) -> Option<u32> {
    match procfs.stat(pid) {
        Ok(stat) => stat.map(|s| s.ppid),
        Err(e @ ProcError::Malformed { .. }) => {
            tracing::warn!("{}", e);
            None
        }
        Err(e) => {
            tracing::debug!("Skipping pid {}: {}", pid, e);
            None
        }
    }
}

/// One tick's snapshot of the trackable processes
#[derive(Debug, Default)]
pub struct ProcessTable {
    records: Vec<ProcessRecord>,
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessTable {
    /// Build a table and its parent -> children index
    pub fn from_records(records: Vec<ProcessRecord>) -> Self {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for record in &records {
            children
                .entry(record.parent_pid)
                .or_default()
                .push(record.pid);
        }
        Self { records, children }
    }

    pub fn records(&self) -> &[ProcessRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Immediate children of `pid` in this snapshot
    pub fn children(&self, pid: u32) -> &[u32] {
        self.children.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.records.iter().any(|r| r.pid == pid)
    }
}

/// Scan the live process set.
///
/// Non-numeric entries are skipped, processes that exit between the listing
/// and the parent lookup are dropped, and records rejected by `is_trackable`
/// are excluded.
pub fn list_processes(
    procfs: &ProcFs,
    is_trackable: TrackablePredicate,
) -> Result<ProcessTable, ProcError> {
    let records = procfs
        .pids()?
        .into_iter()
        .filter_map(|pid| {
            read_parent(procfs, pid).map(|parent_pid| ProcessRecord { pid, parent_pid })
        })
        .filter(|record| is_trackable(record))
        .collect();

    Ok(ProcessTable::from_records(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_proc::FakeProc;

    fn sorted(mut pids: Vec<u32>) -> Vec<u32> {
        pids.sort_unstable();
        pids
    }

    #[test]
    fn test_kernel_threads_excluded() {
        let fake = FakeProc::new();
        fake.add_process(1, 0, 10);
        fake.add_process(2, 0, 0);
        fake.add_process(3, 2, 0); // kworker
        fake.add_process(4, 2, 0); // ksoftirqd
        fake.add_process(100, 1, 10);

        let table = list_processes(&fake.procfs(), not_kernel_thread).unwrap();
        let pids = sorted(table.records().iter().map(|r| r.pid).collect());
        assert_eq!(pids, vec![1, 2, 100]);
        assert!(!table.contains(3));
    }

    #[test]
    fn test_custom_predicate() {
        let fake = FakeProc::new();
        fake.add_process(1, 0, 10);
        fake.add_process(50, 1, 10);
        fake.add_process(51, 50, 10);

        fn only_under_50(record: &ProcessRecord) -> bool {
            record.parent_pid == 50
        }
        let table = list_processes(&fake.procfs(), only_under_50).unwrap();
        assert_eq!(table.records(), &[ProcessRecord { pid: 51, parent_pid: 50 }]);
    }

    #[test]
    fn test_children_index() {
        let table = ProcessTable::from_records(vec![
            ProcessRecord { pid: 10, parent_pid: 1 },
            ProcessRecord { pid: 11, parent_pid: 10 },
            ProcessRecord { pid: 12, parent_pid: 10 },
            ProcessRecord { pid: 13, parent_pid: 12 },
        ]);
        assert_eq!(sorted(table.children(10).to_vec()), vec![11, 12]);
        assert_eq!(table.children(12), &[13]);
        assert!(table.children(13).is_empty());
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_read_parent_vanished_and_malformed() {
        let fake = FakeProc::new();
        fake.write_file("66/stat", "66 (half");
        let procfs = fake.procfs();
        assert_eq!(read_parent(&procfs, 65), None);
        assert_eq!(read_parent(&procfs, 66), None);
    }

    #[test]
    fn test_malformed_entries_do_not_abort_listing() {
        let fake = FakeProc::new();
        fake.add_process(1, 0, 10);
        fake.write_file("66/stat", "66 (half");
        fake.add_dir("net");

        let table = list_processes(&fake.procfs(), not_kernel_thread).unwrap();
        assert_eq!(table.records(), &[ProcessRecord { pid: 1, parent_pid: 0 }]);
    }

    #[test]
    fn test_live_listing_contains_self() {
        let table = list_processes(&ProcFs::new(), not_kernel_thread).unwrap();
        assert!(table.contains(std::process::id()));
    }
}
