//! Typed readers for the `/proc` records sampled on every tick
//!
//! Every reader separates "the record is gone" (`Ok(None)`: the process or
//! thread exited between discovery and read) from "the record is there but
//! does not parse" (`Err(ProcError::Malformed)`). Callers skip the first
//! silently and log the second.
//!
//! All paths are resolved against a configurable root so the sampling engine
//! can run against a synthetic tree in tests.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Mount point of the live process filesystem
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Tag of the proportional set size line in `smaps_rollup`
const PSS_TAG: &str = "Pss:";

/// Errors raised while reading process records
#[derive(Error, Debug)]
pub enum ProcError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed record {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Result type for process record reads
pub type Result<T> = std::result::Result<T, ProcError>;

/// The fields of a `stat` record used by the sampler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRecord {
    pub pid: u32,
    /// Executable name, as shown between the parentheses
    pub comm: String,
    pub ppid: u32,
    /// User-mode CPU time, in clock ticks
    pub utime: u64,
    /// Kernel-mode CPU time, in clock ticks
    pub stime: u64,
    /// Resident set size, in pages
    pub rss_pages: u64,
}

impl StatRecord {
    /// Parse a single `stat` line.
    ///
    /// `comm` may itself contain spaces and parentheses, so the line is split
    /// at the last `)` and only the remainder is tokenized.
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let open = line.find('(').ok_or("missing '(' before comm")?;
        let close = line.rfind(')').ok_or("missing ')' after comm")?;
        if close < open {
            return Err("unbalanced comm parentheses".to_string());
        }

        let pid = line[..open]
            .trim()
            .parse()
            .map_err(|e| format!("bad pid: {}", e))?;
        let comm = line[open + 1..close].to_string();

        // Fields after comm: state(0) ppid(1) pgrp(2) session(3) tty_nr(4)
        // tpgid(5) flags(6) minflt(7) cminflt(8) majflt(9) cmajflt(10)
        // utime(11) stime(12) cutime(13) cstime(14) priority(15) nice(16)
        // num_threads(17) itrealvalue(18) starttime(19) vsize(20) rss(21)
        let fields: Vec<&str> = line[close + 1..].split_whitespace().collect();
        let ppid = stat_field(&fields, 1, "ppid")?;
        let utime = stat_field(&fields, 11, "utime")?;
        let stime = stat_field(&fields, 12, "stime")?;
        let rss: i64 = stat_field(&fields, 21, "rss")?;

        Ok(Self {
            pid,
            comm,
            ppid,
            utime,
            stime,
            rss_pages: rss.max(0) as u64,
        })
    }

    /// Cumulative CPU time (user + system), in clock ticks
    pub fn cpu_ticks(&self) -> u64 {
        self.utime.saturating_add(self.stime)
    }
}

fn stat_field<T>(fields: &[&str], idx: usize, name: &str) -> std::result::Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    fields
        .get(idx)
        .ok_or_else(|| format!("missing {} field", name))?
        .parse()
        .map_err(|e| format!("bad {}: {}", name, e))
}

/// Parse a directory entry name as a pid: it must consist only of digits
pub fn parse_pid(name: &str) -> Option<u32> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Extract the value following the `Pss:` tag of a `smaps_rollup` file, in kB
pub fn parse_pss_kib(contents: &str) -> Option<u64> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(PSS_TAG))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Whether a read failure means the record vanished rather than broke
fn is_gone(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(libc::ESRCH)
}

/// Read a whole file, mapping "vanished" to `None`
fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if is_gone(&e) => Ok(None),
        Err(source) => Err(ProcError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Reader for a process filesystem rooted at a given directory
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs {
    /// Reader for the live `/proc`
    pub fn new() -> Self {
        Self::with_root(DEFAULT_PROC_ROOT)
    }

    /// Reader for a process filesystem mounted (or faked) elsewhere
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// All numeric entries of the root directory
    pub fn pids(&self) -> Result<Vec<u32>> {
        let entries = fs::read_dir(&self.root).map_err(|source| ProcError::Io {
            path: self.root.clone(),
            source,
        })?;

        Ok(entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(parse_pid))
            .collect())
    }

    /// Whether the pid still has a directory
    pub fn exists(&self, pid: u32) -> bool {
        self.pid_dir(pid).is_dir()
    }

    /// The process's `stat` record
    pub fn stat(&self, pid: u32) -> Result<Option<StatRecord>> {
        self.read_stat(self.pid_dir(pid).join("stat"))
    }

    /// The `stat` record of one thread of a process
    pub fn thread_stat(&self, pid: u32, tid: u32) -> Result<Option<StatRecord>> {
        self.read_stat(
            self.pid_dir(pid)
                .join("task")
                .join(tid.to_string())
                .join("stat"),
        )
    }

    fn read_stat(&self, path: PathBuf) -> Result<Option<StatRecord>> {
        let Some(contents) = read_optional(&path)? else {
            return Ok(None);
        };
        let line = contents.lines().next().unwrap_or_default();
        StatRecord::parse(line)
            .map(Some)
            .map_err(|reason| ProcError::Malformed { path, reason })
    }

    /// Thread ids listed under the process's `task` directory.
    ///
    /// Best effort: a process that exited has no listing and yields nothing.
    pub fn threads(&self, pid: u32) -> Vec<u32> {
        let path = self.pid_dir(pid).join("task");
        match fs::read_dir(&path) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().to_str().and_then(parse_pid))
                .collect(),
            Err(e) => {
                if !is_gone(&e) {
                    tracing::debug!("Cannot list {}: {}", path.display(), e);
                }
                Vec::new()
            }
        }
    }

    /// System uptime in seconds, from the monotonic `uptime` record
    pub fn uptime(&self) -> Result<f64> {
        let path = self.root.join("uptime");
        let contents = fs::read_to_string(&path).map_err(|source| ProcError::Io {
            path: path.clone(),
            source,
        })?;
        contents
            .split_whitespace()
            .next()
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| ProcError::Malformed {
                path,
                reason: "expected a leading floating point value".to_string(),
            })
    }

    /// Proportional set size of a process in kB, from `smaps_rollup`
    pub fn pss_kib(&self, pid: u32) -> Result<Option<u64>> {
        let path = self.pid_dir(pid).join("smaps_rollup");
        let Some(contents) = read_optional(&path)? else {
            return Ok(None);
        };
        // Zombies and kernel threads have no address space to summarize
        if contents.trim().is_empty() {
            return Ok(Some(0));
        }
        parse_pss_kib(&contents)
            .map(Some)
            .ok_or_else(|| ProcError::Malformed {
                path,
                reason: format!("no numeric '{}' line", PSS_TAG),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_proc::FakeProc;

    const SAMPLE_STAT: &str = "1234 (bash) S 1000 1234 1234 34816 5678 4194304 \
        2000 30000 0 5 150 42 80 20 20 0 1 0 12345 23240704 1536 \
        18446744073709551615 1 1 0 0 0 0 65536 3686404 1266761467 0 0 0 17 3 0 0 0 0 0";

    #[test]
    fn test_parse_stat_fields() {
        let stat = StatRecord::parse(SAMPLE_STAT).unwrap();
        assert_eq!(stat.pid, 1234);
        assert_eq!(stat.comm, "bash");
        assert_eq!(stat.ppid, 1000);
        assert_eq!(stat.utime, 150);
        assert_eq!(stat.stime, 42);
        assert_eq!(stat.rss_pages, 1536);
        assert_eq!(stat.cpu_ticks(), 192);
    }

    #[test]
    fn test_parse_stat_comm_with_spaces_and_parens() {
        let line = SAMPLE_STAT.replace("(bash)", "(my (odd) prog)");
        let stat = StatRecord::parse(&line).unwrap();
        assert_eq!(stat.comm, "my (odd) prog");
        assert_eq!(stat.ppid, 1000);
        assert_eq!(stat.rss_pages, 1536);
    }

    #[test]
    fn test_parse_stat_truncated() {
        let err = StatRecord::parse("1234 (bash) S 1000 1234").unwrap_err();
        assert!(err.contains("utime"));
    }

    #[test]
    fn test_parse_stat_garbage() {
        assert!(StatRecord::parse("").is_err());
        assert!(StatRecord::parse("not a stat line").is_err());
        assert!(StatRecord::parse("12 bash) S 1").is_err());
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("42"), Some(42));
        assert_eq!(parse_pid("0"), Some(0));
        assert_eq!(parse_pid("self"), None);
        assert_eq!(parse_pid("-1"), None);
        assert_eq!(parse_pid("12a"), None);
        assert_eq!(parse_pid(""), None);
    }

    #[test]
    fn test_parse_pss_ignores_similar_tags() {
        let rollup = "00400000-7ffd [rollup]\nRss:    2048 kB\nPss_Anon:  10 kB\nPss:   1500 kB\n";
        assert_eq!(parse_pss_kib(rollup), Some(1500));
        assert_eq!(parse_pss_kib("Rss: 10 kB\nPss_Anon: 5 kB\n"), None);
    }

    #[test]
    fn test_pids_skips_non_numeric_entries() {
        let fake = FakeProc::new();
        fake.add_process(10, 1, 100);
        fake.add_process(11, 10, 100);
        fake.add_dir("self");
        fake.add_dir("sys");

        let mut pids = fake.procfs().pids().unwrap();
        pids.sort_unstable();
        assert_eq!(pids, vec![10, 11]);
    }

    #[test]
    fn test_missing_records_are_none() {
        let fake = FakeProc::new();
        let procfs = fake.procfs();
        assert!(procfs.stat(999).unwrap().is_none());
        assert!(procfs.thread_stat(999, 999).unwrap().is_none());
        assert!(procfs.pss_kib(999).unwrap().is_none());
        assert!(procfs.threads(999).is_empty());
        assert!(!procfs.exists(999));
    }

    #[test]
    fn test_pss_of_zombie_is_zero() {
        let fake = FakeProc::new();
        fake.add_process(40, 1, 0);
        fake.write_file("40/smaps_rollup", "");
        assert_eq!(fake.procfs().pss_kib(40).unwrap(), Some(0));

        fake.write_file("40/smaps_rollup", "garbage\n");
        assert!(fake.procfs().pss_kib(40).is_err());
    }

    #[test]
    fn test_malformed_stat_is_error() {
        let fake = FakeProc::new();
        fake.write_file("77/stat", "77 (broken");
        let err = fake.procfs().stat(77).unwrap_err();
        assert!(matches!(err, ProcError::Malformed { .. }));
        assert!(err.to_string().contains("77/stat"));
    }

    #[test]
    fn test_uptime() {
        let fake = FakeProc::new();
        fake.set_uptime(3021.75);
        assert!((fake.procfs().uptime().unwrap() - 3021.75).abs() < 1e-9);

        fake.write_file("uptime", "garbage");
        assert!(fake.procfs().uptime().is_err());
    }

    #[test]
    fn test_threads_and_thread_stat() {
        let fake = FakeProc::new();
        fake.add_process(20, 1, 10);
        fake.add_thread(20, 20, 5);
        fake.add_thread(20, 21, 7);

        let procfs = fake.procfs();
        let mut tids = procfs.threads(20);
        tids.sort_unstable();
        assert_eq!(tids, vec![20, 21]);
        assert_eq!(procfs.thread_stat(20, 21).unwrap().unwrap().cpu_ticks(), 7);
    }

    #[test]
    fn test_live_proc_self() {
        let procfs = ProcFs::new();
        let me = std::process::id();
        let stat = procfs.stat(me).unwrap().expect("own stat record");
        assert_eq!(stat.pid, me);
        assert!(procfs.exists(me));
        assert!(procfs.threads(me).contains(&me));
        assert!(procfs.uptime().unwrap() > 0.0);
    }
}
