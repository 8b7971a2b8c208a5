//! Synthetic process filesystem shared by the unit tests.
//!
//! Builds just enough of the `/proc` layout in a temporary directory for the
//! readers in [`crate::procfs`] to work against it.

use std::fs;
use std::path::Path;
use tempfile::TempDir;

use crate::procfs::ProcFs;

/// Render a `stat` line with the fields the sampler reads filled in
pub fn stat_line(pid: u32, comm: &str, ppid: u32, utime: u64, stime: u64, rss_pages: u64) -> String {
    format!(
        "{pid} ({comm}) S {ppid} {pid} {pid} 0 -1 4194304 100 0 0 0 {utime} {stime} 0 0 20 0 1 0 500 1000000 {rss_pages} 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0\n"
    )
}

pub struct FakeProc {
    dir: TempDir,
}

impl FakeProc {
    pub fn new() -> Self {
        let fake = Self {
            dir: TempDir::new().unwrap(),
        };
        fake.set_uptime(100.0);
        fake
    }

    pub fn procfs(&self) -> ProcFs {
        ProcFs::with_root(self.dir.path())
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn add_dir(&self, rel: &str) {
        fs::create_dir_all(self.dir.path().join(rel)).unwrap();
    }

    pub fn write_file(&self, rel: &str, contents: &str) {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    /// A process with no threads listed yet
    pub fn add_process(&self, pid: u32, ppid: u32, rss_pages: u64) {
        self.write_file(
            &format!("{pid}/stat"),
            &stat_line(pid, "worker", ppid, 0, 0, rss_pages),
        );
    }

    /// Create or update one thread's cumulative CPU ticks
    pub fn add_thread(&self, pid: u32, tid: u32, ticks: u64) {
        self.write_file(
            &format!("{pid}/task/{tid}/stat"),
            &stat_line(tid, "worker", pid, ticks, 0, 0),
        );
    }

    pub fn remove_thread(&self, pid: u32, tid: u32) {
        let _ = fs::remove_dir_all(self.dir.path().join(format!("{pid}/task/{tid}")));
    }

    pub fn set_pss(&self, pid: u32, kib: u64) {
        self.write_file(
            &format!("{pid}/smaps_rollup"),
            &format!("00400000-7fff [rollup]\nRss:  {} kB\nPss:  {} kB\nPss_Anon:  1 kB\n", kib * 2, kib),
        );
    }

    pub fn remove_process(&self, pid: u32) {
        let _ = fs::remove_dir_all(self.dir.path().join(pid.to_string()));
    }

    pub fn set_uptime(&self, secs: f64) {
        self.write_file("uptime", &format!("{:.2} 12345.67\n", secs));
    }
}
