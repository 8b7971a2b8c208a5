//! Per-thread CPU attribution
//!
//! The tracker keeps a ledger of the cumulative CPU ticks of every thread it
//! has ever seen in the tracked tree. Each tick it turns the ledger deltas
//! into utilization fractions (1.0 = one core fully busy) and ranks them.
//!
//! Threads migrate between cores from one tick to the next, so a per-core
//! history would be noise. Ranking instead answers "how busy was the busiest
//! thread, the second busiest, ..." which stays comparable across ticks: the
//! averaged ranks describe how many execution lanes the workload kept busy,
//! and how evenly.

use std::collections::BTreeMap;

use nix::unistd::{sysconf, SysconfVar};
use serde::Serialize;

use crate::procfs::{ProcError, ProcFs};

const FALLBACK_CLK_TCK: u64 = 100;

/// Clock ticks per second used by the kernel for CPU accounting
pub fn clock_ticks_per_sec() -> u64 {
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        _ => FALLBACK_CLK_TCK,
    }
}

/// Rank-ordered running sums of per-tick utilization
#[derive(Debug, Clone, Default)]
pub struct RankAccumulator {
    sums: Vec<f64>,
    iterations: u64,
    peak_active: usize,
}

impl RankAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one tick's active usage values into the per-rank sums.
    ///
    /// Returns the values sorted descending, i.e. by rank.
    pub fn add_tick(&mut self, mut usage: Vec<f64>) -> Vec<f64> {
        usage.sort_by(|a, b| b.total_cmp(a));
        if usage.len() > self.sums.len() {
            self.sums.resize(usage.len(), 0.0);
        }
        for (sum, value) in self.sums.iter_mut().zip(&usage) {
            *sum += value;
        }
        self.peak_active = self.peak_active.max(usage.len());
        self.iterations += 1;
        usage
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Most threads active at once in any tick
    pub fn peak_active(&self) -> usize {
        self.peak_active
    }

    /// Time-averaged load of each rank over all ticks
    pub fn averages(&self) -> Vec<f64> {
        if self.iterations == 0 {
            return Vec::new();
        }
        let n = self.iterations as f64;
        self.sums.iter().map(|sum| sum / n).collect()
    }
}

/// Final CPU profile of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreProfile {
    /// Average utilization of the n-th busiest thread, busiest first
    pub rank_averages: Vec<f64>,
    pub peak_active_threads: usize,
    pub iterations: u64,
}

/// Persistent per-thread CPU-tick ledger plus the rank accumulator
#[derive(Debug)]
pub struct CpuTracker {
    procfs: ProcFs,
    clk_tck: f64,
    /// Last cumulative tick count of every thread ever observed
    ledger: BTreeMap<u32, u64>,
    tick_usage: Vec<f64>,
    ranks: RankAccumulator,
    last_uptime: Option<f64>,
    elapsed: Option<f64>,
}

impl CpuTracker {
    pub fn new(procfs: ProcFs, clk_tck: u64) -> Self {
        Self {
            procfs,
            clk_tck: clk_tck.max(1) as f64,
            ledger: BTreeMap::new(),
            tick_usage: Vec::new(),
            ranks: RankAccumulator::new(),
            last_uptime: None,
            elapsed: None,
        }
    }

    /// Start a tick at the current system uptime.
    ///
    /// If uptime cannot be read the tick still registers threads but computes
    /// no utilization.
    pub fn begin_tick(&mut self) {
        match self.procfs.uptime() {
            Ok(uptime) => self.begin_tick_at(uptime),
            Err(e) => {
                tracing::warn!("{}", e);
                // The next readable tick starts a fresh interval
                self.last_uptime = None;
                self.elapsed = None;
                self.tick_usage.clear();
            }
        }
    }

    /// Start a tick at a given uptime, in seconds
    pub fn begin_tick_at(&mut self, uptime: f64) {
        self.elapsed = self.last_uptime.map(|prev| uptime - prev);
        self.last_uptime = Some(uptime);
        self.tick_usage.clear();
    }

    /// Seconds since the previous tick, if there was one
    pub fn elapsed(&self) -> Option<f64> {
        self.elapsed
    }

    /// Update the ledger for every thread of `pid`.
    ///
    /// A process that exited has no thread listing and contributes nothing.
    pub fn observe_threads(&mut self, pid: u32) {
        for tid in self.procfs.threads(pid) {
            match self.procfs.thread_stat(pid, tid) {
                Ok(Some(stat)) => self.record_thread(tid, stat.cpu_ticks()),
                Ok(None) => {}
                Err(e @ ProcError::Malformed { .. }) => tracing::warn!("{}", e),
                Err(e) => tracing::debug!("Skipping thread {}: {}", tid, e),
            }
        }
    }

    /// Fold one thread's cumulative tick count into the ledger
    pub fn record_thread(&mut self, tid: u32, ticks: u64) {
        let prior = self.ledger.entry(tid).or_insert(0);
        let baseline = if ticks < *prior {
            // The id was recycled by a new thread since the last tick
            tracing::debug!("Thread id {} reused ({} < {})", tid, ticks, prior);
            0
        } else {
            *prior
        };
        let delta = ticks - baseline;
        *prior = ticks;

        if let Some(elapsed) = self.elapsed.filter(|e| *e > 0.0) {
            self.tick_usage
                .push(delta as f64 / self.clk_tck / elapsed);
        }
    }

    /// Close the tick: rank the active threads and fold them into the profile.
    ///
    /// Returns this tick's active usage values, busiest first.
    pub fn end_tick(&mut self) -> Vec<f64> {
        let active: Vec<f64> = self
            .tick_usage
            .drain(..)
            .filter(|usage| *usage > 0.0)
            .collect();
        self.ranks.add_tick(active)
    }

    pub fn iterations(&self) -> u64 {
        self.ranks.iterations()
    }

    /// Number of distinct thread ids ever observed
    pub fn known_threads(&self) -> usize {
        self.ledger.len()
    }

    pub fn finalize(&self) -> CoreProfile {
        CoreProfile {
            rank_averages: self.ranks.averages(),
            peak_active_threads: self.ranks.peak_active(),
            iterations: self.ranks.iterations(),
        }
    }
}
