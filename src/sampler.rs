//! One sampling pass over the tracked process tree
//!
//! Discovery, memory aggregation and CPU attribution, in that order, folded
//! into the running [`SamplingState`].

use std::time::Instant;

use nix::sched::{sched_getaffinity, CpuSet};
use nix::unistd::Pid;
use serde::Serialize;

use crate::cpu::{clock_ticks_per_sec, CoreProfile, CpuTracker};
use crate::discovery::{list_processes, not_kernel_thread, ProcessTable, TrackablePredicate};
use crate::memory::{page_size, MemoryAggregator, MemoryMode};
use crate::procfs::ProcFs;
use crate::profiling::{ProfilingCategory, ProfilingContext};

/// Host properties the sampler needs, detected once per run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    pub page_size: u64,
    pub clk_tck: u64,
    /// Online processors
    pub hw_cores: usize,
    /// Processors this process may run on
    pub affinity_cores: usize,
}

impl SystemInfo {
    pub fn detect() -> Self {
        let hw_cores = online_cores();
        Self {
            page_size: page_size(),
            clk_tck: clock_ticks_per_sec(),
            hw_cores,
            affinity_cores: affinity_cores().unwrap_or(hw_cores),
        }
    }
}

fn online_cores() -> usize {
    // SAFETY: sysconf has no preconditions
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online > 0 {
        online as usize
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

fn affinity_cores() -> Option<usize> {
    let set = sched_getaffinity(Pid::from_raw(0)).ok()?;
    let count = (0..CpuSet::count())
        .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
        .count();
    (count > 0).then_some(count)
}

/// One tick's measurement, as handed to the reporter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    /// Seconds since the run started
    pub elapsed_secs: f64,
    pub memory_bytes: u64,
    /// Live processes in the tracked tree
    pub processes: usize,
    /// Threads that consumed CPU since the previous tick
    pub active_threads: usize,
    /// Per-thread utilization, busiest first (1.0 = one full core)
    pub usage: Vec<f64>,
}

/// Everything reported once the run is over
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub label: String,
    pub command: Vec<String>,
    pub pid: u32,
    /// Wall-clock duration of the whole run
    pub elapsed_secs: f64,
    pub peak_memory_bytes: u64,
    /// Mode in effect at the end of the run
    pub memory_mode: MemoryMode,
    pub peak_processes: usize,
    pub hw_cores: usize,
    pub affinity_cores: usize,
    pub peak_active_threads: usize,
    pub samples: u64,
    /// Average utilization of the n-th busiest thread, busiest first
    pub rank_averages: Vec<f64>,
    pub exit_code: i32,
}

/// Running state of a sampling run
#[derive(Debug, Clone)]
pub struct SamplingState {
    pub start: Instant,
    pub hw_cores: usize,
    pub affinity_cores: usize,
    pub iterations: u64,
    pub peak_memory: u64,
    pub peak_processes: usize,
}

impl SamplingState {
    pub fn new(system: &SystemInfo) -> Self {
        Self {
            start: Instant::now(),
            hw_cores: system.hw_cores,
            affinity_cores: system.affinity_cores,
            iterations: 0,
            peak_memory: 0,
            peak_processes: 0,
        }
    }

    /// Fold one step into the running peaks
    pub fn update(&mut self, step: &StepRecord) {
        self.iterations += 1;
        self.peak_memory = self.peak_memory.max(step.memory_bytes);
        self.peak_processes = self.peak_processes.max(step.processes);
    }
}

/// Drives discovery, memory and CPU attribution for one tracked root
pub struct Sampler {
    procfs: ProcFs,
    is_trackable: TrackablePredicate,
    memory: MemoryAggregator,
    cpu: CpuTracker,
    state: SamplingState,
    profiling: Option<ProfilingContext>,
}

impl Sampler {
    /// Sampler for the live system
    pub fn new(mode: MemoryMode) -> Self {
        Self::with_system(ProcFs::new(), mode, SystemInfo::detect())
    }

    pub fn with_system(procfs: ProcFs, mode: MemoryMode, system: SystemInfo) -> Self {
        Self {
            memory: MemoryAggregator::new(procfs.clone(), mode, system.page_size),
            cpu: CpuTracker::new(procfs.clone(), system.clk_tck),
            state: SamplingState::new(&system),
            procfs,
            is_trackable: not_kernel_thread,
            profiling: None,
        }
    }

    /// Replace the default kernel-thread filter
    pub fn with_predicate(mut self, is_trackable: TrackablePredicate) -> Self {
        self.is_trackable = is_trackable;
        self
    }

    /// Time each phase of every pass
    pub fn with_profiling(mut self) -> Self {
        self.profiling = Some(ProfilingContext::new());
        self
    }

    /// Measure the tree rooted at `root_pid` and fold it into the state
    pub fn sample(&mut self, root_pid: u32) -> StepRecord {
        let mut profiling = self.profiling.take();

        let table = measure(&mut profiling, ProfilingCategory::Discovery, || {
            list_processes(&self.procfs, self.is_trackable).unwrap_or_else(|e| {
                tracing::warn!("{}", e);
                ProcessTable::default()
            })
        });

        let memory = measure(&mut profiling, ProfilingCategory::Memory, || {
            self.memory.aggregate_memory(root_pid, &table)
        });

        let usage = measure(&mut profiling, ProfilingCategory::Cpu, || {
            self.cpu.begin_tick();
            for &pid in &memory.pids {
                self.cpu.observe_threads(pid);
            }
            self.cpu.end_tick()
        });

        if let Some(ctx) = profiling.as_mut() {
            ctx.record_sample();
        }
        self.profiling = profiling;

        let step = StepRecord {
            elapsed_secs: self.state.start.elapsed().as_secs_f64(),
            memory_bytes: memory.bytes,
            processes: memory.live,
            active_threads: usage.len(),
            usage,
        };
        self.state.update(&step);

        tracing::debug!(
            tick = self.state.iterations,
            memory = step.memory_bytes,
            processes = step.processes,
            threads = step.active_threads,
            "sampled pid {}",
            root_pid
        );

        step
    }

    pub fn state(&self) -> &SamplingState {
        &self.state
    }

    /// Memory mode in effect, after any fallback
    pub fn memory_mode(&self) -> MemoryMode {
        self.memory.mode()
    }

    pub fn profiling(&self) -> Option<&ProfilingContext> {
        self.profiling.as_ref()
    }

    /// Run `f` under the self-profiler, if enabled
    pub fn measure<R>(&mut self, category: ProfilingCategory, f: impl FnOnce() -> R) -> R {
        measure(&mut self.profiling, category, f)
    }

    /// Close the CPU profile; call once, at the end of the run
    pub fn finalize(&self) -> CoreProfile {
        self.cpu.finalize()
    }
}

fn measure<R>(
    profiling: &mut Option<ProfilingContext>,
    category: ProfilingCategory,
    f: impl FnOnce() -> R,
) -> R {
    match profiling {
        Some(ctx) => ctx.measure(category, f),
        None => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_proc::FakeProc;

    const SYSTEM: SystemInfo = SystemInfo {
        page_size: 4096,
        clk_tck: 100,
        hw_cores: 8,
        affinity_cores: 4,
    };

    fn workload() -> FakeProc {
        let fake = FakeProc::new();
        fake.add_process(1, 0, 1000);
        fake.add_process(500, 1, 100);
        fake.add_thread(500, 500, 0);
        fake.add_process(501, 500, 200);
        fake.add_thread(501, 501, 0);
        fake.add_thread(501, 502, 0);
        fake.add_process(3, 2, 0);
        fake
    }

    #[test]
    fn test_tick_zero_has_memory_but_no_usage() {
        let fake = workload();
        let mut sampler = Sampler::with_system(fake.procfs(), MemoryMode::Rss, SYSTEM);

        let step = sampler.sample(500);
        assert_eq!(step.memory_bytes, 300 * 4096);
        assert_eq!(step.processes, 2);
        assert_eq!(step.active_threads, 0);
        assert_eq!(sampler.state().iterations, 1);
        assert_eq!(sampler.state().peak_memory, 300 * 4096);
    }

    #[test]
    fn test_second_tick_ranks_threads() {
        let fake = workload();
        let mut sampler = Sampler::with_system(fake.procfs(), MemoryMode::Rss, SYSTEM);
        fake.set_uptime(100.0);
        sampler.sample(500);

        fake.set_uptime(101.0);
        fake.add_thread(500, 500, 10);
        fake.add_thread(501, 501, 100);
        fake.add_thread(501, 502, 40);
        let step = sampler.sample(500);

        assert_eq!(step.active_threads, 3);
        assert_eq!(step.usage.len(), 3);
        assert!((step.usage[0] - 1.0).abs() < 1e-9);
        assert!((step.usage[1] - 0.4).abs() < 1e-9);
        assert!((step.usage[2] - 0.1).abs() < 1e-9);

        let profile = sampler.finalize();
        assert_eq!(profile.iterations, 2);
        assert_eq!(profile.peak_active_threads, 3);
        assert!((profile.rank_averages[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_peak_memory_survives_shrinking_tree() {
        let fake = workload();
        let mut sampler = Sampler::with_system(fake.procfs(), MemoryMode::Rss, SYSTEM);
        sampler.sample(500);

        fake.remove_process(501);
        let step = sampler.sample(500);
        assert_eq!(step.memory_bytes, 100 * 4096);
        assert_eq!(step.processes, 1);
        assert_eq!(sampler.state().peak_memory, 300 * 4096);
        assert_eq!(sampler.state().peak_processes, 2);
    }

    #[test]
    fn test_root_exited_yields_empty_step() {
        let fake = workload();
        let mut sampler = Sampler::with_system(fake.procfs(), MemoryMode::Rss, SYSTEM);
        let step = sampler.sample(4321);
        assert_eq!(step.memory_bytes, 0);
        assert_eq!(step.processes, 0);
    }

    #[test]
    fn test_pss_fallback_applies_to_tick_zero() {
        let fake = workload();
        let mut sampler = Sampler::with_system(fake.procfs(), MemoryMode::Pss, SYSTEM);
        let step = sampler.sample(500);
        assert_eq!(sampler.memory_mode(), MemoryMode::Rss);
        assert_eq!(step.memory_bytes, 300 * 4096);
    }

    #[test]
    fn test_custom_predicate_prunes_tree() {
        fn no_children_of_500(record: &crate::discovery::ProcessRecord) -> bool {
            record.parent_pid != 500
        }
        let fake = workload();
        let mut sampler = Sampler::with_system(fake.procfs(), MemoryMode::Rss, SYSTEM)
            .with_predicate(no_children_of_500);
        assert_eq!(sampler.sample(500).memory_bytes, 100 * 4096);
    }

    #[test]
    fn test_profiling_counts_samples() {
        let fake = workload();
        let mut sampler =
            Sampler::with_system(fake.procfs(), MemoryMode::Rss, SYSTEM).with_profiling();
        sampler.sample(500);
        sampler.sample(500);
        assert_eq!(sampler.profiling().unwrap().sample_count(), 2);
    }

    #[test]
    fn test_detect_system() {
        let system = SystemInfo::detect();
        assert!(system.hw_cores >= 1);
        assert!(system.affinity_cores >= 1);
        assert!(system.clk_tck > 0);
    }
}
