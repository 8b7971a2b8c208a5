//! Self-profiling infrastructure for ruse
//!
//! Measures the overhead ruse itself adds while sampling a workload: how much
//! wall time each sampling phase takes, so a too-short `--time` period can be
//! spotted before it distorts the measurement.

use std::time::{Duration, Instant};

/// Phases of a sampling pass that can be profiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfilingCategory {
    /// Scanning the live pid set and resolving parents
    Discovery,
    /// Walking the tracked tree and reading memory records
    Memory,
    /// Reading thread records and ranking utilization
    Cpu,
    /// Rendering step records
    Output,
}

/// Profiling context that tracks time spent in each sampling phase
#[derive(Debug, Default)]
pub struct ProfilingContext {
    /// Total number of sampling passes
    sample_count: u64,
    discovery_time: Duration,
    memory_time: Duration,
    cpu_time: Duration,
    output_time: Duration,
    /// Total wall clock time
    start_time: Option<Instant>,
}

impl ProfilingContext {
    /// Create a new profiling context
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Record that a sampling pass completed
    pub fn record_sample(&mut self) {
        self.sample_count += 1;
    }

    /// Measure the time taken by an operation
    ///
    /// # Example
    /// ```
    /// use ruse::profiling::{ProfilingContext, ProfilingCategory};
    ///
    /// let mut ctx = ProfilingContext::new();
    /// let result = ctx.measure(ProfilingCategory::Memory, || 40 + 2);
    /// assert_eq!(result, 42);
    /// ```
    pub fn measure<F, R>(&mut self, category: ProfilingCategory, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.record_time(category, start.elapsed());
        result
    }

    /// Record time spent in a category
    pub fn record_time(&mut self, category: ProfilingCategory, duration: Duration) {
        match category {
            ProfilingCategory::Discovery => self.discovery_time += duration,
            ProfilingCategory::Memory => self.memory_time += duration,
            ProfilingCategory::Cpu => self.cpu_time += duration,
            ProfilingCategory::Output => self.output_time += duration,
        }
    }

    /// Wall clock time since profiling started
    pub fn wall_time(&self) -> Duration {
        self.start_time
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn time_in_category(&self, category: ProfilingCategory) -> Duration {
        match category {
            ProfilingCategory::Discovery => self.discovery_time,
            ProfilingCategory::Memory => self.memory_time,
            ProfilingCategory::Cpu => self.cpu_time,
            ProfilingCategory::Output => self.output_time,
        }
    }

    /// Total time spent working (sum of all categories)
    pub fn busy_time(&self) -> Duration {
        self.discovery_time + self.memory_time + self.cpu_time + self.output_time
    }

    /// Average duration of one sampling pass
    pub fn mean_sample_time(&self) -> Duration {
        if self.sample_count == 0 {
            return Duration::ZERO;
        }
        (self.discovery_time + self.memory_time + self.cpu_time) / self.sample_count as u32
    }

    /// Print profiling summary to stderr
    pub fn print_summary(&self) {
        let wall = self.wall_time();
        let busy = self.busy_time();

        eprintln!("\n╔════════════════════════════════════════════════════════════╗");
        eprintln!("║  ruse Self-Profiling Results                               ║");
        eprintln!("╚════════════════════════════════════════════════════════════╝");
        eprintln!();
        eprintln!("Total samples taken:       {}", self.sample_count);
        eprintln!("Total wall time:           {:.3}s", wall.as_secs_f64());
        eprintln!(
            "Time spent sampling:       {:.3}s ({:.2}%)",
            busy.as_secs_f64(),
            percent(busy, wall)
        );
        eprintln!(
            "Mean time per sample:      {:.3}ms",
            self.mean_sample_time().as_secs_f64() * 1000.0
        );
        eprintln!();
        eprintln!("Breakdown:");
        self.print_category("Discovery", self.discovery_time, busy);
        self.print_category("Memory", self.memory_time, busy);
        self.print_category("CPU attribution", self.cpu_time, busy);
        self.print_category("Output", self.output_time, busy);
        eprintln!();
    }

    fn print_category(&self, name: &str, time: Duration, total: Duration) {
        if time > Duration::ZERO {
            eprintln!(
                "  - {:20} {:.3}s ({:.1}%)",
                format!("{}:", name),
                time.as_secs_f64(),
                percent(time, total)
            );
        }
    }
}

fn percent(part: Duration, whole: Duration) -> f64 {
    if whole.is_zero() {
        0.0
    } else {
        part.as_secs_f64() / whole.as_secs_f64() * 100.0
    }
}
