//! The sampling run: launch, periodic sampling, drain, summary
//!
//! ```text
//! Init ──launch + tick 0──▶ Running ──child exit / forwarded signal──▶ Draining ──reap──▶ Done
//!                            │  ▲
//!                            └──┘ timer: sample
//! ```

use std::time::Duration;

use anyhow::Result;
use nix::sys::signal::Signal;

use crate::launcher::{abort_child, forward_signal, launch, reap};
use crate::memory::MemoryMode;
use crate::output::{output_path, Destination, ReportOptions, Reporter};
use crate::profiling::ProfilingCategory;
use crate::sampler::{RunSummary, Sampler};
use crate::signals::{Event, SampleTimer, WatchedSignals};

/// Everything a run needs, resolved from the command line
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub command: Vec<String>,
    pub label: String,
    pub period: Duration,
    pub memory_mode: MemoryMode,
    pub report: ReportOptions,
    /// Write the report to stdout instead of `<label>-<pid>.ruse`
    pub stdout: bool,
    pub profile_self: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Running,
    Draining,
    Done,
}

/// What the loop must do in response to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Sample,
    Forward(Signal),
}

impl RunState {
    /// Transition on one event. Only a running loop reacts; events that
    /// arrive in the same wake-up after the run started draining are dropped.
    pub fn on_event(self, event: Event) -> (RunState, Option<Action>) {
        match (self, event) {
            (RunState::Running, Event::Timer) => (RunState::Running, Some(Action::Sample)),
            (RunState::Running, Event::Terminate(sig)) => {
                (RunState::Draining, Some(Action::Forward(sig)))
            }
            (RunState::Running, Event::ChildExited) => (RunState::Draining, None),
            (state, _) => (state, None),
        }
    }
}

/// Run the command under the sampler and return its exit code
pub fn run(config: &SamplerConfig) -> Result<i32> {
    let mut state = RunState::Init;

    // Blocked before the child exists so neither its exit nor a timer
    // expiry can slip past the loop.
    let signals = WatchedSignals::install()?;
    let child = launch(&config.command, signals.original_mask())?;
    let pid = child.id();

    let destination = if config.stdout {
        Destination::Stdout
    } else {
        Destination::File(output_path(&config.label, pid))
    };
    let mut reporter = or_abort(pid, Reporter::create(config.report, &destination))?;
    or_abort(pid, reporter.begin())?;

    let mut sampler = Sampler::new(config.memory_mode);
    if config.profile_self {
        sampler = sampler.with_profiling();
    }

    tracing::debug!(?state, pid, period = ?config.period, "starting run");

    let mut report_failed = false;
    let mut tick = |sampler: &mut Sampler, reporter: &mut Reporter| {
        let step = sampler.sample(pid);
        let written = sampler.measure(ProfilingCategory::Output, || reporter.step(&step));
        if let Err(e) = written {
            if !report_failed {
                tracing::warn!("{:#}", e);
                report_failed = true;
            }
        }
    };

    tick(&mut sampler, &mut reporter);
    let timer = or_abort(pid, SampleTimer::arm(config.period))?;
    state = RunState::Running;

    while state == RunState::Running {
        for event in signals.wait() {
            let (next, action) = state.on_event(event);
            match action {
                Some(Action::Sample) => tick(&mut sampler, &mut reporter),
                Some(Action::Forward(sig)) => forward_signal(pid, sig),
                None => {}
            }
            if next != state {
                tracing::debug!(?event, from = ?state, to = ?next, "state change");
            }
            state = next;
        }
    }

    drop(timer);
    let exit_code = reap(pid)?;
    state = RunState::Done;

    let profile = sampler.finalize();
    let sampling = sampler.state();
    let summary = RunSummary {
        label: config.label.clone(),
        command: config.command.clone(),
        pid,
        elapsed_secs: sampling.start.elapsed().as_secs_f64(),
        peak_memory_bytes: sampling.peak_memory,
        memory_mode: sampler.memory_mode(),
        peak_processes: sampling.peak_processes,
        hw_cores: sampling.hw_cores,
        affinity_cores: sampling.affinity_cores,
        peak_active_threads: profile.peak_active_threads,
        samples: profile.iterations,
        rank_averages: profile.rank_averages,
        exit_code,
    };
    sampler.measure(ProfilingCategory::Output, || reporter.finish(&summary))?;

    if let Some(profiling) = sampler.profiling() {
        profiling.print_summary();
    }

    tracing::debug!(?state, exit_code, "run complete");
    drop(signals);
    Ok(exit_code)
}

/// Kill the already started child if a setup step fails
fn or_abort<T>(pid: u32, result: Result<T>) -> Result<T> {
    if result.is_err() {
        abort_child(pid);
    }
    result
}
