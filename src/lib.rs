//! Ruse - memory and per-thread CPU usage of a whole process tree
//!
//! This library provides the sampling engine behind the `ruse` binary: it
//! launches a command, walks its process tree in `/proc` on a fixed period,
//! and reports aggregate memory, process counts and a rank-ordered profile of
//! per-thread CPU utilization.

pub mod cli;
pub mod cpu;
pub mod csv_output;
pub mod discovery;
pub mod json_output;
pub mod launcher;
pub mod memory;
pub mod output;
pub mod procfs;
pub mod profiling;
pub mod sampler;
pub mod scheduler;
pub mod signals;

#[cfg(test)]
mod fake_proc;
