//! CSV output format for sample series
//!
//! One row per sample; the summary follows as `# key,value` comment rows so
//! spreadsheet imports can skip it.

use crate::output::{megabytes, percentages};
use crate::sampler::{RunSummary, StepRecord};

/// CSV output formatter
#[derive(Debug, Default)]
pub struct CsvOutput;

impl CsvOutput {
    pub fn new() -> Self {
        Self
    }

    /// Column header row
    pub fn header(&self) -> String {
        ["time_s", "memory_mb", "processes", "active_threads", "usage_pct"].join(",")
    }

    /// Escape CSV field (handle commas, quotes, newlines)
    fn escape_field(field: &str) -> String {
        if field.contains(',') || field.contains('"') || field.contains('\n') {
            format!("\"{}\"", field.replace('"', "\"\""))
        } else {
            field.to_string()
        }
    }

    /// Format one sample as a CSV row
    pub fn format_step(&self, step: &StepRecord) -> String {
        [
            format!("{:.3}", step.elapsed_secs),
            format!("{:.1}", megabytes(step.memory_bytes)),
            step.processes.to_string(),
            step.active_threads.to_string(),
            percentages(&step.usage),
        ]
        .join(",")
    }

    /// Format the summary as comment rows
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        let rows = [
            ("label", Self::escape_field(&summary.label)),
            ("command", Self::escape_field(&summary.command.join(" "))),
            ("time_s", format!("{:.3}", summary.elapsed_secs)),
            ("memory_mb", format!("{:.1}", megabytes(summary.peak_memory_bytes))),
            ("memory_mode", summary.memory_mode.to_string()),
            ("processes", summary.peak_processes.to_string()),
            ("hw_cores", summary.hw_cores.to_string()),
            ("max_cores", summary.affinity_cores.to_string()),
            ("peak_threads", summary.peak_active_threads.to_string()),
            ("samples", summary.samples.to_string()),
            ("rank_pct", percentages(&summary.rank_averages)),
            ("exit_code", summary.exit_code.to_string()),
        ];

        let mut output = String::new();
        for (key, value) in rows {
            output.push_str(&format!("# {},{}\n", key, value));
        }
        output
    }
}
