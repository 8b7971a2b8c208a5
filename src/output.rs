//! Rendering step records and the run summary
//!
//! The [`Reporter`] owns the destination and the format; the CSV and JSON
//! layouts live in [`crate::csv_output`] and [`crate::json_output`].

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::cli::OutputFormat;
use crate::csv_output::CsvOutput;
use crate::json_output::JsonOutput;
use crate::sampler::{RunSummary, StepRecord};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// File extension of report files
pub const REPORT_EXTENSION: &str = "ruse";

pub fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Core fractions as space-separated percentages, one decimal each
pub fn percentages(usage: &[f64]) -> String {
    usage
        .iter()
        .map(|u| format!("{:.1}", u * 100.0))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `<label>-<pid>.ruse` in the current directory
pub fn output_path(label: &str, pid: u32) -> PathBuf {
    PathBuf::from(format!("{}-{}.{}", label, pid, REPORT_EXTENSION))
}

/// Where a report goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
}

/// What a report contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    pub format: OutputFormat,
    /// One record per sample
    pub steps: bool,
    /// Column header before the step records
    pub header: bool,
    pub summary: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            steps: false,
            header: true,
            summary: true,
        }
    }
}

/// Human-readable layout
pub struct TextOutput;

impl TextOutput {
    pub fn header() -> String {
        format!(
            "{:>9}  {:>9}  {:>5}  {:>7}  usage(%)",
            "time(s)", "mem(MB)", "procs", "threads"
        )
    }

    pub fn format_step(step: &StepRecord) -> String {
        let line = format!(
            "{:>9.2}  {:>9.1}  {:>5}  {:>7}  {}",
            step.elapsed_secs,
            megabytes(step.memory_bytes),
            step.processes,
            step.active_threads,
            percentages(&step.usage)
        );
        line.trim_end().to_string()
    }

    pub fn format_summary(summary: &RunSummary) -> String {
        let rows = [
            ("Label", summary.label.clone()),
            ("Command", summary.command.join(" ")),
            ("Time(s)", format!("{:.2}", summary.elapsed_secs)),
            ("Mem(MB)", format!("{:.1}", megabytes(summary.peak_memory_bytes))),
            ("Mode", summary.memory_mode.to_string()),
            ("Procs", summary.peak_processes.to_string()),
            ("HW cores", summary.hw_cores.to_string()),
            ("Max cores", summary.affinity_cores.to_string()),
            ("Peak threads", summary.peak_active_threads.to_string()),
            ("Samples", summary.samples.to_string()),
            ("Rank(%)", percentages(&summary.rank_averages)),
            ("Exit code", summary.exit_code.to_string()),
        ];

        let mut output = String::new();
        for (key, value) in rows {
            let line = format!("{:<13} {}", format!("{}:", key), value);
            output.push_str(line.trim_end());
            output.push('\n');
        }
        output
    }
}

/// Writes one run's records in the selected format
pub struct Reporter {
    options: ReportOptions,
    out: Box<dyn Write>,
    csv: CsvOutput,
    /// Buffered document, JSON only
    json: Option<JsonOutput>,
    wrote_steps: bool,
}

impl Reporter {
    pub fn new(options: ReportOptions, out: Box<dyn Write>) -> Self {
        let json = (options.format == OutputFormat::Json).then(JsonOutput::new);
        Self {
            options,
            out,
            csv: CsvOutput::new(),
            json,
            wrote_steps: false,
        }
    }

    /// Open the destination; failing to create the report file is fatal
    pub fn create(options: ReportOptions, destination: &Destination) -> Result<Self> {
        let out: Box<dyn Write> = match destination {
            Destination::Stdout => Box::new(io::stdout()),
            Destination::File(path) => Box::new(BufWriter::new(create_file(path)?)),
        };
        Ok(Self::new(options, out))
    }

    /// Write the column header, if any
    pub fn begin(&mut self) -> Result<()> {
        if !(self.options.steps && self.options.header) {
            return Ok(());
        }
        let header = match self.options.format {
            OutputFormat::Text => TextOutput::header(),
            OutputFormat::Csv => self.csv.header(),
            OutputFormat::Json => return Ok(()),
        };
        self.write_line(&header)
    }

    pub fn step(&mut self, step: &StepRecord) -> Result<()> {
        if !self.options.steps {
            return Ok(());
        }
        self.wrote_steps = true;
        let line = match self.options.format {
            OutputFormat::Text => TextOutput::format_step(step),
            OutputFormat::Csv => self.csv.format_step(step),
            OutputFormat::Json => {
                if let Some(json) = self.json.as_mut() {
                    json.add_step(step.clone());
                }
                return Ok(());
            }
        };
        self.write_line(&line)?;
        // Keep step records visible while the workload is still running
        self.out.flush().context("Failed to write report")
    }

    /// Write the summary (unless suppressed) and flush the destination
    pub fn finish(&mut self, summary: &RunSummary) -> Result<()> {
        match self.options.format {
            OutputFormat::Text if self.options.summary => {
                if self.wrote_steps {
                    self.write_line("")?;
                }
                let block = TextOutput::format_summary(summary);
                self.write_raw(&block)?;
            }
            OutputFormat::Csv if self.options.summary => {
                let block = self.csv.format_summary(summary);
                self.write_raw(&block)?;
            }
            OutputFormat::Json => {
                if let Some(mut json) = self.json.take() {
                    if self.options.summary {
                        json.set_summary(summary.clone());
                    }
                    let document = json.to_json()?;
                    self.write_line(&document)?;
                }
            }
            _ => {}
        }
        self.out.flush().context("Failed to write report")
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.out, "{}", line).context("Failed to write report")
    }

    fn write_raw(&mut self, text: &str) -> Result<()> {
        self.out
            .write_all(text.as_bytes())
            .context("Failed to write report")
    }
}

fn create_file(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("Failed to create {}", path.display()))
}
