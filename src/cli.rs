//! CLI argument parsing for ruse

use clap::{Parser, ValueEnum};
use std::path::Path;
use std::time::Duration;

/// Shortest accepted sampling period
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Output format for step records and the summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// CSV format for spreadsheet analysis
    Csv,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "ruse")]
#[command(version)]
#[command(
    about = "Measure memory and per-thread CPU usage of a command and its whole process tree",
    long_about = None
)]
pub struct Cli {
    /// Label used to name the output file (default: the command's name)
    #[arg(short = 'l', long = "label", value_name = "LABEL")]
    pub label: Option<String>,

    /// Sampling period in seconds (fractions allowed)
    #[arg(
        short = 't',
        long = "time",
        value_name = "SECS",
        default_value = "30",
        value_parser = parse_period
    )]
    pub period: Duration,

    /// Emit a record for every sample, not just the summary
    #[arg(short = 's', long = "steps")]
    pub steps: bool,

    /// Write to standard output instead of <label>-<pid>.ruse
    #[arg(long = "stdout")]
    pub stdout: bool,

    /// Omit the column header of the step records
    #[arg(long = "no-header")]
    pub no_header: bool,

    /// Omit the final summary
    #[arg(long = "no-summary")]
    pub no_summary: bool,

    /// Measure proportional set size (PSS) instead of resident set size
    #[arg(long = "pss")]
    pub pss: bool,

    /// Output format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Report ruse's own sampling overhead on stderr
    #[arg(long = "profile-self")]
    pub profile_self: bool,

    /// Enable debug logging on stderr
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Command to measure (everything after --)
    #[arg(last = true)]
    pub command: Option<Vec<String>>,
}

impl Cli {
    /// The explicit label, or the base name of the command
    pub fn resolved_label(&self) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }
        self.command
            .as_ref()
            .and_then(|cmd| cmd.first())
            .map(|program| {
                Path::new(program)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| program.clone())
            })
            .unwrap_or_else(|| "ruse".to_string())
    }
}

fn parse_period(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("period must be a positive number of seconds, got {}", value));
    }
    let period = Duration::from_secs_f64(secs);
    if period < MIN_PERIOD {
        return Err(format!("period must be at least {}ms", MIN_PERIOD.as_millis()));
    }
    Ok(period)
}
