use anyhow::Result;
use clap::Parser;
use ruse::cli::Cli;
use ruse::memory::MemoryMode;
use ruse::output::ReportOptions;
use ruse::scheduler::{self, SamplerConfig};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; warnings are always shown
fn init_tracing(verbose: bool) {
    let mut filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .from_env_lossy();
    if verbose {
        filter = filter.add_directive(tracing::Level::DEBUG.into());
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve the command line into a run configuration
fn build_config(args: Cli) -> Result<SamplerConfig> {
    let label = args.resolved_label();
    let command = match args.command {
        Some(command) if !command.is_empty() => command,
        _ => anyhow::bail!("Must specify a command. Usage: ruse [OPTIONS] -- COMMAND [ARGS...]"),
    };

    Ok(SamplerConfig {
        command,
        label,
        period: args.period,
        memory_mode: if args.pss {
            MemoryMode::Pss
        } else {
            MemoryMode::Rss
        },
        report: ReportOptions {
            format: args.format,
            steps: args.steps,
            header: !args.no_header,
            summary: !args.no_summary,
        },
        stdout: args.stdout,
        profile_self: args.profile_self,
    })
}

fn main() {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let code = match build_config(args).and_then(|config| scheduler::run(&config)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ruse: {:#}", e);
            1
        }
    };

    // Exit with the measured program's exit code
    std::process::exit(code);
}
