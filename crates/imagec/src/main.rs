//! imagec: run analysis configurations against image files.
//!
//! # Usage
//!
//! ```text
//! imagec check analysis.json
//! imagec run analysis.json --out results.jsonl --control-images controls/
//! ```
//!
//! Results are written as one JSON record per line; the run report goes
//! to stdout. Logging goes to stderr and follows `RUST_LOG`.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use imagec::{FileImageIo, JsonLinesSink, load_config};
use imagec_pipeline::{Executor, ExecutorOptions, PipelineError, RunReport};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Typed image-analysis pipelines for microscopy plates.
#[derive(Parser)]
#[command(name = "imagec", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a configuration without reading any image.
    Check {
        /// Path to the analysis configuration (JSON).
        config: PathBuf,

        /// Print the compile log as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run every pipeline over every image in a configuration.
    Run {
        /// Path to the analysis configuration (JSON).
        config: PathBuf,

        /// Results file (JSON lines).
        #[arg(long, default_value = "results.jsonl")]
        out: PathBuf,

        /// Directory for control images. Control images are dropped if unset.
        #[arg(long)]
        control_images: Option<PathBuf>,

        /// Number of tiles processed in parallel.
        #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
        threads: usize,

        /// Per-tile time budget in seconds.
        #[arg(long, value_parser = parse_timeout)]
        tile_timeout: Option<Duration>,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Check { config, json } => check(&config, json),
        Command::Run {
            config,
            out,
            control_images,
            threads,
            tile_timeout,
            json,
        } => {
            let options = ExecutorOptions {
                parallel_tiles: threads,
                tile_timeout,
            };
            run(&config, &out, control_images.as_deref(), options, json)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Seconds as a positive, finite [`Duration`].
fn parse_timeout(arg: &str) -> Result<Duration, String> {
    let secs = arg.parse::<f64>().map_err(|e| e.to_string())?;
    if secs <= 0.0 {
        return Err("must be greater than zero".to_owned());
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

fn check(path: &Path, json: bool) -> anyhow::Result<ExitCode> {
    let config = load_config(path)?;
    let log = config.check();
    if json {
        println!("{}", serde_json::to_string_pretty(&log)?);
    } else {
        println!("{}", log.report());
    }
    Ok(if log.has_errors() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn run(
    path: &Path,
    out: &Path,
    control_images: Option<&Path>,
    options: ExecutorOptions,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let config = load_config(path)?;
    let file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
    let mut sink = JsonLinesSink::new(BufWriter::new(file));
    if let Some(dir) = control_images {
        sink = sink.with_control_dir(dir);
    }

    let io = FileImageIo;
    let report = match Executor::new(&io, &sink).with_options(options).run(&config) {
        Ok(report) => report,
        Err(PipelineError::ConfigRejected(log)) => {
            println!("{}", log.report());
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e).context("analysis failed"),
    };
    sink.into_inner()
        .flush()
        .with_context(|| format!("writing {}", out.display()))?;

    print_report(&report, json)?;
    Ok(if report.failed() == 0 && report.skipped.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        if !report.compile_log.entries().is_empty() {
            println!("{}\n", report.compile_log.report());
        }
        println!("{}", report.report());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn timeout_accepts_fractional_seconds() {
        assert_eq!(parse_timeout("2.5").unwrap(), Duration::from_millis(2500));
    }

    #[test]
    fn timeout_rejects_values_duration_cannot_hold() {
        for arg in ["0", "-1", "NaN", "inf", "1e30", "soon"] {
            assert!(parse_timeout(arg).is_err(), "{arg}");
        }
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "imagec",
            "run",
            "analysis.json",
            "--threads",
            "4",
            "--tile-timeout",
            "1.5",
        ])
        .unwrap();
        let Command::Run {
            threads,
            tile_timeout,
            ..
        } = cli.command
        else {
            unreachable!("run subcommand expected");
        };
        assert_eq!(threads, 4);
        assert_eq!(tile_timeout, Some(Duration::from_millis(1500)));
        assert!(Cli::try_parse_from(["imagec", "run", "a.json", "--tile-timeout", "-3"]).is_err());
    }
}
