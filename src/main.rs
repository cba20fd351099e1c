mod classfile;
mod descriptor;
mod eligibility;
mod instrument;
mod ir;
mod opcodes;
mod record;
mod recorder;
mod scan;
#[cfg(test)]
mod testutil;

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::eligibility::TrackingMode;
use crate::instrument::{DEFAULT_SUPPORT_CLASS, InstrumentOptions};
use crate::recorder::{
    AggregateRecorder, RECORDER, Recorder, Sink, StreamingRecorder, collect_events,
};
use crate::scan::{ScanOptions, scan_input};

/// CLI arguments for nullprobe execution.
#[derive(Parser, Debug)]
#[command(
    name = "nullprobe",
    about = "Instruments JVM class files to observe runtime nullness of fields, parameters, and outcomes.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rewrite class files, JARs, or directories with nullness probes.
    Instrument(InstrumentArgs),
    /// Decode a probe event stream and produce CSV telemetry.
    Collect(CollectArgs),
}

#[derive(clap::Args, Debug)]
struct InstrumentArgs {
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    #[arg(long, value_name = "PATH")]
    output: PathBuf,
    /// Package prefix selecting classes to transform (e.g. com/example).
    #[arg(long, value_name = "PREFIX")]
    prefix: String,
    #[arg(long, value_enum, default_value = "full")]
    mode: Mode,
    /// Internal name of the JVM-side probe support class.
    #[arg(long, value_name = "CLASS", default_value = DEFAULT_SUPPORT_CLASS)]
    support_class: String,
    /// Also write every rewritten class under this directory.
    #[arg(long, value_name = "PATH")]
    dump_dir: Option<PathBuf>,
    /// Write a JSON run report to this path.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

#[derive(clap::Args, Debug)]
struct CollectArgs {
    /// Event stream to read, or `-` for stdin.
    #[arg(long, value_name = "PATH", default_value = "-")]
    input: PathBuf,
    /// Aggregate into per-signature counts instead of streaming rows.
    #[arg(long)]
    aggregate: bool,
    /// Output destination, or `-` for stdout.
    #[arg(long, value_name = "PATH", default_value = "-")]
    output: PathBuf,
}

/// Tracking mode exposed on the command line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Mode {
    Fields,
    Outcomes,
    Full,
}

impl From<Mode> for TrackingMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Fields => TrackingMode::Fields,
            Mode::Outcomes => TrackingMode::Outcomes,
            Mode::Full => TrackingMode::Full,
        }
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Command::Instrument(args) => run_instrument(args),
        Command::Collect(args) => run_collect(args),
    }
}

fn run_instrument(args: InstrumentArgs) -> Result<()> {
    if !args.input.exists() {
        anyhow::bail!("input not found: {}", args.input.display());
    }
    let prefix = normalize_prefix(&args.prefix)?;

    let started_at = Instant::now();
    let options = ScanOptions {
        instrument: InstrumentOptions {
            mode: args.mode.into(),
            support_class: args.support_class,
        },
        prefix,
        output: args.output,
        dump_dir: args.dump_dir,
    };
    let summary = scan_input(&args.input, &options)?;
    info!(
        classes = summary.classes_seen,
        instrumented = summary.classes_instrumented,
        methods = summary.methods_instrumented,
        "transformation finished"
    );

    if let Some(report) = &args.report {
        let mut writer = File::create(report)
            .with_context(|| format!("failed to open {}", report.display()))?;
        serde_json::to_writer_pretty(&mut writer, &summary)
            .context("failed to serialize run report")?;
        writer
            .write_all(b"\n")
            .context("failed to write run report")?;
    }

    if args.timing && !args.quiet {
        eprintln!(
            "timing: total_ms={} classes={} instrumented={}",
            started_at.elapsed().as_millis(),
            summary.classes_seen,
            summary.classes_instrumented
        );
    }

    Ok(())
}

fn run_collect(args: CollectArgs) -> Result<()> {
    let sink = output_writer(&args.output)?;
    let recorder: Box<dyn Recorder> = if args.aggregate {
        Box::new(AggregateRecorder::new(sink))
    } else {
        Box::new(StreamingRecorder::new(sink))
    };
    RECORDER.install(recorder)?;
    let recorder = RECORDER.get().context("recorder just installed")?;

    let count = if args.input == Path::new("-") {
        collect_events(io::stdin().lock(), recorder)?
    } else {
        let file = File::open(&args.input)
            .with_context(|| format!("failed to open {}", args.input.display()))?;
        collect_events(BufReader::new(file), recorder)?
    };
    RECORDER.shutdown()?;
    info!(events = count, "collection finished");
    Ok(())
}

/// Accept dotted package names but store internal-name form.
fn normalize_prefix(prefix: &str) -> Result<String> {
    if prefix.is_empty() {
        anyhow::bail!("--prefix must name a package prefix such as com/example");
    }
    Ok(prefix.replace('.', "/"))
}

fn output_writer(output: &Path) -> Result<Sink> {
    if output == Path::new("-") {
        return Ok(Box::new(io::stdout()));
    }
    let file =
        File::create(output).with_context(|| format!("failed to open {}", output.display()))?;
    Ok(Box::new(io::BufWriter::new(file)))
}

/// Initialize logging facade with stderr output.
fn init_logging() {
    let init_result = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nullprobe=info,warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    let _ = init_result;
}
