use clap::{Parser, ValueEnum};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use uartlite_config::BoardDescriptor;
use uartlite_core::demo::{self, CompletionCheck, DemoOptions, DemoReport};
use uartlite_core::metrics::{BoardMetrics, MetricsSummary};
use uartlite_core::{Board, RunLimits};

const EXIT_PASS: u8 = 0;
const EXIT_DEMO_FAIL: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Completion {
    /// Check the done flags once, right after submitting
    Immediate,
    /// Run the board until each transfer completes
    Wait,
}

impl From<Completion> for CompletionCheck {
    fn from(value: Completion) -> Self {
        match value {
            Completion::Immediate => CompletionCheck::Immediate,
            Completion::Wait => CompletionCheck::Wait,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the board descriptor (YAML); the built-in board is used if omitted
    #[arg(short, long)]
    board: Option<PathBuf>,

    /// UART Lite device id to drive
    #[arg(long, default_value_t = 0)]
    uart_device: u16,

    /// Interrupt controller device id
    #[arg(long, default_value_t = 0)]
    intc_device: u16,

    /// How transfer completion is decided
    #[arg(long, value_enum, default_value_t = Completion::Wait)]
    completion: Completion,

    /// Step budget for each transfer wait
    #[arg(long, default_value_t = 10_000)]
    max_steps: u64,

    /// Wall-clock budget for each transfer wait, in milliseconds
    #[arg(long)]
    wall_time_ms: Option<u64>,

    /// Compare received bytes with the sent pattern
    #[arg(long)]
    verify: bool,

    /// Write a JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write a JSON board snapshot after the run
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Enable register-level tracing
    #[arg(short, long)]
    trace: bool,
}

#[derive(Serialize)]
struct RunReport<'a> {
    status: &'static str,
    board: &'a str,
    board_hash: String,
    completion: CompletionCheck,
    limits: RunLimits,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    demo: Option<&'a DemoReport>,
    metrics: MetricsSummary,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.trace {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(std::io::stderr)
            .init();
    }

    let descriptor = match load_board(&args) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match run(&args, &descriptor) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_DEMO_FAIL)
        }
    }
}

fn load_board(args: &Args) -> anyhow::Result<BoardDescriptor> {
    if args.max_steps == 0 {
        anyhow::bail!("--max-steps must be greater than zero");
    }
    match &args.board {
        Some(path) => {
            info!("Loading board descriptor: {:?}", path);
            BoardDescriptor::from_file(path)
        }
        None => {
            info!("Using default board");
            Ok(BoardDescriptor::default())
        }
    }
}

fn board_hash(descriptor: &BoardDescriptor) -> anyhow::Result<String> {
    let canonical = serde_yaml::to_string(descriptor)?;
    Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)
        .map_err(|e| anyhow::anyhow!("Failed to write {:?}: {}", path, e))?;
    info!("Wrote {:?}", path);
    Ok(())
}

fn run(args: &Args, descriptor: &BoardDescriptor) -> anyhow::Result<u8> {
    let mut board = Board::from_config(descriptor)?;
    let metrics = Arc::new(BoardMetrics::new());
    board.observers.push(metrics.clone());

    let options = DemoOptions {
        uart_device_id: args.uart_device,
        intc_device_id: args.intc_device,
        check: args.completion.into(),
        limits: RunLimits {
            max_steps: args.max_steps,
            wall_time_ms: args.wall_time_ms,
        },
        verify: args.verify,
        ..DemoOptions::default()
    };

    let stdout = std::io::stdout();
    let mut console = stdout.lock();
    writeln!(console, "System start")?;
    let outcome = demo::run(&mut board, &options, &mut console);
    console.flush()?;
    drop(console);

    let (code, demo_report, failure) = match &outcome {
        Ok(report) => (EXIT_PASS, Some(report), None),
        Err(e) => {
            error!("Example failed: {}", e);
            (EXIT_DEMO_FAIL, None, Some(format_error(e)))
        }
    };

    if let Some(path) = &args.report {
        let report = RunReport {
            status: if code == EXIT_PASS { "pass" } else { "fail" },
            board: &descriptor.name,
            board_hash: board_hash(descriptor)?,
            completion: options.check,
            limits: options.limits,
            error: failure,
            demo: demo_report,
            metrics: metrics.summary(),
        };
        write_json(path, &report)?;
    }

    if let Some(path) = &args.snapshot {
        write_json(path, &board.snapshot())?;
    }

    info!(
        "Run finished: {} steps, {} interrupts",
        metrics.get_steps(),
        metrics.get_total_interrupts()
    );
    Ok(code)
}

/// Render an error with its source chain on one line.
fn format_error(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
