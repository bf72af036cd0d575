//! mmio-bisect
//!
//! Locates the BAR offsets whose reads make a PCI device stop answering.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                  BisectionEngine                     │
//!                 │   Coarse ──▶ Bisect ──▶ Verify ──▶ Done              │
//!                 └────┬──────────────┬──────────────────┬───────────────┘
//!                      │              │                  │
//!                      ▼              ▼                  ▼
//!              ┌──────────────┐ ┌──────────────────┐ ┌──────────────┐
//!              │ProbeExecutor │ │RecoveryOrchestr. │ │CheckpointStore│
//!              │ (BAR reads)  │ │ (state machine)  │ │ (JSON files)  │
//!              └──────┬───────┘ └────────┬─────────┘ └──────────────┘
//!                     │                  │
//!                     ▼                  ▼
//!              ┌──────────────────────────────────┐
//!              │ HealthMonitor + FaultClassifier  │
//!              │ (sysfs, link status, dmesg)      │
//!              └──────────────────────────────────┘
//! ```
//!
//! # Exit Status
//! - 0: run completed (or command succeeded)
//! - 1: error
//! - 2: run aborted (device gone, recovery exhausted); resumable
//! - 130: interrupted; resumable

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use mmio_bisect::config::{load_config, validate_config, BisectConfig, ConfigError};
use mmio_bisect::device::{
    DeviceControl, DmesgLog, LogSource, MmioTransport, SimBehavior, SimulatedBus, SysfsControl,
    Transport,
};
use mmio_bisect::error::BisectError;
use mmio_bisect::health::{FaultClassifier, HealthMonitor};
use mmio_bisect::lifecycle::{preflight, signals, Shutdown};
use mmio_bisect::observability::{logging, metrics};
use mmio_bisect::search::{
    AddressRange, BisectionEngine, Phase, RunOutcome, RunReport, SearchState,
};
use mmio_bisect::store::{CheckpointStore, FileStore, MemoryStore};

const EXIT_ERROR: u8 = 1;
const EXIT_ABORTED: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "mmio-bisect", version)]
#[command(about = "Find BAR offsets whose reads hang a PCI device", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Checkpoint directory (overrides state.dir)
    #[arg(long, global = true)]
    state_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new run against the configured device
    Run(RunArgs),
    /// Continue a run from its latest checkpoint
    Resume {
        #[arg(long)]
        run_id: String,
        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the report for a run's latest checkpoint
    Report {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Delete the checkpoints of a finished run
    Discard {
        #[arg(long)]
        run_id: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Dry run against a simulated device
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct SearchArgs {
    /// First offset to probe
    #[arg(long, value_parser = parse_u64)]
    start: Option<u64>,
    /// End of the search range (exclusive); defaults to the BAR size
    #[arg(long, value_parser = parse_u64)]
    end: Option<u64>,
    /// Coarse chunk size in bytes
    #[arg(long, value_parser = parse_u64)]
    chunk_size: Option<u64>,
    /// Reads between health checks
    #[arg(long)]
    health_stride: Option<u64>,
    /// Isolated re-probes per candidate
    #[arg(long)]
    verify_attempts: Option<u32>,
    /// Promote candidates without re-probing
    #[arg(long)]
    skip_verify: bool,
}

#[derive(Args)]
struct RunArgs {
    /// PCI address, e.g. 0004:01:00.0
    #[arg(long)]
    bdf: Option<String>,
    /// BAR index to map
    #[arg(long)]
    bar: Option<u8>,
    /// Run identifier; a fresh UUID if omitted
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    search: SearchArgs,
}

#[derive(Args)]
struct SimulateArgs {
    /// Offsets that cause a completion timeout (comma separated)
    #[arg(long, value_parser = parse_u64, value_delimiter = ',')]
    fault: Vec<u64>,
    /// Offsets that make the device leave the bus
    #[arg(long, value_parser = parse_u64, value_delimiter = ',')]
    gone: Vec<u64>,
    /// Simulated BAR size
    #[arg(long, value_parser = parse_u64, default_value = "0x10000")]
    window: u64,
    /// How the simulated device recovers from a fault
    #[arg(long, value_enum, default_value_t = SimRecovery::Auto)]
    recovery: SimRecovery,
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    search: SearchArgs,
}

#[derive(Clone, Copy, ValueEnum)]
enum SimRecovery {
    Auto,
    Rebind,
    Dead,
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("'{}' is not a number: {}", s, e))
}

fn apply_search_args(config: &mut BisectConfig, args: &SearchArgs) {
    if let Some(start) = args.start {
        config.search.start = start;
    }
    if let Some(end) = args.end {
        config.search.end = end;
    }
    if let Some(chunk_size) = args.chunk_size {
        config.search.chunk_size = chunk_size;
    }
    if let Some(stride) = args.health_stride {
        config.probe.health_stride = stride;
    }
    if let Some(attempts) = args.verify_attempts {
        config.verify.attempts = attempts;
    }
    if args.skip_verify {
        config.verify.skip = true;
    }
}

/// Load the file (if any), apply CLI overrides, validate the result.
fn load(cli: &Cli) -> Result<BisectConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => BisectConfig::default(),
    };

    if let Some(dir) = &cli.state_dir {
        config.state.dir = dir.clone();
    }
    match &cli.command {
        Commands::Run(args) => {
            if let Some(bdf) = &args.bdf {
                config.device.bdf = bdf.clone();
            }
            if let Some(bar) = args.bar {
                config.device.bar = bar;
            }
            apply_search_args(&mut config, &args.search);
        }
        Commands::Simulate(args) => {
            config.device.bar_size = args.window;
            apply_search_args(&mut config, &args.search);
        }
        _ => {}
    }

    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_ERROR);
        }
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "mmio-bisect starting");

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let result = match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Resume { run_id, json } => resume(config, &run_id, json).await,
        Commands::Report { run_id, json } => report(&config, &run_id, json),
        Commands::Discard { run_id, yes } => discard(&config, &run_id, yes),
        Commands::Simulate(args) => simulate(config, args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            eprintln!("error: {}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Pre-flight the configured device and map its BAR.
fn open_device(
    config: &BisectConfig,
) -> Result<(MmioTransport, HealthMonitor<DmesgLog, SysfsControl>), BisectError> {
    let mut control = SysfsControl::new(&config.device);
    let resource = control.resource_path(config.device.bar);
    preflight(&mut control, &config.device.bdf, &resource)?;

    let size = Some(config.device.bar_size).filter(|&size| size != 0);
    let transport = MmioTransport::open(&resource, size)?;
    let classifier = FaultClassifier::new(&config.classifier).with_tag(&config.device.driver);
    let monitor = HealthMonitor::new(DmesgLog::new(), control, classifier);
    Ok((transport, monitor))
}

fn search_range(config: &BisectConfig, window: u64) -> Result<AddressRange, BisectError> {
    let end = if config.search.end == 0 {
        window
    } else {
        config.search.end
    };
    Ok(AddressRange::new(config.search.start, end)?)
}

async fn run(config: BisectConfig, args: RunArgs) -> Result<ExitCode, BisectError> {
    let store = FileStore::open(&config.state.dir, config.state.keep_checkpoints)?;
    let run_id = args
        .run_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if store.load_latest(&run_id)?.is_some() {
        return Err(BisectError::RunExists(run_id));
    }

    let (transport, monitor) = open_device(&config)?;
    let range = search_range(&config, transport.window_size())?;
    let state = SearchState::new(run_id, range, config.search.chunk_size)?;
    tracing::info!(
        run_id = %state.run_id,
        bdf = %config.device.bdf,
        range = %range,
        chunks = state.pending.len(),
        state_dir = %store.dir().display(),
        "New run"
    );

    let engine = BisectionEngine::new(transport, monitor, store, &config);
    execute(engine, state, &config, args.json).await
}

async fn resume(config: BisectConfig, run_id: &str, json: bool) -> Result<ExitCode, BisectError> {
    let store = FileStore::open(&config.state.dir, config.state.keep_checkpoints)?;
    let state = store
        .load_latest(run_id)?
        .ok_or_else(|| BisectError::NoCheckpoint(run_id.to_string()))?;
    if state.chunk_size != config.search.chunk_size {
        tracing::warn!(
            checkpoint = state.chunk_size,
            configured = config.search.chunk_size,
            "Chunk size differs from config; the checkpoint wins"
        );
    }
    tracing::info!(
        run_id,
        sequence = state.sequence,
        phase = %state.phase,
        pending = state.pending.len(),
        suspect = state.suspect.len(),
        "Resuming"
    );

    let (transport, monitor) = open_device(&config)?;
    let engine = BisectionEngine::new(transport, monitor, store, &config);
    execute(engine, state, &config, json).await
}

fn report(config: &BisectConfig, run_id: &str, json: bool) -> Result<ExitCode, BisectError> {
    let store = FileStore::open(&config.state.dir, config.state.keep_checkpoints)?;
    let state = store
        .load_latest(run_id)?
        .ok_or_else(|| BisectError::NoCheckpoint(run_id.to_string()))?;
    print_report(&RunReport::from_state(&state, &config.report.regions), json)?;
    Ok(ExitCode::SUCCESS)
}

fn discard(config: &BisectConfig, run_id: &str, yes: bool) -> Result<ExitCode, BisectError> {
    let mut store = FileStore::open(&config.state.dir, config.state.keep_checkpoints)?;
    let state = store
        .load_latest(run_id)?
        .ok_or_else(|| BisectError::NoCheckpoint(run_id.to_string()))?;
    if state.phase != Phase::Done {
        return Err(BisectError::NotDone {
            run_id: run_id.to_string(),
            phase: state.phase,
        });
    }
    if !yes {
        return Err(BisectError::NotConfirmed(run_id.to_string()));
    }
    let removed = store.discard(run_id)?;
    println!("removed {} checkpoint(s) of run {}", removed, run_id);
    Ok(ExitCode::SUCCESS)
}

async fn simulate(mut config: BisectConfig, args: SimulateArgs) -> Result<ExitCode, BisectError> {
    let behavior = match args.recovery {
        SimRecovery::Auto => SimBehavior::AutoRecover { polls: 2 },
        SimRecovery::Rebind => SimBehavior::NeedsRebind { polls: 2 },
        SimRecovery::Dead => SimBehavior::Dead,
    };
    let mut bus = SimulatedBus::new(args.window).with_behavior(behavior);
    for &offset in &args.fault {
        bus = bus.with_fault(offset);
    }
    for &offset in &args.gone {
        bus = bus.with_device_gone(offset);
    }

    // Simulated firmware answers at once; keep the dry run quick.
    config.probe.settle_ms = 0;
    config.recovery.poll_interval_ms = 10;
    config.recovery.settle_ms = 0;
    config.recovery.auto_recovery_timeout_secs = 1;
    config.recovery.rebind_timeout_secs = 1;

    let (transport, log, control) = bus.parts();
    let classifier =
        FaultClassifier::new(&config.classifier).with_tag(SimulatedBus::driver_tag());
    let monitor = HealthMonitor::new(log, control, classifier);

    let range = search_range(&config, transport.window_size())?;
    let run_id = format!("sim-{}", Uuid::new_v4().simple());
    let state = SearchState::new(run_id, range, config.search.chunk_size)?;
    tracing::info!(
        range = %range,
        faults = args.fault.len(),
        chunks = state.pending.len(),
        "Simulated run"
    );

    let engine = BisectionEngine::new(transport, monitor, MemoryStore::new(), &config);
    let code = execute(engine, state, &config, args.json).await?;
    tracing::info!(
        reads = bus.reads().len(),
        rebinds = bus.rebinds(),
        resets = bus.resets(),
        "Simulation finished"
    );
    Ok(code)
}

async fn execute<T, L, C, S>(
    engine: BisectionEngine<T, L, C, S>,
    state: SearchState,
    config: &BisectConfig,
    json: bool,
) -> Result<ExitCode, BisectError>
where
    T: Transport,
    L: LogSource,
    C: DeviceControl,
    S: CheckpointStore,
{
    let shutdown = Arc::new(Shutdown::new());
    let mut engine = engine.with_shutdown(shutdown.subscribe());
    let listener = tokio::spawn(signals::listen(Arc::clone(&shutdown)));

    let outcome = engine.run(state).await;
    listener.abort();

    match outcome? {
        RunOutcome::Completed(report) => {
            print_report(&report, json)?;
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Interrupted(state) => {
            print_report(&RunReport::from_state(&state, &config.report.regions), json)?;
            eprintln!(
                "interrupted at checkpoint {}; continue with `mmio-bisect resume --run-id {}`",
                state.sequence, state.run_id
            );
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        RunOutcome::Aborted { reason, state } => {
            print_report(&RunReport::from_state(&state, &config.report.regions), json)?;
            eprintln!(
                "aborted: {}; continue with `mmio-bisect resume --run-id {}` once the device is back",
                reason, state.run_id
            );
            Ok(ExitCode::from(EXIT_ABORTED))
        }
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<(), BisectError> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}
