use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use station_flow::engine::FlagStore;
use station_flow::prelude::*;
use station_flow::{latest_run, LatestRun};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "station-flow")]
#[command(about = "Run resumable hardware test station sequences", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) the station sequence for a serial number
    Run {
        /// Path to the station YAML file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Serial number of the unit under test
        #[arg(long)]
        sn: String,

        /// Record the run as a debug run
        #[arg(long)]
        debug: bool,

        /// Clear all step flags before running
        #[arg(long)]
        reset: bool,
    },

    /// Validate a station file without running it
    Validate {
        /// Path to the station YAML file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Show the latest run and step flags for a serial number
    Status {
        /// Path to the station YAML file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Serial number of the unit under test
        #[arg(long)]
        sn: String,
    },

    /// Clear the step flags of the latest run so the unit can be re-tested
    Reset {
        /// Path to the station YAML file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Serial number of the unit under test
        #[arg(long)]
        sn: String,
    },
}

fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose {
        "station_flow=debug"
    } else {
        "station_flow=info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

#[cfg(feature = "otel")]
fn init_otel_tracing(verbose: bool) {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime::Tokio;
    use opentelemetry_sdk::trace::TracerProvider;

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            init_tracing(verbose);
            tracing::warn!(error = %e, "Failed to create OTLP exporter, tracing locally only");
            return;
        }
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .build();

    let tracer = provider.tracer("station-flow");
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    opentelemetry::global::set_tracer_provider(provider);
}

fn init_tracing(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    #[cfg(feature = "otel")]
    init_otel_tracing(cli.verbose);

    #[cfg(not(feature = "otel"))]
    init_tracing(cli.verbose);

    let result = run(cli).await;

    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    match cli.command {
        Commands::Run {
            config,
            sn,
            debug,
            reset,
        } => run_station(config, sn, debug, reset).await,
        Commands::Validate { config } => validate(config),
        Commands::Status { config, sn } => status(config, sn),
        Commands::Reset { config, sn } => reset_flags(config, sn),
    }
}

fn load_station(path: &Path) -> anyhow::Result<StationConfig> {
    if !path.exists() {
        anyhow::bail!("Station file not found: {}", path.display());
    }
    Ok(StationLoader::load_file(path)?)
}

#[tracing::instrument(skip(config_path, debug, reset), fields(config = %config_path.display()))]
async fn run_station(config_path: PathBuf, sn: String, debug: bool, reset: bool) -> anyhow::Result<bool> {
    let config = load_station(&config_path)?;
    let mut orchestrator = Orchestrator::new(config, OrchestratorOptions { sn, debug })?;

    println!("Station: {}", config_path.display());
    println!(
        "Run ID: {}{}\n",
        orchestrator.run_id(),
        if orchestrator.is_resumed() { " (resumed)" } else { "" }
    );

    if reset {
        orchestrator.reset_step_flags();
        println!("Step flags cleared\n");
    }

    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RunEvent::LogLine { text }) => print!("{}", text),
                Ok(RunEvent::StepFinished { sid, result }) => {
                    let mark = if result.state == StepState::Pass { "✓" } else { "✗" };
                    println!("{} {} {} ({})", mark, sid, result.state, result.matched_rule);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let control = orchestrator.control();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStop requested, finishing current attempt...");
            control.stop();
        }
    });

    let summary = orchestrator.run_all().await;
    interrupt.abort();
    let _ = interrupt.await;
    drop(orchestrator);
    let _ = printer.await;

    println!("\n=== Run Result ===\n");
    println!("Status: {}", summary.status);
    println!("Pointer: {}", summary.pointer);
    if let Some(report) = &summary.report {
        println!("Report: {}", report.display());
    }

    Ok(summary.status == RunStatus::Pass)
}

fn validate(config_path: PathBuf) -> anyhow::Result<bool> {
    let config = load_station(&config_path)?;
    let diagnostics = config.validate();

    if diagnostics.is_empty() {
        println!(
            "✓ {} is valid ({} steps)",
            config_path.display(),
            config.steps.len()
        );
        return Ok(true);
    }

    println!("✗ {} has malformed pass rules:", config_path.display());
    for diagnostic in &diagnostics {
        println!("  {}", diagnostic);
    }
    Ok(false)
}

fn status(config_path: PathBuf, sn: String) -> anyhow::Result<bool> {
    let config = load_station(&config_path)?;
    let runs_root = config.runs_root();

    let Some(LatestRun {
        run_id,
        status,
        updated_at,
        ..
    }) = latest_run(&runs_root, &sn)
    else {
        println!("No runs recorded for {}", sn);
        return Ok(true);
    };

    println!("Serial: {}", sn);
    println!("Run ID: {}", run_id);
    println!(
        "Status: {}",
        status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string())
    );
    println!("Updated: {}\n", updated_at);

    let flags = FlagStore::new(runs_root.join(&sn).join(&run_id)).load_all();
    for step in &config.steps {
        let sid = step.sid();
        match flags.get(&sid) {
            Some(flag) => println!("  {:<32} {:<8} {}", sid, flag.status, flag.updated_at),
            None => println!("  {:<32} {}", sid, StepState::NotRun),
        }
    }
    Ok(true)
}

fn reset_flags(config_path: PathBuf, sn: String) -> anyhow::Result<bool> {
    let config = load_station(&config_path)?;
    if latest_run(&config.runs_root(), &sn).is_none() {
        anyhow::bail!("No runs recorded for {}", sn);
    }

    let mut orchestrator = Orchestrator::attach_latest(config, OrchestratorOptions::new(sn))?;
    orchestrator.reset_step_flags();
    println!("✓ Cleared step flags for run {}", orchestrator.run_id());
    Ok(true)
}
