//! snapshot-import CLI - import a forum snapshot into a relational target.

use clap::{Parser, Subcommand};
use snapshot_import::{units, Config, Engine, ImportError, MappingStore, ProgressUpdate};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "snapshot-import")]
#[command(about = "Dependency-ordered, resumable import of a forum snapshot")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the import (again); already imported rows are skipped
    Run {
        /// Override the insert batch size
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show the execution order and pending rows without writing anything
    Plan,

    /// Show the most recent run recorded in the mapping store
    Status,

    /// Test snapshot, mapping store and target connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ImportError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run { batch_size } => {
            if let Some(size) = batch_size {
                config.import.batch_size = size;
                config.validate()?;
            }

            let mut engine = Engine::connect(&config).await?;
            let printer = if cli.progress {
                let (tx, rx) = mpsc::channel(256);
                engine = engine.with_progress(tx);
                Some(tokio::spawn(print_progress(rx)))
            } else {
                None
            };

            let report = engine.run(units::all_units()?).await?;
            // Dropping the engine closes the progress channel.
            drop(engine);
            if let Some(printer) = printer {
                let _ = printer.await;
            }

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                let status_msg = if report.is_success() {
                    "Import completed!"
                } else {
                    "Import failed!"
                };
                println!("\n{}", status_msg);
                println!("  Run ID: {}", report.run_id);
                println!("  Duration: {:.2}s", report.duration_seconds);
                println!("  Units: {}/{}", report.units.len(), report.plan.len());
                for unit in &report.units {
                    println!(
                        "    {:<16} processed {:>8}  inserted {:>8}  merged {:>6}  skipped {:>6}  rejected {:>6}",
                        unit.unit,
                        unit.rows_processed,
                        unit.rows_inserted,
                        unit.rows_merged,
                        unit.rows_skipped,
                        unit.rows_rejected
                    );
                }
                println!("  Rows inserted: {}", report.rows_inserted);
                println!("  Rows rejected: {}", report.rows_rejected);
                for rejection in &report.rejections {
                    println!(
                        "    {} {}: {}",
                        rejection.unit,
                        rejection.original_id.as_deref().unwrap_or("-"),
                        rejection.reason
                    );
                }
                if report.warning_count > 0 {
                    println!("  Replaced values: {}", report.warning_count);
                }
            }

            if let Some(failure) = report.failure {
                return Err(ImportError::Step {
                    unit: failure.unit,
                    message: failure.message,
                });
            }
        }

        Commands::Plan => {
            let engine = Engine::connect(&config).await?;
            let plan = engine.plan(&units::all_units()?).await?;

            if cli.output_json {
                println!("{}", plan.to_json()?);
            } else {
                println!("Execution plan:");
                for (position, unit) in plan.units.iter().enumerate() {
                    let pending = unit
                        .pending_rows
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "?".to_string());
                    println!(
                        "  {:>2}. {:<16} pending {:>8}  after [{}]",
                        position + 1,
                        unit.unit,
                        pending,
                        unit.dependencies.join(", ")
                    );
                }
            }
        }

        Commands::Status => {
            let mappings = MappingStore::open(&config.mappings.path).await?;
            let Some(run) = mappings.latest_run().await? else {
                println!("No runs recorded");
                return Ok(());
            };

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                println!("Latest run: {}", run.run_id);
                println!("  Status: {:?}", run.status);
                println!("  Started: {}", run.started_at);
                if let Some(completed_at) = run.completed_at {
                    println!("  Completed: {}", completed_at);
                }
                for unit in &run.units {
                    println!(
                        "    {:<16} {:?}  inserted {:>8}  rejected {:>6}",
                        unit.unit, unit.status, unit.rows_inserted, unit.rows_rejected
                    );
                    if let Some(ref err) = unit.error {
                        println!("      Error: {}", err);
                    }
                }
                println!("  Mapped ids: {}", mappings.total_mapped().await?);
            }
        }

        Commands::HealthCheck => {
            let engine = Engine::connect(&config).await?;
            let result = engine.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                let checks = [
                    ("Snapshot", result.snapshot_connected, result.snapshot_latency_ms, &result.snapshot_error),
                    ("Mapping store", result.mappings_connected, result.mappings_latency_ms, &result.mappings_error),
                    ("Target", result.target_connected, result.target_latency_ms, &result.target_error),
                ];
                for (name, connected, latency_ms, error) in checks {
                    println!(
                        "  {}: {} ({}ms)",
                        name,
                        if connected { "OK" } else { "FAILED" },
                        latency_ms
                    );
                    if let Some(err) = error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(ImportError::Config("Health check failed".to_string()));
            }
        }
    }

    Ok(())
}

async fn print_progress(mut rx: mpsc::Receiver<ProgressUpdate>) {
    while let Some(update) = rx.recv().await {
        if let Ok(line) = serde_json::to_string(&update) {
            eprintln!("{}", line);
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    // RUST_LOG, when set, takes precedence over --verbosity.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    // Logs go to stderr so that --output-json keeps stdout clean.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
