use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hccflow_ai::{HttpBackend, InferenceClient, Pipeline, ReferenceHandle, ReferenceIndex};
use hccflow_core::{AnalyzerConfig, ConfigError, ExtractionArtifact};
use hccflow_runner::{Consumer, Runner, run_batch};
use hccflow_store::{ArtifactStore, DuckStatusSink, LocalArtifacts, NoopSink, StatusSink};
use hccflow_sync::HttpBroker;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod display;
mod settings;

use settings::{AnalyzerArgs, BrokerArgs, ReferenceArgs, StorageArgs};

#[derive(Parser)]
#[command(name = "hccflow")]
#[command(about = "HCC relevance analysis for extracted medical conditions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume extraction events from the queue gateway until interrupted
    Consume(ConsumeArgs),

    /// Analyse every extraction artifact in the input directory
    Batch(BatchArgs),

    /// Analyse a single extraction artifact and print the result
    Run(RunArgs),

    /// Load the reference table and print a summary
    Reference(ReferenceCmdArgs),

    /// Print a saved analysis result
    Show(ShowArgs),
}

#[derive(Args)]
struct ConsumeArgs {
    #[command(flatten)]
    analyzer: AnalyzerArgs,
    #[command(flatten)]
    storage: StorageArgs,
    #[command(flatten)]
    broker: BrokerArgs,
}

#[derive(Args)]
struct BatchArgs {
    #[command(flatten)]
    analyzer: AnalyzerArgs,
    #[command(flatten)]
    storage: StorageArgs,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    analyzer: AnalyzerArgs,
    /// Extraction artifact (JSON)
    file: PathBuf,
    /// Print the result artifact as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ReferenceCmdArgs {
    #[command(flatten)]
    reference: ReferenceArgs,
    /// Entries to list
    #[arg(long, default_value_t = 5)]
    sample: usize,
}

#[derive(Args)]
struct ShowArgs {
    /// Result reference, e.g. `doc-1_analyzed.json`
    reference: String,
    #[arg(long, env = "OUTPUT_DIR", default_value = "./output")]
    output_dir: PathBuf,
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("hccflow v{}", env!("CARGO_PKG_VERSION"));

    let outcome = match cli.command {
        Commands::Consume(args) => consume(args).await,
        Commands::Batch(args) => batch(args).await,
        Commands::Run(args) => run(args).await,
        Commands::Reference(args) => reference(args),
        Commands::Show(args) => show(args).await,
    };
    if let Err(e) = &outcome {
        error!(error = format!("{e:#}"), "hccflow failed");
    }
    outcome
}

// ── Subcommands ──

async fn consume(args: ConsumeArgs) -> Result<()> {
    let mut config = args.analyzer.to_config()?;
    args.broker.apply(&mut config)?;

    let pipeline = Arc::new(build_pipeline(&config)?);
    let artifacts = Arc::new(LocalArtifacts::new(
        args.storage.input_dir.clone(),
        args.storage.output_dir.clone(),
    ));
    let status = status_sink(&args.storage)?;
    let broker = Arc::new(
        HttpBroker::new(
            &args.broker.broker_url,
            args.broker.queue.clone(),
            args.broker.exchange.clone(),
            args.broker.request_timeout(),
        )
        .context("creating broker client")?,
    );
    info!(
        broker = %args.broker.broker_url,
        queue = %args.broker.queue,
        exchange = %args.broker.exchange,
        "consuming extraction events"
    );

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());
    #[cfg(unix)]
    reload_on_hangup(pipeline.reference().clone(), &config, shutdown.clone());

    let runner = Arc::new(Runner::new(pipeline, artifacts, broker, status, &config.runner));
    let inference_timeout = config
        .inference
        .as_ref()
        .map_or(Duration::ZERO, |s| s.timeout);
    let stats = Consumer::new(runner, &config.runner, inference_timeout)
        .run(shutdown)
        .await;

    if stats.aborted > 0 {
        warn!(aborted = stats.aborted, "some deliveries were aborted and will be redelivered");
    }
    Ok(())
}

async fn batch(args: BatchArgs) -> Result<()> {
    let config = args.analyzer.to_config()?;
    let pipeline = Arc::new(build_pipeline(&config)?);
    let artifacts = Arc::new(LocalArtifacts::new(
        args.storage.input_dir.clone(),
        args.storage.output_dir.clone(),
    ));
    let status = status_sink(&args.storage)?;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let report = run_batch(
        pipeline,
        artifacts,
        status,
        config.runner.worker_concurrency,
        &cancel,
    )
    .await
    .with_context(|| format!("reading {}", args.storage.input_dir.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        display::print_batch_report(&report);
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.analyzer.to_config()?;
    let pipeline = build_pipeline(&config)?;

    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let artifact = ExtractionArtifact::from_slice(&bytes)
        .with_context(|| format!("parsing {}", args.file.display()))?;
    let document_id = artifact.document_id.clone();

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    let run = pipeline
        .run(&document_id, artifact.into_conditions(), &cancel)
        .await;

    let result = run.result.to_artifact();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        display::print_result_card(&result);
    }

    if let Some(e) = run.error() {
        anyhow::bail!("analysis of {document_id} ended in {}: {e}", run.state().as_str());
    }
    Ok(())
}

fn reference(args: ReferenceCmdArgs) -> Result<()> {
    let path = &args.reference.path;
    let index = ReferenceIndex::load(path, &args.reference.columns())
        .with_context(|| format!("loading {}", path.display()))?;
    display::print_reference_summary(&index.summary(), index.sample(args.sample));
    Ok(())
}

async fn show(args: ShowArgs) -> Result<()> {
    let store = LocalArtifacts::new(args.output_dir.clone(), args.output_dir.clone());
    let result = store
        .load_result(&args.reference)
        .await
        .with_context(|| format!("loading {}", args.reference))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        display::print_result_card(&result);
    }
    Ok(())
}

// ── Wiring ──

fn build_pipeline(config: &AnalyzerConfig) -> Result<Pipeline> {
    let reference = ReferenceHandle::load(&config.reference_path, &config.reference_columns)
        .map_err(ConfigError::from)
        .with_context(|| format!("loading {}", config.reference_path.display()))?;

    let summary = reference.current().summary();
    info!(
        path = %config.reference_path.display(),
        entries = summary.entries,
        categories = summary.distinct_categories,
        skipped = summary.skipped_rows,
        duplicates = summary.duplicate_rows,
        "reference data loaded"
    );

    let inference = config.inference.as_ref().map(|s| {
        info!(endpoint = %s.endpoint, model = %s.model, "inference enabled");
        InferenceClient::new(Arc::new(HttpBackend::from_settings(s)), s)
    });
    if inference.is_none() {
        info!("inference disabled, deterministic matching only");
    }

    Ok(Pipeline::new(reference, config, inference))
}

fn status_sink(storage: &StorageArgs) -> Result<Arc<dyn StatusSink>> {
    match &storage.status_db {
        Some(path) => {
            let sink = DuckStatusSink::open_persistent(path)
                .with_context(|| format!("opening status database {}", path.display()))?;
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(NoopSink)),
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// Reload the reference table on SIGHUP; a failed reload keeps the current
/// index.
#[cfg(unix)]
fn reload_on_hangup(handle: ReferenceHandle, config: &AnalyzerConfig, shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let path = config.reference_path.clone();
    let columns = config.reference_columns.clone();
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGHUP, reference reload disabled");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!(path = %path.display(), "reloading reference data");
                    if let Err(e) = handle.reload(path.clone(), columns.clone()).await {
                        error!(error = %e, "reference reload failed");
                    }
                }
            }
        }
    });
}
