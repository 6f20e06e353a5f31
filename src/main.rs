mod client;
mod config;
mod coordinator;
mod error;
mod filter;
mod http;
mod ingest;
mod metrics;
mod model;
mod pressure;
mod segment;
mod shipper;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::Config;
use error::AgentError;
use filter::FilterConfig;
use http::custom_metrics::CustomMetricsState;
use http::health::HealthRegistry;
use http::AppState;
use ingest::{CollectorIdentity, IngestPipeline};
use metrics::Metrics;
use model::ContentKind;
use segment::{SegmentStore, SegmentStoreConfig};
use shipper::{Shipper, ShipperConfig};

#[derive(Parser)]
#[command(name = "cost-metrics-agent", version, about = "Kubernetes cost/observability metrics collector and shipper")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, global = true, default_value = "/etc/cost-metrics-agent/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the long-running collector: ingestion HTTP surface, custom-metrics
    /// endpoint, and background segment rotation.
    Agent,

    /// Run one shipper cycle: discover sealed segments, upload them, process
    /// replay requests, run disk-pressure cleanup.
    Ship,

    /// Dev/ops tool: decode a sealed segment file and print its sample count
    /// and a short preview.
    Inspect {
        /// Path to a `<kind>_<open>_<close>.json.br` segment file.
        path: PathBuf,

        /// Number of samples to print.
        #[arg(long, default_value = "5")]
        preview: usize,
    },
}

fn init_logging(daily_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match daily_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cost-metrics-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    }
}

fn identity_from(cfg: &Config) -> CollectorIdentity {
    CollectorIdentity {
        cluster_name: cfg.cluster_name.clone(),
        cloud_account_id: cfg.cloud_account_id.clone(),
        node_name: cfg.node_name.clone(),
    }
}

async fn run_agent(cfg: Config) -> anyhow::Result<()> {
    let cost_store = Arc::new(SegmentStore::new(
        cfg.cost_dir(),
        ContentKind::Metrics,
        cfg.node_name.clone(),
        SegmentStoreConfig {
            row_limit: cfg.row_limit,
            max_interval: cfg.cost_max_interval(),
            compression_level: cfg.compression_level,
        },
    )?);
    let observability_store = Arc::new(SegmentStore::new(
        cfg.observability_dir(),
        ContentKind::Observability,
        cfg.node_name.clone(),
        SegmentStoreConfig {
            row_limit: cfg.row_limit,
            max_interval: cfg.observability_max_interval(),
            compression_level: cfg.compression_level,
        },
    )?);

    let filter: FilterConfig = cfg.filter.clone().into();
    let metrics = Arc::new(Metrics::new()?);
    let ingest = Arc::new(IngestPipeline::new(
        identity_from(&cfg),
        filter,
        cost_store.clone(),
        observability_store.clone(),
        metrics.clone(),
    ));

    let kube_client = if cfg.kubernetes.enabled {
        kube::Client::try_default().await.ok()
    } else {
        None
    };

    let mut health = HealthRegistry::new();
    let store_dir = cfg.store_dir.clone();
    health.register("store_dir_writable", move || {
        std::fs::metadata(&store_dir)
            .map(|_| ())
            .map_err(|e| e.to_string())
    });

    let custom_metrics = Arc::new(CustomMetricsState {
        cost_store: cost_store.clone(),
        row_limit: cfg.row_limit,
        max_interval: cfg.cost_max_interval(),
        kube_client,
        component_label: cfg.kubernetes.component_label.clone(),
    });

    let state = AppState {
        ingest,
        metrics,
        health: Arc::new(health),
        custom_metrics,
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    let bind_addr = cfg.bind_addr.clone();
    let server = tokio::spawn(async move {
        tracing::info!(addr = %bind_addr, "serving HTTP");
        axum::serve(listener, app).await
    });

    let rotation_tick = Duration::from_secs(30);
    coordinator::run_until_shutdown(
        cfg.store_dir.clone(),
        cost_store,
        observability_store,
        rotation_tick,
    )
    .await?;

    server.abort();
    Ok(())
}

async fn run_ship(cfg: Config) -> anyhow::Result<()> {
    let cost_store = Arc::new(SegmentStore::new(
        cfg.cost_dir(),
        ContentKind::Metrics,
        cfg.node_name.clone(),
        SegmentStoreConfig {
            row_limit: cfg.row_limit,
            max_interval: cfg.cost_max_interval(),
            compression_level: cfg.compression_level,
        },
    )?);
    let metrics = Arc::new(Metrics::new()?);
    let cancelled = Arc::new(AtomicBool::new(false));

    let shipper = Shipper::new(
        ShipperConfig {
            base_dir: cfg.cost_dir(),
            remote_base_url: cfg.remote.url.clone(),
            api_key: cfg.remote.api_key.clone(),
            cluster_name: cfg.cluster_name.clone(),
            cloud_account_id: cfg.cloud_account_id.clone(),
            region: cfg.region.clone(),
            send_timeout: cfg.send_timeout(),
            purge_older_than: Duration::from_secs(cfg.purge_older_than_days as u64 * 24 * 3600),
        },
        cost_store,
        metrics,
        cancelled.clone(),
    )?;

    // Race the shutdown signal in the background; the main loop only polls
    // the flag it sets, so an in-flight `run_cycle` (and every retry inside
    // it) observes cancellation without needing to be wrapped in a select.
    let signal_flag = cancelled.clone();
    tokio::spawn(async move {
        match coordinator::wait_for_shutdown_signal().await {
            Ok(reason) => {
                tracing::info!(signal = reason, "shutting down");
                signal_flag.store(true, Ordering::SeqCst);
            }
            Err(e) => tracing::warn!(error = %e, "failed to install signal handler"),
        }
    });

    while !cancelled.load(Ordering::SeqCst) {
        if let Err(e) = shipper.run_cycle().await {
            tracing::warn!(error = %e, "shipper cycle failed, retrying next interval");
        }
        let mut remaining = cfg.send_interval();
        while remaining > Duration::ZERO && !cancelled.load(Ordering::SeqCst) {
            let step = Duration::from_millis(250).min(remaining);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }

    // Per spec.md §4.H/§9: the shipper drains one final batch once it
    // observes the collector has flushed and exited, then exits 0 itself.
    let wait_timeout = Duration::from_secs(30);
    if coordinator::wait_for_collector_shutdown(&cfg.store_dir, wait_timeout).await {
        cancelled.store(false, Ordering::SeqCst);
        match shipper.run_cycle().await {
            Ok(()) => tracing::info!("drained final batch after collector shutdown"),
            Err(e) => tracing::warn!(error = %e, "final drain cycle failed"),
        }
    }
    Ok(())
}

fn run_inspect(path: PathBuf, preview: usize) -> anyhow::Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AgentError::InvalidInput("segment path has no filename".into()))?;
    let kind_str = name.split('_').next().unwrap_or("");
    let kind = ContentKind::parse(kind_str)
        .ok_or_else(|| AgentError::InvalidInput(format!("unrecognized content-kind prefix: {kind_str}")))?;

    let dir = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    let store = SegmentStore::new(dir, kind, "inspect", SegmentStoreConfig::default())?;
    let samples = store.read_segment(&path)?;

    println!("{} samples in {}", samples.len(), path.display());
    for sample in samples.iter().take(preview) {
        println!(
            "  {} {} = {} @ {}",
            sample.metric_name, sample.id, sample.value, sample.timestamp
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Agent => {
            let cfg = Config::load(&cli.config)?;
            let _guard = init_logging(Some(&cfg.store_dir.join("logs")));
            run_agent(cfg).await
        }
        Commands::Ship => {
            let cfg = Config::load(&cli.config)?;
            let _guard = init_logging(None);
            run_ship(cfg).await
        }
        Commands::Inspect { path, preview } => {
            init_logging(None);
            run_inspect(path, preview)
        }
    }
}
