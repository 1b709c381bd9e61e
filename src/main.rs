//! Dock consolidator - tracking resolution and outbound consolidation
//!
//! Resolves noisy scanner input to an order-system shipment and its carrier,
//! and keeps the dock's sessions, pallets, pickups and manifests.
//!
//! Module structure:
//! - `domain/` - Core business types (shipments, parcels, consolidation state)
//! - `io/` - External interfaces (Odoo, Sendcloud, snapshot files, HTTP)
//! - `services/` - Business logic (index, resolver, consolidator, scheduler)
//! - `infra/` - Infrastructure (Config, Metrics, state store)

use clap::{Parser, Subcommand};
use dock_consolidator::infra::{Config, JsonFileStore, Metrics};
use dock_consolidator::io::{start_http_server, HttpState, OdooClient, SendcloudClient, SnapshotFiles};
use dock_consolidator::services::{
    Consolidator, IndexBuilder, IndexHandle, ResolutionEngine, SyncScheduler,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Dock consolidator - warehouse outbound scanning backend
#[derive(Parser, Debug)]
#[command(name = "dock-consolidator", version, about)]
struct Args {
    /// Path to TOML configuration file (else CONFIG_FILE, else config/dev.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync scheduler and the HTTP endpoint until Ctrl+C (default)
    Serve,
    /// Rebuild the tracking index once and print its summary
    Sync,
    /// Resolve one scanned code against the persisted index and live systems
    Resolve { code: String },
    /// Add one scanned code to a carrier's session
    Scan { carrier: String, code: String },
}

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-tier resolution detail
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init();
    }
}

/// Shared components built from config
struct App {
    config: Config,
    metrics: Arc<Metrics>,
    index: Arc<IndexHandle>,
    builder: Arc<IndexBuilder>,
    resolver: Arc<ResolutionEngine>,
    orders: Arc<OdooClient>,
}

impl App {
    fn build(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let metrics = Arc::new(Metrics::new());
        let index = Arc::new(IndexHandle::empty());
        let orders = Arc::new(OdooClient::new(&config)?);
        let aggregator = Arc::new(SendcloudClient::new(&config)?);

        let builder = Arc::new(IndexBuilder::new(
            orders.clone(),
            aggregator.clone(),
            index.clone(),
            SnapshotFiles::new(config.data_dir()),
            metrics.clone(),
            config.sync_window_days(),
        ));
        match builder.restore() {
            Ok(Some(_)) => {}
            Ok(None) => info!("index_snapshot_absent"),
            // a corrupt snapshot is replaced by the next build
            Err(e) => warn!(error = %format!("{e:#}"), "index_snapshot_unreadable"),
        }

        let resolver =
            Arc::new(ResolutionEngine::new(index.clone(), orders.clone(), aggregator, metrics.clone()));

        Ok(Self { config, metrics, index, builder, resolver, orders })
    }

    fn consolidator(&self) -> anyhow::Result<Consolidator> {
        Consolidator::open(
            Arc::new(JsonFileStore::new(self.config.data_dir())),
            self.resolver.clone(),
            self.orders.clone(),
            self.metrics.clone(),
            self.config.client_lookback_days(),
        )
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref());
    init_logging(config.log_json());

    info!(git = env!("GIT_HASH"), "dock-consolidator starting");
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        odoo_url = %config.odoo_url(),
        odoo_db = %config.odoo_db(),
        sendcloud_url = %config.sendcloud_url(),
        window_days = %config.sync_window_days(),
        sync_interval_secs = %config.sync_interval_secs(),
        data_dir = %config.data_dir().display(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    let app = App::build(config)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(app).await?,
        Command::Sync => {
            let summary = app.builder.rebuild_now().await?;
            print_json(&summary)?;
        }
        Command::Resolve { code } => {
            let resolution = app.resolver.resolve(&code).await;
            print_json(&resolution)?;
        }
        Command::Scan { carrier, code } => {
            let consolidator = app.consolidator()?;
            let accepted = consolidator.scan(&code, &carrier).await?;
            print_json(&accepted)?;
        }
    }

    Ok(())
}

async fn serve(app: App) -> Result<(), Box<dyn std::error::Error>> {
    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start sync scheduler
    let scheduler = SyncScheduler::new(
        app.builder.clone(),
        app.config.sync_interval(),
        app.config.sync_run_on_start(),
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    // Start HTTP endpoint (if port > 0)
    let http_port = app.config.http_port();
    if http_port > 0 {
        let state = HttpState {
            metrics: app.metrics.clone(),
            site_id: app.config.site_id().to_string(),
            index: app.index.clone(),
            builder: app.builder.clone(),
        };
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_http_server(http_port, state, http_shutdown).await {
                error!(error = %e, "http_server_error");
            }
        });
    }

    // Start metrics reporter
    let metrics = app.metrics.clone();
    let metrics_interval = app.config.metrics_interval_secs();
    let mut reporter_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => metrics.summary().log(),
                _ = reporter_shutdown.changed() => return,
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // let an in-flight build finish so its snapshot lands on disk
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "sync_scheduler_join_failed");
    }

    info!("dock-consolidator shutdown complete");
    Ok(())
}
