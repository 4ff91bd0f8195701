use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use previewd::api::rate_limit::spawn_cleanup_task;
use previewd::config::Config;
use previewd::events::EventLog;
use previewd::orchestrator::Orchestrator;
use previewd::provisioner::ProvisionerFactory;
use previewd::reconciler::Reconciler;
use previewd::runtime::detect_runtime;
use previewd::AppState;

#[derive(Parser, Debug)]
#[command(name = "previewd")]
#[command(author, version, about = "Ephemeral preview environment orchestrator", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "previewd.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    let log_level = cli.log_level.as_ref().unwrap_or(&config.logging.level).clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting previewd v{}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = previewd::api::metrics::init_metrics();
    tracing::info!("Prometheus metrics initialized at /metrics");

    let db = previewd::db::init(&config.server.data_dir).await?;

    let runtime = detect_runtime(&config.runtime).await?;

    let provisioners = Arc::new(ProvisionerFactory::new(
        config.relational_a.clone(),
        config.relational_b.clone(),
        config.document.clone(),
        None,
    ));

    let events = EventLog::new();

    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        runtime.clone(),
        provisioners.clone(),
        events.clone(),
        config.clone(),
    ));

    let reconciler_handle = Arc::new(Reconciler::new(db.clone(), runtime.clone(), orchestrator.clone(), config.clone())).spawn();

    let state = Arc::new(AppState::new(config.clone(), db.clone(), runtime.clone(), orchestrator.clone(), events.clone()).with_metrics(metrics_handle));

    spawn_cleanup_task(state.rate_limiter.clone());
    tracing::info!(
        "Rate limiting enabled: {} req/{}s",
        config.rate_limit.api_requests_per_window,
        config.rate_limit.window_seconds
    );

    let app = previewd::api::create_router(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("previewd listening on http://{}", addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    reconciler_handle.abort();
    provisioners.close_all().await;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
