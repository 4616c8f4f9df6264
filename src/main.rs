use anyhow::Context;
use google_cloud_storage::client::Storage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use outpost_ingest::analysis::HotspotAnalyzer;
use outpost_ingest::catalog::PgCatalog;
use outpost_ingest::config::IngestConfig;
use outpost_ingest::decoder::FfmpegDecoder;
use outpost_ingest::ingest::Ingestor;
use outpost_ingest::retrieval::Retrieval;
use outpost_ingest::storage::ObjectStore;
use outpost_ingest::{AppState, app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outpost_ingest=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = IngestConfig::from_env();
    tracing::info!(
        concurrency = config.concurrency,
        drain_timeout_secs = config.drain_timeout.as_secs(),
        "Loaded configuration"
    );

    let catalog = PgCatalog::connect(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    catalog
        .run_migrations()
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    let store = match &config.local_storage_path {
        Some(root) => {
            tracing::info!(root = %root.display(), "Using local object storage");
            ObjectStore::local(root)
        }
        None => {
            // GCS client uses GOOGLE_APPLICATION_CREDENTIALS env var
            let gcs = Storage::builder()
                .build()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create GCS client: {}", e))?;
            tracing::info!(bucket = %config.bucket_name, "Using GCS object storage");
            ObjectStore::gcs(gcs, &config.bucket_name)
        }
    };

    let catalog = Arc::new(catalog);
    let ingestor = Ingestor::new(
        catalog.clone(),
        store.clone(),
        Arc::new(FfmpegDecoder::new(config.ffmpeg_threads)),
        Arc::new(HotspotAnalyzer::new(config.camera_fov_degrees)),
    )
    .with_concurrency(config.concurrency)
    .with_drain_timeout(config.drain_timeout);

    let shutdown = CancellationToken::new();
    let ingests = TaskTracker::new();
    let state = Arc::new(AppState {
        ingestor: Arc::new(ingestor),
        retrieval: Retrieval::new(catalog, store),
        shutdown: shutdown.clone(),
        ingests: ingests.clone(),
    });

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(%addr, "Listening");

    axum::serve(listener, app(state, config.max_request_body_bytes))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("Server failed")?;

    // Ingests whose clients already disconnected are still draining.
    ingests.close();
    if !ingests.is_empty() {
        tracing::info!(running = ingests.len(), "Waiting for ingests to drain");
    }
    ingests.wait().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM and cancel running ingests.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining ingests");
    shutdown.cancel();
}
