use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use transcode_pipeline::app;
use transcode_pipeline::common::scratch::ScratchSpace;
use transcode_pipeline::config::settings::{AppConfig, LedgerBackend, StorageBackend};
use transcode_pipeline::infrastructure::db::pool::{connect_to_db, run_migrations};
use transcode_pipeline::infrastructure::storage::{LocalStorageGateway, S3StorageGateway, StorageGateway};
use transcode_pipeline::infrastructure::transcode::FfmpegEngine;
use transcode_pipeline::modules::jobs::memory::MemoryJobLedger;
use transcode_pipeline::modules::jobs::repository::{JobLedger, PgJobLedger};
use transcode_pipeline::state::AppState;
use transcode_pipeline::workers::scheduler::{Scheduler, SchedulerConfig};
use transcode_pipeline::workers::transcoder::TranscodeWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting transcode pipeline...");

    let config = AppConfig::new().context("invalid configuration")?;

    let ledger: Arc<dyn JobLedger> = match config.ledger_backend {
        LedgerBackend::Postgres => {
            let url = config.database_url.as_deref().context("DATABASE_URL is not set")?;
            let pool = connect_to_db(url, (config.worker_concurrency as u32 * 2).max(5))
                .await
                .context("failed to connect to PostgreSQL")?;
            run_migrations(&pool).await.context("failed to migrate ledger")?;
            Arc::new(PgJobLedger::new(pool))
        }
        LedgerBackend::Memory => {
            info!("⚠️ Using in-memory ledger, jobs will not survive a restart");
            Arc::new(MemoryJobLedger::new())
        }
    };

    let storage: Arc<dyn StorageGateway> = match (&config.storage_backend, &config.s3) {
        (StorageBackend::S3, Some(s3)) => Arc::new(S3StorageGateway::new(s3)),
        (StorageBackend::S3, None) => anyhow::bail!("S3 storage selected without S3 settings"),
        (StorageBackend::Local, _) => Arc::new(
            LocalStorageGateway::new(&config.local_storage_root)
                .await
                .context("failed to prepare local object store")?,
        ),
    };

    let scratch = ScratchSpace::new(&config.scratch_dir)
        .await
        .context("failed to prepare scratch directory")?;
    let engine = Arc::new(FfmpegEngine::new(&config.ffmpeg_path, config.ffprobe_path.clone()));
    let worker = TranscodeWorker::new(storage, engine, scratch);

    let scheduler = Scheduler::new(ledger.clone(), worker, SchedulerConfig::from_app(&config));
    scheduler.recover().await.context("startup recovery failed")?;
    let dispatcher = scheduler.start();

    let port = config.server_port;
    let state = AppState::new(config, ledger, scheduler.clone());
    let app = app::create_app(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("🚀 Server running on http://{}", addr);

    let fatal = scheduler.fatal_signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(fatal.clone()))
        .await
        .context("server error")?;

    scheduler.shutdown().await;
    if let Err(e) = dispatcher.await {
        error!(error = %e, "Dispatch loop ended abnormally");
    }

    if fatal.is_cancelled() {
        anyhow::bail!("ledger durability failure, service halted");
    }

    info!("👋 Shutdown complete");
    Ok(())
}

async fn shutdown_signal(fatal: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
        _ = fatal.cancelled() => error!("Fatal ledger failure, shutting down"),
    }
}
