//! Backrest - Main Entry Point

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use backrest::clock::SystemClock;
use backrest::config::{
    RuntimeConfig, EXIT_BINARY_MISSING, EXIT_CONFIG_INVALID, EXIT_DATA_UNWRITABLE,
};
use backrest::services::config_service::ConfigManager;
use backrest::services::logstore_service::LogStore;
use backrest::services::oplog_service::OpLog;
use backrest::services::scheduler_service::Orchestrator;
use backrest::services::sync_service::SyncBridge;
use backrest::{api, db};

/// How long in-flight tasks get to drain on shutdown.
const DRAIN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    backrest::telemetry::init_tracing();

    let runtime = RuntimeConfig::from_env();
    tracing::info!(data_dir = ?runtime.data_dir, "starting backrest");

    if let Err(e) = runtime.ensure_data_dir() {
        tracing::error!(error = %e, "data directory is not writable");
        return ExitCode::from(EXIT_DATA_UNWRITABLE as u8);
    }

    let binary = match runtime.find_restic_binary() {
        Ok(binary) => binary,
        Err(e) => {
            tracing::error!(error = %e, "backup binary not found");
            return ExitCode::from(EXIT_BINARY_MISSING as u8);
        }
    };
    tracing::info!(binary = ?binary, "using backup binary");

    let default_instance = hostname();
    let config = match ConfigManager::load(&runtime.config_path, &default_instance).await {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            tracing::error!(error = %e, "configuration invalid");
            return ExitCode::from(EXIT_CONFIG_INVALID as u8);
        }
    };
    let instance_id = config.get().instance.clone();

    match run(runtime, binary, config, &instance_id).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    runtime: RuntimeConfig,
    binary: std::path::PathBuf,
    config: Arc<ConfigManager>,
    instance_id: &str,
) -> backrest::Result<()> {
    let pool = db::create_pool(&runtime.oplog_path()).await?;
    db::init_schema(&pool).await?;
    let oplog = OpLog::open(pool, instance_id).await?;
    tracing::info!(path = ?runtime.oplog_path(), "operation log open");

    // Anything still marked running was interrupted by the previous
    // shutdown; rewrite before the scheduler can hand out new work.
    oplog.recover_in_progress(chrono::Utc::now()).await?;

    let logstore = LogStore::new(runtime.tasklogs_dir())?;
    let sync = Arc::new(SyncBridge::new(Arc::clone(&oplog)));

    let orchestrator = Orchestrator::new(
        Arc::clone(&oplog),
        logstore.clone(),
        Arc::clone(&config),
        binary.clone(),
        Arc::new(SystemClock),
    );

    let shutdown = CancellationToken::new();
    let orchestrator_task = tokio::spawn(
        Arc::clone(&orchestrator).run(shutdown.clone()),
    );

    let state = api::AppState::new(
        config,
        Arc::clone(&oplog),
        logstore,
        Arc::clone(&orchestrator),
        sync,
        binary,
    );

    let app = Router::new()
        .merge(api::routes::create_router(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("0.0.0.0:{}", runtime.port).parse()?;
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    // The orchestrator observes the same token and drains its tasks.
    let _ = tokio::time::timeout(DRAIN_DEADLINE, orchestrator_task).await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    tracing::info!("shutdown signal received");
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "backrest".to_string())
}
