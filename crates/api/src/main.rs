use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use brandkit_api::config::ServerConfig;
use brandkit_api::router::build_app_router;
use brandkit_api::{background, state};
use brandkit_db::PgJobStore;
use brandkit_pipeline::{BuildJobManager, PipelineConfig};

use state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "brandkit_api=debug,brandkit_pipeline=debug,tower_http=debug".into()
    });
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env().expect("Invalid server configuration");
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let pipeline_config = PipelineConfig::from_env().expect("Invalid pipeline configuration");
    tracing::info!(
        template_root = %pipeline_config.template_root.display(),
        scratch_dir = %pipeline_config.scratch_dir.display(),
        output_dir = %pipeline_config.output_dir.display(),
        publishing = pipeline_config.storage.is_some(),
        "Loaded pipeline configuration"
    );

    // --- Database ---
    let pool = brandkit_db::create_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    brandkit_db::health_check(&pool)
        .await
        .expect("Database health check failed");

    brandkit_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Build manager ---
    let manager = BuildJobManager::new(pipeline_config, Arc::new(PgJobStore::new(pool)));
    match manager.recover_interrupted().await {
        Ok(0) => {}
        Ok(recovered) => tracing::warn!(recovered, "Marked interrupted builds as failed"),
        Err(e) => tracing::error!(error = %e, "Failed to recover interrupted builds"),
    }

    // --- Background tasks ---
    let sweep_cancel = CancellationToken::new();
    let sweep_handle = tokio::spawn(background::workspace_sweep::run(
        manager.clone(),
        Duration::from_secs(config.workspace_sweep_interval_secs.max(1)),
        sweep_cancel.clone(),
    ));

    // --- Router ---
    let state = AppState::new(manager.clone(), config.clone());
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    sweep_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), sweep_handle).await;
    tracing::info!("Workspace sweep stopped");

    let grace = Duration::from_secs(config.shutdown_timeout_secs);
    if manager.shutdown(grace).await {
        tracing::info!("Build manager shut down");
    } else {
        tracing::warn!("Build manager shutdown timed out");
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
