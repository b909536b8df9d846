mod config;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parlor_api::attachments::AttachmentStore;
use parlor_api::profiles;
use parlor_api::routes;
use parlor_api::state::AppStateInner;
use parlor_db::Database;
use parlor_gateway::hub::Hub;

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parlor=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let db = Database::open(&config.db_path)?;
    let attachments = AttachmentStore::new(config.attachment_dir.clone()).await?;
    let hub = Hub::new();
    let state = AppStateInner::build(db, hub.clone(), attachments, config.jwt_secret.clone())?;

    // First tick fires immediately, so ranks are warm before traffic arrives.
    tokio::spawn(profiles::run_rank_refresh_loop(
        state.clone(),
        config.rank_refresh,
    ));

    let app = routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Parlor chat server listening on {}", config.addr);
    info!(
        "Database: {}, attachments: {}",
        config.db_path.display(),
        config.attachment_dir.display()
    );

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub.clone()))
        .await?;

    Ok(())
}

/// Resolves on Ctrl+C / SIGTERM after releasing every gateway connection, so
/// open sockets don't hold graceful shutdown hostage.
async fn shutdown_signal(hub: Hub) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }

    let closed = hub.close_all();
    info!("Closed {} chat connections", closed);
}
