use std::sync::Arc;

use fleet_control_plane::config::{AppConfig, StoreConfig};
use fleet_control_plane::store::PgStore;
use fleet_control_plane::ControlPlane;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = AppConfig::from_env();
    let store_config = StoreConfig::from_env()?;

    let store = Arc::new(PgStore::connect(&store_config.database_url).await?);
    tracing::info!("store connected and migrated");

    let plane = ControlPlane::new(store, config.clone());

    let scheduler = plane.scheduler();
    let shutdown = scheduler.shutdown_token();
    let job_handles = scheduler.spawn_all();

    let app = fleet_control_plane::api::build_router(plane.api_state());
    let listener = tokio::net::TcpListener::bind(&config.api.bind_addr).await?;
    tracing::info!(addr = %config.api.bind_addr, "listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    serve.await?;

    shutdown.cancel();
    for handle in job_handles {
        let _ = handle.await;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
