use proxima_server::config::AppConfig;
use proxima_server::store::Stores;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    proxima_shared::middleware::init_tracing("proxima-server");

    let config = AppConfig::load()?;
    let port = config.port;

    let stores = match &config.database_url {
        Some(url) => {
            let pool = proxima_shared::clients::db::create_pool(url, config.db_pool_size)?;
            tracing::info!("using postgres store");
            Stores::postgres(pool)
        }
        None => {
            tracing::warn!("PROXIMA__DATABASE_URL not set, using in-memory store");
            Stores::memory(config.location.grid_cell_deg)
        }
    };

    // Initialize Prometheus metrics
    let metrics_handle = proxima_shared::middleware::init_metrics()?;

    let (app, state) = proxima_server::build_app(config, stores, Some(metrics_handle));

    let sweeper = state.locations.clone().spawn_sweeper();

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "proxima-server starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("proxima-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
