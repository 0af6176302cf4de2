use anyhow::Context;
use server::{DeploymentImpl, routes};
use services::services::config::Config;
use tracing::info;
use utils::log::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,sqlx=warn,tower_http=info");
    let config = Config::from_env().context("invalid configuration")?;

    info!(
        environment = %config.environment,
        bind_addr = %config.bind_addr,
        "Starting construction management API"
    );

    let bind_addr = config.bind_addr.clone();
    let deployment = DeploymentImpl::new(config)
        .await
        .context("failed to initialise deployment")?;
    let sync_worker = deployment.spawn_background_tasks();

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, routes::router(deployment))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sync_worker.abort();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
