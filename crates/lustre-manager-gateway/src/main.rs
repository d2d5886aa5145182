//! Lustre manager job scheduler.
//!
//! Opens the store, starts the scheduler (recovering any jobs interrupted by
//! the last shutdown) and serves the gateway until interrupted.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lustre_manager_gateway::{create_router, GatewayConfig, GatewayState};
use lustre_manager_scheduler::{
    AgentMessenger, HttpTransport, JobScheduler, SchedulerConfig, SchedulerContext,
    SchedulerService, ShellLocalActions,
};
use lustre_manager_store::RocksStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lustre_manager=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Lustre manager job scheduler");

    let config = SchedulerConfig::from_env();
    let gateway_config = GatewayConfig::from_env();

    tracing::info!(
        listen_addr = %gateway_config.listen_addr,
        data_dir = %config.data_dir.display(),
        http_agent_url = %config.http_agent_url,
        max_parallel_jobs = config.max_parallel_jobs,
        "Configuration loaded"
    );

    tracing::info!(path = %config.data_dir.display(), "Opening RocksDB store");
    let store = Arc::new(RocksStore::open(&config.data_dir)?);

    let transport = Arc::new(HttpTransport::new(config.http_agent_url.clone())?);
    let messenger = Arc::new(AgentMessenger::new(transport, &config));
    let local = Arc::new(ShellLocalActions::new(config.server_http_url.clone()));

    let ctx = SchedulerContext::new(store, config, messenger, local)?;
    let scheduler = JobScheduler::new(ctx);
    scheduler.start().await?;
    tracing::info!("Job scheduler started");

    let service = Arc::new(SchedulerService::new(Arc::clone(&scheduler)));
    let listen_addr = gateway_config.listen_addr.clone();
    let app = create_router(GatewayState::new(service, gateway_config));

    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    scheduler.shutdown();
    tracing::info!("Shut down");
    Ok(())
}
