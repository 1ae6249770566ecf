use anyhow::Result;
use probemesh::{
    api::ApiServer, bus::JobBus, config::Config, constants::SHUTDOWN_DRAIN_SECS,
    coordinator::TaskCoordinator, hub::EventHub, janitor::Janitor, registry::AgentRegistry,
    store::Store,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("starting probemesh control plane");

    let config = Config::load()?;

    let store = Store::new();
    let bus = JobBus::new();
    let hub = EventHub::new();
    let registry = AgentRegistry::new(store.clone(), config.tasks.allow_name_heartbeat);
    let coordinator = TaskCoordinator::new(
        store.clone(),
        bus.clone(),
        hub.clone(),
        config.tasks.clone(),
    );
    let janitor = Janitor::new(store.clone());
    let api_server = ApiServer::new(config, coordinator, registry, hub);

    let shutdown = CancellationToken::new();

    let janitor_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { janitor.run(shutdown).await })
    };

    let mut server_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { api_server.run(shutdown).await })
    };

    tokio::select! {
        result = &mut server_handle => {
            if let Ok(Err(e)) = result {
                error!("API server failed: {}", e);
            }
            shutdown.cancel();
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining");
            shutdown.cancel();
            if tokio::time::timeout(Duration::from_secs(SHUTDOWN_DRAIN_SECS), &mut server_handle)
                .await
                .is_err()
            {
                warn!("drain deadline exceeded, aborting server");
                server_handle.abort();
            }
        }
    }

    let _ = janitor_handle.await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
