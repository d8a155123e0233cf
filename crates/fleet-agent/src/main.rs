//! Fleet edge agent

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use fleet_agent::cleanup::run_cleanup_job;
use fleet_agent::drain::RetryDrain;
use fleet_agent::heartbeat::HeartbeatService;
use fleet_agent::registration::RegistrationService;
use fleet_agent::runtime::RuntimeService;
use fleet_agent::{ApiClient, Config, IdentityManager, LocalStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Config::load()?;
    info!("fleet-agent {} starting", fleet_agent::VERSION);
    info!("control service: {}", config.agent_svc_url);

    let store = LocalStore::open(&config.db_path).await?;
    let identity_mgr = IdentityManager::new(&config.identity_path);
    let client = Arc::new(ApiClient::new(&config.agent_svc_url, ""));
    let registration = RegistrationService::new(client.clone(), identity_mgr.clone());

    let identity = match identity_mgr.load()? {
        Some(identity) => identity,
        None => {
            info!("identity not found, registering with control service");
            registration.register_new().await?
        }
    };
    client.update_token(&identity.jwt_token).await;
    info!(node_id = %identity.node_id, "agent identity loaded");

    let heartbeat = HeartbeatService::new(
        client.clone(),
        RegistrationService::new(client.clone(), identity_mgr.clone()),
        identity.node_id.clone(),
        config.heartbeat_interval_sec,
    );
    let runtime = RuntimeService::new(store.clone(), client.clone(), &config);
    let drain = RetryDrain::new(store.clone(), client.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat_handle = tokio::spawn({
        let rx = shutdown_rx.clone();
        async move { heartbeat.start(rx).await }
    });
    let runtime_handle = tokio::spawn({
        let rx = shutdown_rx.clone();
        async move { runtime.start(rx).await }
    });
    let drain_handle = tokio::spawn({
        let rx = shutdown_rx.clone();
        async move { drain.start(rx).await }
    });
    let cleanup_handle = tokio::spawn(run_cleanup_job(store.clone(), shutdown_rx));

    info!(node_id = %identity.node_id, "agent started");
    wait_for_signal().await;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(heartbeat_handle, runtime_handle, drain_handle, cleanup_handle);

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("sigterm handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
