//! Fleet control service

use std::net::SocketAddr;

use tracing::info;

use fleet_db::{DbPool, Repository};
use fleet_server::config::Config;
use fleet_server::{build_router, cleanup, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = DbPool::connect(&config.database_url).await?;
    let repo = Repository::new(pool);

    tokio::spawn(cleanup::run_retention_job(
        repo.clone(),
        config.log_retention_days,
    ));

    let state = AppState::new(repo, &config);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("fleet-server {} listening on http://{}", fleet_server::VERSION, addr);

    axum::serve(listener, app).await?;
    Ok(())
}

fn init_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
