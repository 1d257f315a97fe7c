mod applications;
mod auth;
mod jobs;
mod lifecycle;
mod maintenance;
mod response;
mod router;
mod telemetry;
mod users;

use std::{net::SocketAddr, sync::Arc};

use tracing::info;
use workfinder_storage::{Database, MemoryCache};
use workfinder_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_file = load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    if let Some(path) = env_file {
        info!(stage = "config", path = %path.display(), "loaded environment file");
    }
    let metrics = telemetry::init_metrics()?;

    let cache = Arc::new(MemoryCache::new());
    let database = Database::connect(&config.database_url)
        .await?
        .with_cache(cache.clone(), config.cache_ttl);
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    maintenance::CacheSweeper::new(cache, config.cache_sweep_interval).spawn();

    let state = router::AppState::new(
        metrics,
        database,
        auth::TokenVerifier::new(&config.jwt_secret),
        config.reject_scope,
    );

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        reject_scope = %config.reject_scope,
        cache_ttl_secs = config.cache_ttl.as_secs(),
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
