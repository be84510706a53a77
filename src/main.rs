use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

use checkout_guard::{
    build_router, start_retention_task, start_ttl_eviction_task, AppState, AuditStore, CachedGeoLocator,
    CheckoutGuard, CliArgs, Config, GeoLocator, IpApiLocator, MemoryTtlStore, NoGeoLocator, SharedSettings,
    SqliteAuditStore, RETENTION_INTERVAL, TTL_EVICTION_INTERVAL,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli_args = CliArgs::parse();

    // Load config with precedence: CLI > env > file > defaults
    let config = Config::load(&cli_args)?;

    // Initialize tracing with configured log level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("🛡️ Checkout guard starting...");
    tracing::info!("📡 Upstream URL: {}", config.upstream_url);
    if config.settings.test_mode {
        tracing::warn!("Test mode is active: suspicious requests are logged but not blocked");
    }

    let audit: Arc<dyn AuditStore> = match &config.audit_db_path {
        Some(path) => {
            tracing::info!("🗄️ Audit log: {}", path.display());
            Arc::new(SqliteAuditStore::open(path)?)
        }
        None => {
            tracing::warn!("No audit database configured, audit log is in-memory only");
            Arc::new(SqliteAuditStore::in_memory()?)
        }
    };

    let ttl_store = MemoryTtlStore::new();

    let geo: Arc<dyn GeoLocator> = if config.geo_enabled {
        let locator = IpApiLocator::new(config.geo_endpoint.as_str())?;
        Arc::new(CachedGeoLocator::new(Arc::new(locator), Arc::new(ttl_store.clone())))
    } else {
        Arc::new(NoGeoLocator)
    };

    let settings: SharedSettings = Arc::new(RwLock::new(config.settings.clone()));
    let guard = CheckoutGuard::new(Arc::new(ttl_store.clone()), audit.clone(), geo);

    tokio::spawn(start_ttl_eviction_task(ttl_store, TTL_EVICTION_INTERVAL));
    tokio::spawn(start_retention_task(audit, settings.clone(), RETENTION_INTERVAL));

    if config.admin_token.is_some() {
        tracing::info!("🔑 Admin API enabled under {}", checkout_guard::ADMIN_PREFIX);
    }

    let state = AppState::new(&config, guard, settings)?;
    let app = build_router(state, config.admin_token.clone());

    tracing::info!("🛡️ Checkout guard listening on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
