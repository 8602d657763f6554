//! Roomcast hub daemon entry point.

mod config;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use roomcast_agent_pool::AgentPool;
use roomcast_hub::rooms::RoomRegistry;
use roomcast_hub::{HubConfig, HubContext, HubServer, MemoryStore, http};
use roomcast_identity::{DeviceIdentity, TokenStore};

use config::HubdConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting roomcast hub");

    let cfg = match HubdConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "failed to load config, using defaults");
            HubdConfig::default()
        }
    };

    std::fs::create_dir_all(&cfg.data_dir)?;
    let identity = Arc::new(DeviceIdentity::load_or_create(
        &cfg.data_dir.join("device.json"),
    )?);
    info!(fingerprint = %identity.fingerprint(), "hub identity ready");

    let tokens = Arc::new(TokenStore::new(cfg.data_dir.join("tokens.json"))?);
    let pool = Arc::new(AgentPool::with_endpoints(identity.clone()));

    let ctx = Arc::new(HubContext {
        store: Arc::new(MemoryStore::new()),
        registry: Arc::new(RoomRegistry::new()),
        agents: pool.clone(),
        public_host: cfg.public_host(),
    });

    let server = HubServer::new(
        HubConfig {
            port: cfg.listen_port,
            static_token: cfg.static_token.clone(),
            keepalive_interval: Duration::from_millis(cfg.keepalive_interval_ms),
        },
        ctx.clone(),
        tokens,
    );

    let cancel = CancellationToken::new();
    let http_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", cfg.http_port)).await?;
    let http_task = tokio::spawn(http::serve(http_listener, ctx.clone(), cancel.clone()));

    let runner = Arc::clone(&server);
    let ws_task = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    server.shutdown();
    cancel.cancel();
    pool.close().await;

    ws_task.await??;
    if let Err(e) = http_task.await? {
        warn!("http listener error: {e}");
    }
    Ok(())
}
