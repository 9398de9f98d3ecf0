use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use switchboard::cache::TtlCache;
use switchboard::config;
use switchboard::events::EventPublisher;
use switchboard::gateway::{self, GatewayState};
use switchboard::platform::ChatClient;
use switchboard::relay::GenerationRelay;
use switchboard::store::{
    FileStore, KvStore, RestStore, TenantStore, TieredTenantStore, TokenExchanger,
};
use switchboard::thread::ContextManager;

const DEFAULT_INFERENCE_URL: &str = "https://api.openai.com/v1";
const SWEEP_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".parse().unwrap_or_default());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = config::load_config(None)?;

    let data_dir = match &cfg.storage.data_dir {
        Some(dir) => dir.clone(),
        None => config::switchboard_home()?,
    };
    std::fs::create_dir_all(&data_dir)?;

    // Tier priority is fixed: relational service, then shared KV, then the
    // local snapshot. Absent tiers are simply not in the chain.
    let file_store = Arc::new(FileStore::open(data_dir.join("tenants.json"))?);
    let mut tiers: Vec<Arc<dyn TenantStore>> = Vec::new();
    if let (Some(url), Some(key)) = (&cfg.storage.database_url, &cfg.storage.database_key) {
        info!("tenant store tier 1: database at {}", url);
        tiers.push(Arc::new(RestStore::new(url.clone(), key.clone())));
    }
    if let (Some(url), Some(token)) = (&cfg.storage.kv_url, &cfg.storage.kv_token) {
        info!("tenant store tier 2: kv at {}", url);
        tiers.push(Arc::new(KvStore::new(url.clone(), token.clone())));
    }
    tiers.push(file_store.clone());

    let store = Arc::new(TieredTenantStore::new(tiers));
    store.init_count().await;
    info!("tenant store ready with {} known tenants", store.tenant_count());

    let cache = Arc::new(TtlCache::new());
    cache.spawn_sweeper(Duration::from_secs(SWEEP_INTERVAL_SECS));
    let contexts = Arc::new(ContextManager::with_settings(
        cache,
        chrono::Duration::seconds(cfg.context.timeout_secs as i64),
        cfg.context.summary_threshold,
        cfg.context.summary_keep,
    ));

    let relay = Arc::new(GenerationRelay::new(
        cfg.relay
            .inference_url
            .clone()
            .unwrap_or_else(|| DEFAULT_INFERENCE_URL.to_string()),
        cfg.relay.default_model.clone(),
    ));

    let mut state = GatewayState::new(store, contexts, relay, ChatClient::new());
    state.exchanger = cfg.storage.token_issuance_url.clone().map(TokenExchanger::new);
    state.publisher = cfg.events.publish_url.clone().map(EventPublisher::new);
    state.edit_throttle = Duration::from_millis(cfg.relay.throttle_ms);

    let server = gateway::start(Arc::new(state), &cfg.gateway.host, cfg.gateway.port).await?;

    shutdown_signal().await;
    info!("shutting down, flushing tenant snapshot");
    if let Err(e) = file_store.flush().await {
        warn!("snapshot flush failed: {}", e);
    }
    server.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
