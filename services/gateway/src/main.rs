use std::sync::Arc;

use gateway::{
    AgentResolver, CachedAgentResolver, FileAgentDirectory, GatewayState, StaticAgentDirectory,
    config_from_env, load_server_config, router, serve_tls,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(error = %err, "tenancy-gateway failed");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

async fn run() -> Result<(), String> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let config = config_from_env(|key| std::env::var(key).ok()).map_err(|e| e.to_string())?;

    let directory: Arc<dyn AgentResolver> = match &config.agents_file {
        Some(path) => {
            info!(agents_file = %path.display(), "resolving agents from file");
            Arc::new(FileAgentDirectory::new(path))
        }
        None => {
            warn!("TENANCY_GATEWAY_AGENTS_FILE unset, every agent lookup will return 404");
            Arc::new(StaticAgentDirectory::default())
        }
    };
    let resolver = Arc::new(
        CachedAgentResolver::new(directory, config.agent_cache_ttl)
            .with_max_entries(config.agent_cache_max_entries),
    );
    let state = GatewayState::new(&config, resolver).map_err(|e| e.to_string())?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", config.bind_addr))?;

    match &config.tls {
        Some(tls) => {
            let server_config = load_server_config(tls).map_err(|e| e.to_string())?;
            info!(
                bind_addr = %config.bind_addr,
                mtls = config.mtls_required(),
                "gateway listening with tls"
            );
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(true);
            });
            serve_tls(listener, server_config, app, shutdown_rx)
                .await
                .map_err(|e| format!("tls server failed: {e}"))
        }
        None => {
            info!(bind_addr = %config.bind_addr, "gateway listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await
                .map_err(|e| format!("gateway server failed: {e}"))
        }
    }
}
