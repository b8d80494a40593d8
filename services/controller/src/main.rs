use std::sync::Arc;

use controller::{
    ControlPlane, ControlPlaneStores, SystemClock,
    admin::{AdminState, router},
    config_from_env,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(error = %err, "tenancy-controller failed");
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
    let config = config_from_env(|key| std::env::var(key).ok()).map_err(|e| e.to_string())?;
    let stores = ControlPlaneStores::open(&config)
        .map_err(|e| format!("failed to open object store: {e}"))?;
    let plane = ControlPlane::start(&config, stores, Arc::new(SystemClock))
        .await
        .map_err(|e| format!("failed to start control plane: {e}"))?;

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", config.bind_addr))?;
    info!(bind_addr = %config.bind_addr, "controller admin api listening");

    let app = router(AdminState::from_control_plane(&plane));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| format!("admin server failed: {e}"));

    plane.shutdown().await;
    served
}
