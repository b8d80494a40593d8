pub mod agents;
pub mod config;
pub mod enforce;
pub mod metrics;
pub mod proxy;
pub mod routes;
pub mod tls;

pub use agents::{
    Agent, AgentError, AgentResolver, CachedAgentResolver, FileAgentDirectory,
    StaticAgentDirectory,
};
pub use config::{ConfigError, GatewayConfig, TlsSettings, config_from_env};
pub use enforce::{EnforceError, LabelEnforcer};
pub use metrics::GatewayMetrics;
pub use proxy::{ProxyError, UpstreamProxy};
pub use routes::{GatewayError, GatewayState, ReadEndpoint, router};
pub use tls::{PeerCertificate, TlsError, load_server_config, serve_tls};
