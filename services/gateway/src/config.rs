use std::{path::PathBuf, time::Duration};

use axum::http::HeaderName;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9090";
const DEFAULT_WRITE_PATH: &str = "/api/v1/receive";
const DEFAULT_TENANT_HEADER: &str = "thanos-tenant";
const DEFAULT_TENANT_LABEL: &str = "tenant_id";
const DEFAULT_AGENT_CACHE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_AGENT_CACHE_MAX_ENTRIES: usize = 4096;
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Client certificates are verified against this bundle when set.
    pub client_ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub query_backend: Option<String>,
    pub write_backend: Option<String>,
    pub write_path: String,
    pub tenant_header: HeaderName,
    pub tenant_label: String,
    pub error_on_replace: bool,
    pub agents_file: Option<PathBuf>,
    pub agent_cache_ttl: Duration,
    pub agent_cache_max_entries: usize,
    pub upstream_timeout: Duration,
    pub tls: Option<TlsSettings>,
}

impl GatewayConfig {
    pub fn mtls_required(&self) -> bool {
        self.tls
            .as_ref()
            .is_some_and(|tls| tls.client_ca_path.is_some())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            query_backend: None,
            write_backend: None,
            write_path: DEFAULT_WRITE_PATH.to_string(),
            tenant_header: HeaderName::from_static(DEFAULT_TENANT_HEADER),
            tenant_label: DEFAULT_TENANT_LABEL.to_string(),
            error_on_replace: false,
            agents_file: None,
            agent_cache_ttl: DEFAULT_AGENT_CACHE_TTL,
            agent_cache_max_entries: DEFAULT_AGENT_CACHE_MAX_ENTRIES,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            tls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must be true or false, got '{value}'")]
    InvalidBool { key: &'static str, value: String },
    #[error("{key} must not be empty")]
    Empty { key: &'static str },
    #[error("{key} must be an http(s) url, got '{value}'")]
    InvalidUrl { key: &'static str, value: String },
    #[error("{key} is not a valid header name: '{value}'")]
    InvalidHeader { key: &'static str, value: String },
    #[error("tls configuration incomplete: {0}")]
    IncompleteTls(&'static str),
}

pub fn config_from_env<F>(env_lookup: F) -> Result<GatewayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = GatewayConfig::default();

    let tenant_header = match non_empty(&env_lookup, "TENANCY_GATEWAY_TENANT_HEADER")? {
        Some(raw) => HeaderName::from_bytes(raw.as_bytes()).map_err(|_| {
            ConfigError::InvalidHeader {
                key: "TENANCY_GATEWAY_TENANT_HEADER",
                value: raw,
            }
        })?,
        None => defaults.tenant_header,
    };

    let write_path = match non_empty(&env_lookup, "TENANCY_GATEWAY_WRITE_PATH")? {
        Some(path) if path.starts_with('/') => path,
        Some(path) => format!("/{path}"),
        None => defaults.write_path,
    };

    Ok(GatewayConfig {
        bind_addr: non_empty(&env_lookup, "TENANCY_GATEWAY_BIND")?.unwrap_or(defaults.bind_addr),
        query_backend: backend_url(&env_lookup, "TENANCY_GATEWAY_QUERY_BACKEND")?,
        write_backend: backend_url(&env_lookup, "TENANCY_GATEWAY_WRITE_BACKEND")?,
        write_path,
        tenant_header,
        tenant_label: non_empty(&env_lookup, "TENANCY_GATEWAY_TENANT_LABEL")?
            .unwrap_or(defaults.tenant_label),
        error_on_replace: parse_bool(&env_lookup, "TENANCY_GATEWAY_ERROR_ON_REPLACE")?
            .unwrap_or(defaults.error_on_replace),
        agents_file: optional_path(&env_lookup, "TENANCY_GATEWAY_AGENTS_FILE"),
        agent_cache_ttl: parse_secs(&env_lookup, "TENANCY_GATEWAY_AGENT_CACHE_TTL_SECS")?
            .unwrap_or(defaults.agent_cache_ttl),
        agent_cache_max_entries: parse_count(&env_lookup, "TENANCY_GATEWAY_AGENT_CACHE_MAX_ENTRIES")?
            .unwrap_or(defaults.agent_cache_max_entries),
        upstream_timeout: parse_secs(&env_lookup, "TENANCY_GATEWAY_UPSTREAM_TIMEOUT_SECS")?
            .unwrap_or(defaults.upstream_timeout),
        tls: tls_settings(&env_lookup)?,
    })
}

fn tls_settings<F>(env_lookup: &F) -> Result<Option<TlsSettings>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let cert = optional_path(env_lookup, "TENANCY_GATEWAY_TLS_CERT");
    let key = optional_path(env_lookup, "TENANCY_GATEWAY_TLS_KEY");
    let client_ca = optional_path(env_lookup, "TENANCY_GATEWAY_TLS_CLIENT_CA");
    match (cert, key) {
        (Some(cert_path), Some(key_path)) => Ok(Some(TlsSettings {
            cert_path,
            key_path,
            client_ca_path: client_ca,
        })),
        (None, None) if client_ca.is_some() => Err(ConfigError::IncompleteTls(
            "client CA requires a server certificate and key",
        )),
        (None, None) => Ok(None),
        (Some(_), None) => Err(ConfigError::IncompleteTls("certificate set without key")),
        (None, Some(_)) => Err(ConfigError::IncompleteTls("key set without certificate")),
    }
}

fn non_empty<F>(env_lookup: &F, key: &'static str) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match env_lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Err(ConfigError::Empty { key }),
        Some(raw) => Ok(Some(raw.trim().to_string())),
    }
}

fn optional_path<F>(env_lookup: &F, key: &str) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    env_lookup(key)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

fn backend_url<F>(env_lookup: &F, key: &'static str) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env_lookup(key)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
    else {
        return Ok(None);
    };
    if !(raw.starts_with("http://") || raw.starts_with("https://")) {
        return Err(ConfigError::InvalidUrl { key, value: raw });
    }
    Ok(Some(raw.trim_end_matches('/').to_string()))
}

fn parse_bool<F>(env_lookup: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env_lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidBool { key, value: raw }),
    }
}

fn parse_count<F>(env_lookup: &F, key: &'static str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env_lookup(key) else {
        return Ok(None);
    };
    match raw.trim().parse::<usize>() {
        Ok(count) if count > 0 => Ok(Some(count)),
        _ => Err(ConfigError::InvalidNumber { key, value: raw }),
    }
}

fn parse_secs<F>(env_lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env_lookup(key) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
        _ => Err(ConfigError::InvalidNumber { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = config_from_env(lookup(&[])).unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.tenant_header.as_str(), "thanos-tenant");
        assert_eq!(config.agent_cache_ttl, Duration::from_secs(30));
        assert_eq!(config.agent_cache_max_entries, 4096);
        assert!(!config.mtls_required());
    }

    #[test]
    fn backends_are_normalized() {
        let config = config_from_env(lookup(&[
            ("TENANCY_GATEWAY_QUERY_BACKEND", "http://querier:9090/"),
            ("TENANCY_GATEWAY_WRITE_BACKEND", "https://receive:19291"),
            ("TENANCY_GATEWAY_WRITE_PATH", "api/v1/push"),
        ]))
        .unwrap();
        assert_eq!(config.query_backend.as_deref(), Some("http://querier:9090"));
        assert_eq!(config.write_backend.as_deref(), Some("https://receive:19291"));
        assert_eq!(config.write_path, "/api/v1/push");
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(matches!(
            config_from_env(lookup(&[("TENANCY_GATEWAY_QUERY_BACKEND", "querier:9090")])),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            config_from_env(lookup(&[("TENANCY_GATEWAY_ERROR_ON_REPLACE", "maybe")])),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            config_from_env(lookup(&[("TENANCY_GATEWAY_UPSTREAM_TIMEOUT_SECS", "0")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            config_from_env(lookup(&[("TENANCY_GATEWAY_AGENT_CACHE_MAX_ENTRIES", "0")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            config_from_env(lookup(&[("TENANCY_GATEWAY_TENANT_HEADER", "bad header")])),
            Err(ConfigError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn client_ca_enables_mtls_only_with_server_pair() {
        let config = config_from_env(lookup(&[
            ("TENANCY_GATEWAY_TLS_CERT", "/etc/tls/tls.crt"),
            ("TENANCY_GATEWAY_TLS_KEY", "/etc/tls/tls.key"),
            ("TENANCY_GATEWAY_TLS_CLIENT_CA", "/etc/tls/ca.crt"),
        ]))
        .unwrap();
        assert!(config.mtls_required());

        assert!(matches!(
            config_from_env(lookup(&[("TENANCY_GATEWAY_TLS_CLIENT_CA", "/etc/tls/ca.crt")])),
            Err(ConfigError::IncompleteTls(_))
        ));
        assert!(matches!(
            config_from_env(lookup(&[("TENANCY_GATEWAY_TLS_CERT", "/etc/tls/tls.crt")])),
            Err(ConfigError::IncompleteTls(_))
        ));
    }
}
