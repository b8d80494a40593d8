use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::scheduler::SchedulerConfig;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8090";
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_ENDPOINT_NAMESPACE: &str = "default";
const DEFAULT_ENDPOINT_PORT: u16 = 10901;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub bind_addr: String,
    pub workers: usize,
    pub scheduler: SchedulerConfig,
    /// Directory holding one JSON snapshot per object kind; in-memory only when unset.
    pub snapshot_dir: Option<PathBuf>,
    /// Rendered routing tables are mirrored here as `{service}-{storage}.json`.
    pub hashring_dir: Option<PathBuf>,
    pub endpoint_namespace: String,
    pub endpoint_port: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            workers: DEFAULT_WORKERS,
            scheduler: SchedulerConfig::default(),
            snapshot_dir: None,
            hashring_dir: None,
            endpoint_namespace: DEFAULT_ENDPOINT_NAMESPACE.to_string(),
            endpoint_port: DEFAULT_ENDPOINT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must not be empty")]
    Empty { key: &'static str },
}

pub fn config_from_env<F>(env_lookup: F) -> Result<ControllerConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = ControllerConfig::default();
    let scheduler_defaults = SchedulerConfig::default();

    let bind_addr = non_empty(&env_lookup, "TENANCY_CONTROLLER_BIND")?
        .unwrap_or(defaults.bind_addr);
    let workers = parse_positive(&env_lookup, "TENANCY_CONTROLLER_WORKERS")?
        .unwrap_or(defaults.workers);

    let scheduler = SchedulerConfig {
        ingester_tenants_per_shard: parse_positive(
            &env_lookup,
            "TENANCY_INGESTER_TENANTS_PER_SHARD",
        )?
        .unwrap_or(scheduler_defaults.ingester_tenants_per_shard),
        compactor_tenants_per_shard: parse_positive(
            &env_lookup,
            "TENANCY_COMPACTOR_TENANTS_PER_SHARD",
        )?
        .unwrap_or(scheduler_defaults.compactor_tenants_per_shard),
        retention: parse_positive::<u64, _>(&env_lookup, "TENANCY_SHARD_RETENTION_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(scheduler_defaults.retention),
        default_replicas: parse_positive(&env_lookup, "TENANCY_SHARD_REPLICAS")?
            .unwrap_or(scheduler_defaults.default_replicas),
        max_conflict_retries: parse_positive(
            &env_lookup,
            "TENANCY_CONTROLLER_MAX_CONFLICT_RETRIES",
        )?
        .unwrap_or(scheduler_defaults.max_conflict_retries),
    };

    let endpoint_namespace = non_empty(&env_lookup, "TENANCY_ENDPOINT_NAMESPACE")?
        .unwrap_or(defaults.endpoint_namespace);
    let endpoint_port = parse_positive(&env_lookup, "TENANCY_ENDPOINT_PORT")?
        .unwrap_or(defaults.endpoint_port);

    Ok(ControllerConfig {
        bind_addr,
        workers,
        scheduler,
        snapshot_dir: optional_path(&env_lookup, "TENANCY_STORE_SNAPSHOT_DIR"),
        hashring_dir: optional_path(&env_lookup, "TENANCY_HASHRING_DIR"),
        endpoint_namespace,
        endpoint_port,
    })
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

fn parse_positive<T, F>(env_lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env_lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<T>() {
        Ok(value) if value > T::default() => Ok(Some(value)),
        _ => Err(ConfigError::InvalidNumber {
            key,
            value: trimmed.to_string(),
        }),
    }
}
