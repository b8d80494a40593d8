use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// A workload identity allowed to query or write through the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

impl Agent {
    pub fn new(namespace: &str, name: &str, tenant: Option<&str>) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            tenant: tenant
                .map(str::trim)
                .filter(|tenant| !tenant.is_empty())
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("agent directory unavailable: {0}")]
    Unavailable(String),
    #[error("agent directory is malformed: {0}")]
    Malformed(String),
}

/// Looks up the agent registered under `(namespace, name)`. `Ok(None)` means
/// the agent does not exist.
#[async_trait]
pub trait AgentResolver: Send + Sync {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<Option<Agent>, AgentError>;
}

type AgentKey = (String, String);

fn agent_key(namespace: &str, name: &str) -> AgentKey {
    (namespace.to_string(), name.to_string())
}

fn index_agents(agents: Vec<Agent>) -> HashMap<AgentKey, Agent> {
    agents
        .into_iter()
        .map(|agent| (agent_key(&agent.namespace, &agent.name), agent))
        .collect()
}

/// Fixed in-memory directory.
#[derive(Debug, Default)]
pub struct StaticAgentDirectory {
    agents: HashMap<AgentKey, Agent>,
}

impl StaticAgentDirectory {
    pub fn new(agents: Vec<Agent>) -> Self {
        Self {
            agents: index_agents(agents),
        }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[async_trait]
impl AgentResolver for StaticAgentDirectory {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<Option<Agent>, AgentError> {
        Ok(self.agents.get(&agent_key(namespace, name)).cloned())
    }
}

/// Directory backed by a JSON array of agents, re-read on every lookup so
/// edits to the file are picked up without a restart.
#[derive(Debug, Clone)]
pub struct FileAgentDirectory {
    path: PathBuf,
}

impl FileAgentDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<Vec<Agent>, AgentError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|err| {
            AgentError::Unavailable(format!("{}: {err}", self.path.display()))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|err| AgentError::Malformed(format!("{}: {err}", self.path.display())))
    }
}

#[async_trait]
impl AgentResolver for FileAgentDirectory {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<Option<Agent>, AgentError> {
        let agents = self.load().await?;
        Ok(agents
            .into_iter()
            .find(|agent| agent.namespace == namespace && agent.name == name))
    }
}

struct CacheEntry {
    value: Option<Agent>,
    fetched_at: Instant,
    refreshing: bool,
}

/// Read-through TTL cache over another resolver. An expired entry is still
/// served while a single background refresh replaces it; only a cold miss
/// waits on the inner resolver. Unknown agents are cached for one TTL and
/// never served stale. The map holds at most `max_entries` keys.
pub struct CachedAgentResolver {
    inner: Arc<dyn AgentResolver>,
    ttl: Duration,
    max_entries: usize,
    entries: Arc<Mutex<HashMap<AgentKey, CacheEntry>>>,
}

const DEFAULT_MAX_ENTRIES: usize = 4096;

impl CachedAgentResolver {
    pub fn new(inner: Arc<dyn AgentResolver>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn cached_len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    fn lookup(&self, key: &AgentKey) -> Lookup {
        let Ok(mut entries) = self.entries.lock() else {
            return Lookup::Miss;
        };
        let Some(entry) = entries.get_mut(key) else {
            return Lookup::Miss;
        };
        if entry.fetched_at.elapsed() < self.ttl {
            return Lookup::Fresh(entry.value.clone());
        }
        if entry.value.is_none() {
            entries.remove(key);
            return Lookup::Miss;
        }
        if entry.refreshing {
            return Lookup::Fresh(entry.value.clone());
        }
        entry.refreshing = true;
        Lookup::Stale(entry.value.clone())
    }

    fn spawn_refresh(&self, key: AgentKey) {
        let inner = Arc::clone(&self.inner);
        let entries = Arc::clone(&self.entries);
        let (ttl, max_entries) = (self.ttl, self.max_entries);
        tokio::spawn(async move {
            let result = inner.resolve(&key.0, &key.1).await;
            let Ok(mut entries) = entries.lock() else {
                return;
            };
            match result {
                Ok(value) => {
                    debug!(namespace = %key.0, agent = %key.1, "refreshed cached agent");
                    store_entry(&mut entries, key, value, ttl, max_entries);
                }
                Err(err) => {
                    warn!(namespace = %key.0, agent = %key.1, error = %err, "agent refresh failed, serving stale entry");
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.refreshing = false;
                    }
                }
            }
        });
    }
}

/// Inserts `value` under `key`, first dropping expired entries and then the
/// oldest one when the map is full.
fn store_entry(
    entries: &mut HashMap<AgentKey, CacheEntry>,
    key: AgentKey,
    value: Option<Agent>,
    ttl: Duration,
    max_entries: usize,
) {
    if !entries.contains_key(&key) && entries.len() >= max_entries {
        entries.retain(|_, entry| entry.refreshing || entry.fetched_at.elapsed() < ttl);
        while entries.len() >= max_entries {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.fetched_at)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            entries.remove(&oldest);
        }
    }
    entries.insert(
        key,
        CacheEntry {
            value,
            fetched_at: Instant::now(),
            refreshing: false,
        },
    );
}

enum Lookup {
    Fresh(Option<Agent>),
    Stale(Option<Agent>),
    Miss,
}

#[async_trait]
impl AgentResolver for CachedAgentResolver {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<Option<Agent>, AgentError> {
        let key = agent_key(namespace, name);
        match self.lookup(&key) {
            Lookup::Fresh(value) => Ok(value),
            Lookup::Stale(value) => {
                self.spawn_refresh(key);
                Ok(value)
            }
            Lookup::Miss => {
                let value = self.inner.resolve(namespace, name).await?;
                if let Ok(mut entries) = self.entries.lock() {
                    store_entry(&mut entries, key, value.clone(), self.ttl, self.max_entries);
                }
                Ok(value)
            }
        }
    }
}
