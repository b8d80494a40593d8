//! Write-routing table ("hashring") derived from shard assignment.

use schema::{Shard, ShardState};
use serde::{Deserialize, Serialize};

pub const CATCH_ALL_HASHRING: &str = "catch-all";

/// One entry of the routing table consumed by the write router. Hard entries
/// carry `tenants`; the trailing catch-all entry never does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashring: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenants: Option<Vec<String>>,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl RoutingEntry {
    pub fn is_catch_all(&self) -> bool {
        self.tenants.is_none()
    }
}

/// Maps a shard to one stable network identity per declared replica.
pub trait EndpointNaming: Send + Sync {
    fn endpoints(&self, shard: &Shard) -> Vec<String>;
}

/// `{shard}-{i}.{shard}-operated.{namespace}.svc:{port}`, the addressing a
/// StatefulSet behind a headless service gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessServiceNaming {
    pub namespace: String,
    pub port: u16,
}

impl HeadlessServiceNaming {
    pub fn new(namespace: &str, port: u16) -> Self {
        Self {
            namespace: namespace.to_string(),
            port,
        }
    }
}

impl EndpointNaming for HeadlessServiceNaming {
    fn endpoints(&self, shard: &Shard) -> Vec<String> {
        let name = &shard.meta.name;
        (0..shard.replicas.max(1))
            .map(|replica| {
                format!(
                    "{name}-{replica}.{name}-operated.{}.svc:{}",
                    self.namespace, self.port
                )
            })
            .collect()
    }
}

/// Builds the routing table with shard tenant names written verbatim.
pub fn build_routing_table(shards: &[Shard], naming: &dyn EndpointNaming) -> Vec<RoutingEntry> {
    build_routing_table_with(shards, naming, |tenant| tenant.to_string())
}

/// Hard entries in shard order for non-empty running shards, then exactly
/// one catch-all entry with the endpoints of every empty running shard.
/// Deleting shards contribute nothing.
pub fn build_routing_table_with<F>(
    shards: &[Shard],
    naming: &dyn EndpointNaming,
    tenant_id: F,
) -> Vec<RoutingEntry>
where
    F: Fn(&str) -> String,
{
    let mut entries = Vec::with_capacity(shards.len() + 1);
    let mut catch_all = Vec::new();

    for shard in shards {
        if shard.state() != ShardState::Running {
            continue;
        }
        if shard.tenants.is_empty() {
            catch_all.extend(naming.endpoints(shard));
            continue;
        }
        entries.push(RoutingEntry {
            hashring: Some(shard.meta.name.clone()),
            tenants: Some(shard.tenants.iter().map(|t| tenant_id(t)).collect()),
            endpoints: naming.endpoints(shard),
        });
    }

    entries.push(RoutingEntry {
        hashring: Some(CATCH_ALL_HASHRING.to_string()),
        tenants: None,
        endpoints: catch_all,
    });
    entries
}

pub fn render_routing_table(entries: &[RoutingEntry]) -> Result<String, serde_json::Error> {
    serde_json::to_string(entries)
}

pub fn parse_routing_table(raw: &str) -> Result<Vec<RoutingEntry>, serde_json::Error> {
    serde_json::from_str(raw)
}
