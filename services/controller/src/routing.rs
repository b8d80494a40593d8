use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use hashring::{EndpointNaming, RoutingEntry, build_routing_table_with, render_routing_table};
use schema::{
    LABEL_SERVICE, LABEL_SHARD_KIND, LABEL_STORAGE, RoutingTableDocument, ServiceStorage, Shard,
    ShardKind, Tenant, routing_table_name,
};
use store::{LabelSelector, ResourceStore, StoreError, write_atomic};
use tracing::{debug, info};

use crate::{
    dispatch::{ReconcileError, Reconciler},
    metrics::ControllerMetrics,
};

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid routing key '{0}', expected service/storage")]
    InvalidKey(String),
    #[error("failed to render routing table: {0}")]
    Render(#[from] serde_json::Error),
    #[error("failed to mirror routing table to {path}: {message}")]
    Mirror { path: String, message: String },
    #[error("routing table '{name}' belongs to another service/storage pair")]
    NameTaken { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingOutcome {
    Published,
    Unchanged,
}

/// Reads shard assignment for a service/storage pair and derives its routing table.
pub struct RoutingTableBuilder {
    shards: Arc<dyn ResourceStore<Shard>>,
    tenants: Arc<dyn ResourceStore<Tenant>>,
    naming: Arc<dyn EndpointNaming>,
}

impl RoutingTableBuilder {
    pub fn new(
        shards: Arc<dyn ResourceStore<Shard>>,
        tenants: Arc<dyn ResourceStore<Tenant>>,
        naming: Arc<dyn EndpointNaming>,
    ) -> Self {
        Self {
            shards,
            tenants,
            naming,
        }
    }

    pub async fn build(&self, service: &str, storage: &str) -> Result<Vec<RoutingEntry>, RoutingError> {
        let pair_selector = LabelSelector::everything()
            .with(LABEL_SERVICE, service)
            .with(LABEL_STORAGE, storage);
        let shards = self
            .shards
            .list(&pair_selector.clone().with(LABEL_SHARD_KIND, ShardKind::Ingestion.as_str()))
            .await?;
        let tenant_ids: HashMap<String, String> = self
            .tenants
            .list(&pair_selector)
            .await?
            .into_iter()
            .map(|tenant| (tenant.meta.name.clone(), tenant.tenant_id().to_string()))
            .collect();

        Ok(build_routing_table_with(&shards, self.naming.as_ref(), |name| {
            tenant_ids
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.to_string())
        }))
    }
}

/// Publishes the rendered routing table of a pair as a store object and,
/// optionally, as a file the write router watches.
pub struct RoutingReconciler {
    builder: RoutingTableBuilder,
    tables: Arc<dyn ResourceStore<RoutingTableDocument>>,
    mirror_dir: Option<PathBuf>,
    metrics: Arc<ControllerMetrics>,
}

impl RoutingReconciler {
    pub fn new(
        builder: RoutingTableBuilder,
        tables: Arc<dyn ResourceStore<RoutingTableDocument>>,
        mirror_dir: Option<PathBuf>,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            builder,
            tables,
            mirror_dir,
            metrics,
        }
    }

    pub fn builder(&self) -> &RoutingTableBuilder {
        &self.builder
    }

    pub async fn publish(&self, key: &str) -> Result<RoutingOutcome, RoutingError> {
        let pair =
            ServiceStorage::from_key(key).ok_or_else(|| RoutingError::InvalidKey(key.to_string()))?;
        let entries = self.builder.build(&pair.service, &pair.storage).await?;
        let data = render_routing_table(&entries)?;
        let name = routing_table_name(&pair);

        let outcome = match self.tables.get(&name).await? {
            Some(existing) if existing.meta.service_storage().as_ref() != Some(&pair) => {
                return Err(RoutingError::NameTaken { name });
            }
            Some(existing) if existing.data == data => RoutingOutcome::Unchanged,
            Some(mut existing) => {
                existing.data = data.clone();
                self.tables.update(existing).await?;
                RoutingOutcome::Published
            }
            None => {
                self.tables
                    .create(RoutingTableDocument::new(&pair, data.clone()))
                    .await?;
                RoutingOutcome::Published
            }
        };

        if let Some(dir) = &self.mirror_dir {
            let path = dir.join(format!("{name}.json"));
            if outcome == RoutingOutcome::Published || !path.exists() {
                write_atomic(&path, data.as_bytes()).map_err(|err| RoutingError::Mirror {
                    path: path.display().to_string(),
                    message: err.to_string(),
                })?;
            }
        }

        match outcome {
            RoutingOutcome::Published => {
                self.metrics.observe_routing_table_published();
                info!(
                    routing_table = %name,
                    entries = entries.len(),
                    "published routing table"
                );
            }
            RoutingOutcome::Unchanged => debug!(routing_table = %name, "routing table unchanged"),
        }
        Ok(outcome)
    }
}

#[async_trait]
impl Reconciler for RoutingReconciler {
    fn name(&self) -> &'static str {
        "routing-table"
    }

    async fn reconcile(&self, key: &str) -> Result<(), ReconcileError> {
        self.metrics.observe_reconcile();
        self.publish(key).await?;
        Ok(())
    }
}
