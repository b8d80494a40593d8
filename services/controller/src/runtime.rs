use std::sync::Arc;

use hashring::HeadlessServiceNaming;
use schema::{RoutingTableDocument, Shard, Tenant};
use store::{InMemoryStore, ResourceStore, StoreError};
use tokio::{sync::watch, task::JoinHandle};
use tracing::info;

use crate::{
    clock::Clock,
    config::ControllerConfig,
    dispatch::{
        WorkQueue, routing_keys_for_shard_event, routing_keys_for_table_event,
        routing_keys_for_tenant_event, spawn_watch_pump, spawn_workers,
        tenant_keys_for_shard_event, tenant_keys_for_tenant_event,
    },
    metrics::ControllerMetrics,
    recycler::{ShardRecycler, recycle_channel},
    routing::{RoutingReconciler, RoutingTableBuilder},
    scheduler::TenantShardScheduler,
};

#[derive(Clone)]
pub struct ControlPlaneStores {
    pub tenants: Arc<InMemoryStore<Tenant>>,
    pub shards: Arc<InMemoryStore<Shard>>,
    pub tables: Arc<InMemoryStore<RoutingTableDocument>>,
}

impl ControlPlaneStores {
    pub fn in_memory() -> Self {
        Self {
            tenants: Arc::new(InMemoryStore::new()),
            shards: Arc::new(InMemoryStore::new()),
            tables: Arc::new(InMemoryStore::new()),
        }
    }

    /// One snapshot file per object kind under `config.snapshot_dir`.
    pub fn open(config: &ControllerConfig) -> Result<Self, StoreError> {
        let Some(dir) = &config.snapshot_dir else {
            return Ok(Self::in_memory());
        };
        Ok(Self {
            tenants: Arc::new(InMemoryStore::open_with_snapshot(dir.join("tenants.json"))?),
            shards: Arc::new(InMemoryStore::open_with_snapshot(dir.join("shards.json"))?),
            tables: Arc::new(InMemoryStore::open_with_snapshot(
                dir.join("routing-tables.json"),
            )?),
        })
    }
}

/// Running scheduler, recycler and routing reconciler with their queues,
/// workers and watch pumps.
pub struct ControlPlane {
    pub stores: ControlPlaneStores,
    pub scheduler: Arc<TenantShardScheduler>,
    pub recycler: Arc<ShardRecycler>,
    pub routing: Arc<RoutingReconciler>,
    pub metrics: Arc<ControllerMetrics>,
    tenant_queue: Arc<WorkQueue>,
    routing_queue: Arc<WorkQueue>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    pub async fn start(
        config: &ControllerConfig,
        stores: ControlPlaneStores,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let metrics = Arc::new(ControllerMetrics::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tenants: Arc<dyn ResourceStore<Tenant>> = stores.tenants.clone();
        let shards: Arc<dyn ResourceStore<Shard>> = stores.shards.clone();
        let tables: Arc<dyn ResourceStore<RoutingTableDocument>> = stores.tables.clone();

        let (recycle_queue, recycle_receiver) = recycle_channel();
        let recycler = Arc::new(ShardRecycler::new(
            Arc::clone(&shards),
            Arc::clone(&clock),
            recycle_queue.clone(),
            Arc::clone(&metrics),
        ));
        let scheduler = Arc::new(TenantShardScheduler::new(
            Arc::clone(&tenants),
            Arc::clone(&shards),
            recycle_queue,
            clock,
            config.scheduler.clone(),
            Arc::clone(&metrics),
        ));
        let naming = Arc::new(HeadlessServiceNaming::new(
            &config.endpoint_namespace,
            config.endpoint_port,
        ));
        let routing = Arc::new(RoutingReconciler::new(
            RoutingTableBuilder::new(Arc::clone(&shards), Arc::clone(&tenants), naming),
            Arc::clone(&tables),
            config.hashring_dir.clone(),
            Arc::clone(&metrics),
        ));

        let recovered = recycler.recover().await?;

        let tenant_queue = Arc::new(WorkQueue::default());
        let routing_queue = Arc::new(WorkQueue::default());
        let mut handles = Vec::new();

        {
            let recycler = Arc::clone(&recycler);
            let shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                recycler.run(recycle_receiver, shutdown).await;
            }));
        }

        handles.extend(spawn_workers(
            Arc::clone(&scheduler),
            Arc::clone(&tenant_queue),
            config.workers,
            Arc::clone(&metrics),
        ));
        handles.extend(spawn_workers(
            Arc::clone(&routing),
            Arc::clone(&routing_queue),
            config.workers,
            Arc::clone(&metrics),
        ));

        handles.push(spawn_watch_pump(
            "tenants",
            Arc::clone(&tenants),
            Arc::clone(&tenant_queue),
            tenant_keys_for_tenant_event,
            shutdown_rx.clone(),
        ));
        handles.push(spawn_watch_pump(
            "tenants->routing",
            Arc::clone(&tenants),
            Arc::clone(&routing_queue),
            routing_keys_for_tenant_event,
            shutdown_rx.clone(),
        ));
        handles.push(spawn_watch_pump(
            "shards->tenants",
            Arc::clone(&shards),
            Arc::clone(&tenant_queue),
            tenant_keys_for_shard_event,
            shutdown_rx.clone(),
        ));
        handles.push(spawn_watch_pump(
            "shards->routing",
            Arc::clone(&shards),
            Arc::clone(&routing_queue),
            routing_keys_for_shard_event,
            shutdown_rx.clone(),
        ));
        handles.push(spawn_watch_pump(
            "routing-tables",
            tables,
            Arc::clone(&routing_queue),
            routing_keys_for_table_event,
            shutdown_rx,
        ));

        info!(
            workers = config.workers,
            recovered_draining_shards = recovered,
            "control plane started"
        );

        Ok(Self {
            stores,
            scheduler,
            recycler,
            routing,
            metrics,
            tenant_queue,
            routing_queue,
            shutdown_tx,
            handles,
        })
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.tenant_queue.shutdown();
        self.routing_queue.shutdown();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("control plane stopped");
    }
}
