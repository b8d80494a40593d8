//! First-fit packing of tenants into capacity-bounded shards.
//!
//! Every write is version-checked. A conflict (including losing a race to
//! create the same new shard) restarts the whole reconcile from a fresh read.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use schema::{
    FINALIZER_SHARD_CLEANUP, LABEL_SERVICE, LABEL_SHARD_KIND, LABEL_STORAGE, ServiceStorage,
    Shard, ShardKind, ShardRef, ShardState, Tenant, shard_name,
};
use store::{LabelSelector, ResourceStore, StoreError};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    dispatch::{ReconcileError, Reconciler},
    metrics::ControllerMetrics,
    recycler::RecycleQueue,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub ingester_tenants_per_shard: usize,
    pub compactor_tenants_per_shard: usize,
    /// Grace period between a shard draining and its deletion.
    pub retention: Duration,
    pub default_replicas: u32,
    pub max_conflict_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ingester_tenants_per_shard: 3,
            compactor_tenants_per_shard: 10,
            retention: Duration::from_secs(3600),
            default_replicas: 1,
            max_conflict_retries: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn capacity(&self, kind: ShardKind) -> usize {
        let capacity = match kind {
            ShardKind::Ingestion => self.ingester_tenants_per_shard,
            ShardKind::Compaction => self.compactor_tenants_per_shard,
        };
        capacity.max(1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("tenant '{tenant}' still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { tenant: String, attempts: u32 },
    #[error("no free {kind} shard slot for {service}/{storage}")]
    NoShardSlot {
        service: String,
        storage: String,
        kind: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Tenant does not exist.
    Absent,
    /// Tenant is being deleted; its shards were released and the finalizer dropped.
    Finalized,
    /// Tenant carries no service/storage pair.
    Unscheduled,
    Assigned { ingester: String, compactor: String },
}

pub struct TenantShardScheduler {
    tenants: Arc<dyn ResourceStore<Tenant>>,
    shards: Arc<dyn ResourceStore<Shard>>,
    recycler: RecycleQueue,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    metrics: Arc<ControllerMetrics>,
}

impl TenantShardScheduler {
    pub fn new(
        tenants: Arc<dyn ResourceStore<Tenant>>,
        shards: Arc<dyn ResourceStore<Shard>>,
        recycler: RecycleQueue,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            tenants,
            shards,
            recycler,
            clock,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn reconcile_tenant(&self, name: &str) -> Result<ScheduleOutcome, SchedulerError> {
        let attempts = self.config.max_conflict_retries.max(1);
        for attempt in 1..=attempts {
            match self.reconcile_once(name).await {
                Err(SchedulerError::Store(err)) if err.is_conflict() => {
                    self.metrics.observe_conflict_retry();
                    debug!(tenant = name, attempt, error = %err, "write conflict, recomputing from fresh read");
                }
                // A shard read during this pass was deleted before we wrote it back.
                Err(SchedulerError::Store(err)) if err.is_not_found() => {
                    self.metrics.observe_conflict_retry();
                    debug!(tenant = name, attempt, error = %err, "object vanished mid-reconcile, recomputing from fresh read");
                }
                other => return other,
            }
        }
        warn!(tenant = name, attempts, "giving up after repeated write conflicts");
        Err(SchedulerError::ConflictRetriesExhausted {
            tenant: name.to_string(),
            attempts,
        })
    }

    /// Removes `tenant` from `shard_name`. A shard left empty starts draining
    /// and is handed to the recycler. Missing shards are ignored.
    pub async fn release(&self, tenant: &str, shard_name: &str) -> Result<(), SchedulerError> {
        let Some(mut shard) = self.shards.get(shard_name).await? else {
            return Ok(());
        };
        if !shard.remove_tenant(tenant) {
            return Ok(());
        }
        let drained = shard.tenants.is_empty();
        if drained {
            let deadline = self.clock.now_unix_secs() + self.config.retention.as_secs();
            shard.mark_deleting(deadline);
        }
        match self.shards.update(shard).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        if drained {
            info!(
                shard = shard_name,
                tenant,
                retention_secs = self.config.retention.as_secs(),
                "shard drained, scheduled for deletion"
            );
            self.metrics.observe_shard_drained();
            self.recycler.enqueue(shard_name, self.config.retention);
        } else {
            debug!(shard = shard_name, tenant, "released tenant from shard");
        }
        Ok(())
    }

    async fn reconcile_once(&self, name: &str) -> Result<ScheduleOutcome, SchedulerError> {
        let Some(mut tenant) = self.tenants.get(name).await? else {
            return Ok(ScheduleOutcome::Absent);
        };

        if tenant.meta.is_deleting() {
            let changed = self.release_everywhere(&mut tenant).await?;
            if changed | tenant.meta.remove_finalizer(FINALIZER_SHARD_CLEANUP) {
                match self.tenants.update(tenant).await {
                    Ok(_) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err.into()),
                }
            }
            info!(tenant = name, "tenant deleted, shard cleanup complete");
            return Ok(ScheduleOutcome::Finalized);
        }

        let Some(pair) = tenant.service_storage() else {
            let changed = self.release_everywhere(&mut tenant).await?;
            if changed | tenant.meta.remove_finalizer(FINALIZER_SHARD_CLEANUP) {
                self.tenants.update(tenant).await?;
            }
            return Ok(ScheduleOutcome::Unscheduled);
        };

        // The finalizer goes on before any shard lists the tenant.
        if tenant.meta.add_finalizer(FINALIZER_SHARD_CLEANUP) {
            tenant = self.tenants.update(tenant).await?;
        }

        let mut changed = false;
        let mut assigned = Vec::with_capacity(ShardKind::ALL.len());
        for kind in ShardKind::ALL {
            let shard = self.assign(&tenant, &pair, kind).await?;
            if tenant.shard_ref(kind).map(|r| r.name.as_str()) != Some(shard.as_str()) {
                tenant.set_shard_ref(kind, Some(ShardRef::new(shard.clone())));
                changed = true;
            }
            assigned.push(shard);
        }
        if changed {
            self.tenants.update(tenant).await?;
        }

        let mut assigned = assigned.into_iter();
        Ok(ScheduleOutcome::Assigned {
            ingester: assigned.next().unwrap_or_default(),
            compactor: assigned.next().unwrap_or_default(),
        })
    }

    /// Returns the shard of `kind` the tenant lives in after this call.
    async fn assign(
        &self,
        tenant: &Tenant,
        pair: &ServiceStorage,
        kind: ShardKind,
    ) -> Result<String, SchedulerError> {
        let name = tenant.meta.name.as_str();

        if let Some(current) = tenant.shard_ref(kind) {
            match self.shards.get(&current.name).await? {
                Some(shard) if shard.matches(pair, kind) && shard.contains_tenant(name) => {
                    return Ok(current.name.clone());
                }
                Some(_) => {
                    warn!(tenant = name, shard = %current.name, kind = kind.as_str(), "shard assignment drifted, reassigning");
                    self.metrics.observe_drift();
                    self.release(name, &current.name).await?;
                }
                None => {
                    warn!(tenant = name, shard = %current.name, kind = kind.as_str(), "assigned shard disappeared, reassigning");
                    self.metrics.observe_drift();
                }
            }
        }

        let shards = self.list_shards(pair, kind).await?;

        let mut holders = shards.iter().filter(|shard| shard.contains_tenant(name));
        if let Some(adopted) = holders.next() {
            for duplicate in holders {
                warn!(tenant = name, shard = %duplicate.meta.name, "tenant listed in several shards, releasing duplicate");
                self.release(name, &duplicate.meta.name).await?;
            }
            return Ok(adopted.meta.name.clone());
        }

        let capacity = self.config.capacity(kind);
        let by_name: HashMap<&str, &Shard> = shards
            .iter()
            .map(|shard| (shard.meta.name.as_str(), shard))
            .collect();
        // Slots whose name is held by another pair's shard are skipped, so the
        // search may run past the pair's own shard count.
        let mut limit = shards.len();
        let mut index = 0;
        while index <= limit {
            let slot = index;
            index += 1;
            let candidate = shard_name(pair, kind, slot);
            match by_name.get(candidate.as_str()) {
                Some(existing) if existing.tenants.len() < capacity => {
                    let mut shard = (*existing).clone();
                    let revived = shard.state() == ShardState::Deleting;
                    shard.add_tenant(name);
                    self.shards.update(shard).await?;
                    if revived {
                        info!(tenant = name, shard = %candidate, "reused draining shard");
                    } else {
                        debug!(tenant = name, shard = %candidate, "assigned tenant to shard");
                    }
                    return Ok(candidate);
                }
                Some(_) => continue,
                None => {
                    let mut shard = Shard::new(pair, kind, slot, self.config.default_replicas);
                    shard.add_tenant(name);
                    match self.shards.create(shard).await {
                        Ok(_) => {
                            self.metrics.observe_shard_created();
                            info!(tenant = name, shard = %candidate, "created shard");
                            return Ok(candidate);
                        }
                        Err(err @ StoreError::AlreadyExists { .. }) => {
                            match self.shards.get(&candidate).await? {
                                Some(other) if !other.matches(pair, kind) => {
                                    warn!(tenant = name, shard = %candidate, "shard name held by another service/storage pair, trying next slot");
                                    limit += 1;
                                }
                                _ => return Err(err.into()),
                            }
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }

        Err(SchedulerError::NoShardSlot {
            service: pair.service.clone(),
            storage: pair.storage.clone(),
            kind: kind.as_str(),
        })
    }

    async fn list_shards(
        &self,
        pair: &ServiceStorage,
        kind: ShardKind,
    ) -> Result<Vec<Shard>, SchedulerError> {
        let selector = LabelSelector::everything()
            .with(LABEL_SERVICE, &pair.service)
            .with(LABEL_STORAGE, &pair.storage)
            .with(LABEL_SHARD_KIND, kind.as_str());
        Ok(self
            .shards
            .list(&selector)
            .await?
            .into_iter()
            .filter(|shard| shard.matches(pair, kind))
            .collect())
    }

    /// Releases the tenant from every shard that references or lists it and
    /// clears its back-references. Returns whether the tenant object changed.
    async fn release_everywhere(&self, tenant: &mut Tenant) -> Result<bool, SchedulerError> {
        let name = tenant.meta.name.clone();
        let mut changed = false;
        for kind in ShardKind::ALL {
            if let Some(current) = tenant.shard_ref(kind).cloned() {
                self.release(&name, &current.name).await?;
                tenant.set_shard_ref(kind, None);
                changed = true;
            }
        }
        if let Some(pair) = tenant.service_storage() {
            for kind in ShardKind::ALL {
                for shard in self.list_shards(&pair, kind).await? {
                    if shard.contains_tenant(&name) {
                        self.release(&name, &shard.meta.name).await?;
                    }
                }
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl Reconciler for TenantShardScheduler {
    fn name(&self) -> &'static str {
        "tenant-scheduler"
    }

    async fn reconcile(&self, key: &str) -> Result<(), ReconcileError> {
        self.metrics.observe_reconcile();
        self.reconcile_tenant(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::InstantClock, recycler::recycle_channel};
    use std::sync::atomic::{AtomicBool, Ordering};
    use store::{InMemoryStore, StoreResult, WatchEvent};
    use tokio::sync::broadcast;

    /// Deletes the target of the first `update` just before applying it, as
    /// the recycler would when it wins the race.
    struct VanishOnFirstUpdate {
        inner: Arc<InMemoryStore<Shard>>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl ResourceStore<Shard> for VanishOnFirstUpdate {
        async fn get(&self, name: &str) -> StoreResult<Option<Shard>> {
            self.inner.get(name).await
        }

        async fn list(&self, selector: &LabelSelector) -> StoreResult<Vec<Shard>> {
            self.inner.list(selector).await
        }

        async fn create(&self, object: Shard) -> StoreResult<Shard> {
            self.inner.create(object).await
        }

        async fn update(&self, object: Shard) -> StoreResult<Shard> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.inner.delete(&object.meta.name, None).await?;
            }
            self.inner.update(object).await
        }

        async fn delete(&self, name: &str, precondition: Option<u64>) -> StoreResult<()> {
            self.inner.delete(name, precondition).await
        }

        fn subscribe(&self) -> broadcast::Receiver<WatchEvent<Shard>> {
            self.inner.subscribe()
        }
    }

    struct Fixture {
        tenants: Arc<InMemoryStore<Tenant>>,
        shards: Arc<InMemoryStore<Shard>>,
        scheduler: TenantShardScheduler,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        let tenants = Arc::new(InMemoryStore::<Tenant>::new());
        let shards = Arc::new(InMemoryStore::<Shard>::new());
        let (queue, _receiver) = recycle_channel();
        let scheduler = TenantShardScheduler::new(
            tenants.clone(),
            shards.clone(),
            queue,
            Arc::new(InstantClock::new(1_000)),
            config,
            Arc::new(ControllerMetrics::default()),
        );
        Fixture {
            tenants,
            shards,
            scheduler,
        }
    }

    #[test]
    fn capacity_is_per_kind_and_never_zero() {
        let config = SchedulerConfig {
            ingester_tenants_per_shard: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.capacity(ShardKind::Ingestion), 1);
        assert_eq!(config.capacity(ShardKind::Compaction), 10);
    }

    #[tokio::test]
    async fn absent_tenant_is_a_no_op() {
        let fx = fixture(SchedulerConfig::default());
        assert_eq!(
            fx.scheduler.reconcile_tenant("ghost").await.unwrap(),
            ScheduleOutcome::Absent
        );
        assert!(fx.shards.is_empty().await);
    }

    #[tokio::test]
    async fn unlabelled_tenant_is_not_scheduled() {
        let fx = fixture(SchedulerConfig::default());
        fx.tenants.create(Tenant::new("acme")).await.unwrap();
        assert_eq!(
            fx.scheduler.reconcile_tenant("acme").await.unwrap(),
            ScheduleOutcome::Unscheduled
        );
        assert!(fx.shards.is_empty().await);
        let tenant = fx.tenants.get("acme").await.unwrap().unwrap();
        assert!(!tenant.meta.has_finalizer(FINALIZER_SHARD_CLEANUP));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let fx = fixture(SchedulerConfig::default());
        fx.tenants
            .create(Tenant::new("acme").with_service_storage("svc", "store"))
            .await
            .unwrap();
        let first = fx.scheduler.reconcile_tenant("acme").await.unwrap();
        let version = fx
            .tenants
            .get("acme")
            .await
            .unwrap()
            .unwrap()
            .meta
            .resource_version;
        let second = fx.scheduler.reconcile_tenant("acme").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            ScheduleOutcome::Assigned {
                ingester: "svc-store-ingester-0".into(),
                compactor: "svc-store-compactor-0".into(),
            }
        );
        let after = fx.tenants.get("acme").await.unwrap().unwrap();
        assert_eq!(after.meta.resource_version, version);
        assert!(after.meta.has_finalizer(FINALIZER_SHARD_CLEANUP));
    }

    #[tokio::test]
    async fn release_of_last_tenant_starts_draining() {
        let fx = fixture(SchedulerConfig::default());
        let mut shard = Shard::new(
            &ServiceStorage::new("svc", "store"),
            ShardKind::Ingestion,
            0,
            1,
        );
        shard.add_tenant("a");
        shard.add_tenant("b");
        fx.shards.create(shard).await.unwrap();

        fx.scheduler
            .release("a", "svc-store-ingester-0")
            .await
            .unwrap();
        let shard = fx.shards.get("svc-store-ingester-0").await.unwrap().unwrap();
        assert_eq!(shard.state(), ShardState::Running);

        fx.scheduler
            .release("b", "svc-store-ingester-0")
            .await
            .unwrap();
        let shard = fx.shards.get("svc-store-ingester-0").await.unwrap().unwrap();
        assert_eq!(shard.state(), ShardState::Deleting);
        assert_eq!(shard.deadline(), Some(1_000 + 3600));

        // Releasing from a missing shard is not an error.
        fx.scheduler.release("b", "nope").await.unwrap();
    }

    #[tokio::test]
    async fn transient_store_errors_are_returned_to_the_dispatcher() {
        let fx = fixture(SchedulerConfig {
            max_conflict_retries: 2,
            ..SchedulerConfig::default()
        });
        fx.tenants
            .create(Tenant::new("acme").with_service_storage("svc", "store"))
            .await
            .unwrap();
        fx.shards.set_unavailable(true);
        let err = fx.scheduler.reconcile_tenant("acme").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Store(ref e) if e.is_transient()));
    }

    #[tokio::test]
    async fn slot_held_by_another_pair_is_skipped() {
        let fx = fixture(SchedulerConfig::default());
        let mut squatter = Shard::new(
            &ServiceStorage::new("other", "pair"),
            ShardKind::Ingestion,
            0,
            1,
        );
        squatter.meta.name = "svc-store-ingester-0".into();
        fx.shards.create(squatter).await.unwrap();
        fx.tenants
            .create(Tenant::new("acme").with_service_storage("svc", "store"))
            .await
            .unwrap();

        assert_eq!(
            fx.scheduler.reconcile_tenant("acme").await.unwrap(),
            ScheduleOutcome::Assigned {
                ingester: "svc-store-ingester-1".into(),
                compactor: "svc-store-compactor-0".into(),
            }
        );
        let squatter = fx.shards.get("svc-store-ingester-0").await.unwrap().unwrap();
        assert!(squatter.tenants.is_empty());
    }

    #[tokio::test]
    async fn shard_deleted_mid_reconcile_is_retried_from_fresh_read() {
        let tenants = Arc::new(InMemoryStore::<Tenant>::new());
        let inner = Arc::new(InMemoryStore::<Shard>::new());
        let metrics = Arc::new(ControllerMetrics::default());
        let (queue, _receiver) = recycle_channel();
        let scheduler = TenantShardScheduler::new(
            tenants.clone(),
            Arc::new(VanishOnFirstUpdate {
                inner: inner.clone(),
                armed: AtomicBool::new(true),
            }),
            queue,
            Arc::new(InstantClock::new(1_000)),
            SchedulerConfig::default(),
            metrics,
        );

        let mut draining = Shard::new(
            &ServiceStorage::new("svc", "store"),
            ShardKind::Ingestion,
            0,
            1,
        );
        draining.mark_deleting(5_000);
        inner.create(draining).await.unwrap();
        tenants
            .create(Tenant::new("acme").with_service_storage("svc", "store"))
            .await
            .unwrap();

        assert_eq!(
            scheduler.reconcile_tenant("acme").await.unwrap(),
            ScheduleOutcome::Assigned {
                ingester: "svc-store-ingester-0".into(),
                compactor: "svc-store-compactor-0".into(),
            }
        );
        let shard = inner.get("svc-store-ingester-0").await.unwrap().unwrap();
        assert_eq!(shard.state(), ShardState::Running);
        assert_eq!(shard.tenants, vec!["acme".to_string()]);
    }
}
