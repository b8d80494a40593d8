use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use controller::{
    Clock, ControllerMetrics, InstantClock, ShardRecycler, SchedulerConfig, TenantShardScheduler,
    recycle_channel,
};
use schema::{ServiceStorage, Shard, ShardKind, ShardState, Tenant};
use store::{InMemoryStore, ResourceStore};
use tokio::{sync::watch, task::JoinHandle};

const ORIGIN: u64 = 1_700_000_000;
const RETENTION: Duration = Duration::from_secs(3600);

struct Plane {
    tenants: Arc<InMemoryStore<Tenant>>,
    shards: Arc<InMemoryStore<Shard>>,
    scheduler: TenantShardScheduler,
    recycler: Arc<ShardRecycler>,
    clock: Arc<InstantClock>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

fn start(shards: Arc<InMemoryStore<Shard>>, clock: Arc<InstantClock>) -> Plane {
    let tenants = Arc::new(InMemoryStore::<Tenant>::new());
    let metrics = Arc::new(ControllerMetrics::default());
    let (queue, receiver) = recycle_channel();
    let recycler = Arc::new(ShardRecycler::new(
        shards.clone(),
        clock.clone(),
        queue.clone(),
        Arc::clone(&metrics),
    ));
    let scheduler = TenantShardScheduler::new(
        tenants.clone(),
        shards.clone(),
        queue,
        clock.clone(),
        SchedulerConfig {
            retention: RETENTION,
            ..SchedulerConfig::default()
        },
        metrics,
    );
    let (shutdown, shutdown_rx) = watch::channel(false);
    let worker = {
        let recycler = Arc::clone(&recycler);
        tokio::spawn(async move { recycler.run(receiver, shutdown_rx).await })
    };
    Plane {
        tenants,
        shards,
        scheduler,
        recycler,
        clock,
        shutdown,
        worker,
    }
}

impl Plane {
    async fn add_tenant(&self, name: &str) {
        self.tenants
            .create(Tenant::new(name).with_service_storage("svc", "store"))
            .await
            .unwrap();
        self.scheduler.reconcile_tenant(name).await.unwrap();
    }

    async fn remove_tenant(&self, name: &str) {
        self.tenants.delete(name, None).await.unwrap();
        self.scheduler.reconcile_tenant(name).await.unwrap();
    }

    async fn ingester_0(&self) -> Option<Shard> {
        self.shards.get("svc-store-ingester-0").await.unwrap()
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.worker.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn drained_shard_is_deleted_after_retention() {
    let plane = start(
        Arc::new(InMemoryStore::new()),
        Arc::new(InstantClock::new(ORIGIN)),
    );
    plane.add_tenant("acme").await;
    plane.remove_tenant("acme").await;

    let draining = plane.ingester_0().await.unwrap();
    assert_eq!(draining.state(), ShardState::Deleting);
    assert_eq!(draining.deadline(), Some(ORIGIN + RETENTION.as_secs()));

    tokio::time::sleep(RETENTION - Duration::from_secs(1)).await;
    assert!(plane.ingester_0().await.is_some(), "deleted before deadline");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(plane.ingester_0().await.is_none());
    assert!(
        plane
            .shards
            .get("svc-store-compactor-0")
            .await
            .unwrap()
            .is_none()
    );
    plane.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shard_reused_before_deadline_is_never_deleted() {
    let plane = start(
        Arc::new(InMemoryStore::new()),
        Arc::new(InstantClock::new(ORIGIN)),
    );
    plane.add_tenant("acme").await;
    plane.remove_tenant("acme").await;

    tokio::time::sleep(RETENTION / 2).await;
    plane.add_tenant("globex").await;

    let revived = plane.ingester_0().await.unwrap();
    assert_eq!(revived.state(), ShardState::Running);
    assert_eq!(revived.deadline(), None);
    assert_eq!(revived.tenants, vec!["globex"]);

    tokio::time::sleep(RETENTION * 2).await;
    let survivor = plane.ingester_0().await.unwrap();
    assert_eq!(survivor.state(), ShardState::Running);
    assert_eq!(survivor.tenants, vec!["globex"]);
    plane.stop().await;
}

#[tokio::test(start_paused = true)]
async fn redrained_shard_waits_for_its_new_deadline() {
    let plane = start(
        Arc::new(InMemoryStore::new()),
        Arc::new(InstantClock::new(ORIGIN)),
    );
    plane.add_tenant("acme").await;
    plane.remove_tenant("acme").await;

    tokio::time::sleep(RETENTION / 2).await;
    plane.add_tenant("globex").await;
    plane.remove_tenant("globex").await;
    let redrained_at = plane.clock.now_unix_secs();
    assert_eq!(
        plane.ingester_0().await.unwrap().deadline(),
        Some(redrained_at + RETENTION.as_secs())
    );

    // The first timer fires here and must not delete the shard early.
    tokio::time::sleep(RETENTION / 2 + Duration::from_secs(1)).await;
    assert!(plane.ingester_0().await.is_some());

    tokio::time::sleep(RETENTION / 2).await;
    assert!(plane.ingester_0().await.is_none());
    plane.stop().await;
}

fn temp_snapshot_path() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "tenancy-lifecycle-{}-{nanos}.json",
        std::process::id()
    ))
}

#[tokio::test(start_paused = true)]
async fn restart_recovers_pending_deletions_from_deadlines() {
    let path = temp_snapshot_path();
    let pair = ServiceStorage::new("svc", "store");
    {
        let shards = InMemoryStore::<Shard>::open_with_snapshot(&path).unwrap();
        let mut expired = Shard::new(&pair, ShardKind::Ingestion, 0, 1);
        expired.mark_deleting(ORIGIN - 10);
        shards.create(expired).await.unwrap();
        let mut pending = Shard::new(&pair, ShardKind::Ingestion, 1, 1);
        pending.mark_deleting(ORIGIN + 120);
        shards.create(pending).await.unwrap();
    }

    let shards = Arc::new(InMemoryStore::<Shard>::open_with_snapshot(&path).unwrap());
    let plane = start(shards, Arc::new(InstantClock::new(ORIGIN)));
    assert_eq!(plane.recycler.recover().await.unwrap(), 2);

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert!(
        plane
            .shards
            .get("svc-store-ingester-1")
            .await
            .unwrap()
            .is_none()
    );
    // Past-deadline shards wait one backoff period instead of firing at once.
    assert!(plane.ingester_0().await.is_some());

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(plane.ingester_0().await.is_none());

    plane.stop().await;
    let _ = std::fs::remove_file(&path);
}
