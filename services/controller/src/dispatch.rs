//! Watch-driven dispatch: store events map to keys, keys go through a
//! deduplicating work queue, and workers run one reconcile per key at a time.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use schema::{Resource, RoutingTableDocument, Shard, ShardKind, Tenant};
use store::{LabelSelector, ResourceStore, StoreError, WatchEvent};
use tokio::{
    sync::{Notify, broadcast::error::RecvError, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{metrics::ControllerMetrics, routing::RoutingError, scheduler::SchedulerError};

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &str) -> Result<(), ReconcileError>;
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Deduplicating queue with single-flight per key. A key added while it is
/// being processed is parked and handed out again once `done` is called.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl WorkQueue {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Requeues with per-key exponential backoff.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) -> Duration {
        let failures = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures = failures.saturating_add(1);
            *failures
        };
        let delay = self.backoff_for(failures);
        self.add_after(key, delay);
        delay
    }

    fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns `workers` tasks pulling keys from `queue` into `reconciler`.
pub fn spawn_workers<R: Reconciler>(
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    workers: usize,
    metrics: Arc<ControllerMetrics>,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker| {
            let reconciler = Arc::clone(&reconciler);
            let queue = Arc::clone(&queue);
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    match reconciler.reconcile(&key).await {
                        Ok(()) => queue.forget(&key),
                        Err(err) => {
                            metrics.observe_reconcile_error();
                            queue.done(&key);
                            let delay = queue.add_rate_limited(&key);
                            warn!(
                                reconciler = reconciler.name(),
                                key = %key,
                                error = %err,
                                retry_in_ms = delay.as_millis() as u64,
                                "reconcile failed"
                            );
                            continue;
                        }
                    }
                    queue.done(&key);
                }
                debug!(reconciler = reconciler.name(), worker, "worker stopped");
            })
        })
        .collect()
}

/// Feeds store events into `queue` through `map`. Starts with a full list so
/// objects that predate the subscription are reconciled, and relists after
/// falling behind the broadcast channel.
pub fn spawn_watch_pump<R: Resource>(
    name: &'static str,
    store: Arc<dyn ResourceStore<R>>,
    queue: Arc<WorkQueue>,
    map: fn(&WatchEvent<R>) -> Vec<String>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut events = store.subscribe();
    tokio::spawn(async move {
        resync(name, store.as_ref(), &queue, map).await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        for key in map(&event) {
                            queue.add(&key);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(watch = name, skipped, "watch fell behind, relisting");
                        resync(name, store.as_ref(), &queue, map).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!(watch = name, "watch pump stopped");
    })
}

async fn resync<R: Resource>(
    name: &'static str,
    store: &dyn ResourceStore<R>,
    queue: &WorkQueue,
    map: fn(&WatchEvent<R>) -> Vec<String>,
) {
    match store.list(&LabelSelector::everything()).await {
        Ok(objects) => {
            let count = objects.len();
            for object in objects {
                for key in map(&WatchEvent::Added(object)) {
                    queue.add(&key);
                }
            }
            info!(watch = name, objects = count, "resynced watch");
        }
        Err(err) => warn!(watch = name, error = %err, "resync list failed"),
    }
}

// ---------------------------------------------------------------------------
// Event to key mapping
// ---------------------------------------------------------------------------

pub fn tenant_keys_for_tenant_event(event: &WatchEvent<Tenant>) -> Vec<String> {
    match event {
        WatchEvent::Added(tenant) | WatchEvent::Modified(tenant) => vec![tenant.meta.name.clone()],
        WatchEvent::Deleted(_) => Vec::new(),
    }
}

/// Tenants listed by a shard are re-checked whenever it changes or vanishes.
pub fn tenant_keys_for_shard_event(event: &WatchEvent<Shard>) -> Vec<String> {
    event.object().tenants.clone()
}

/// Only ingestion shards feed the routing table.
pub fn routing_keys_for_shard_event(event: &WatchEvent<Shard>) -> Vec<String> {
    let shard = event.object();
    if shard.kind != ShardKind::Ingestion {
        return Vec::new();
    }
    shard
        .service_storage()
        .map(|pair| vec![pair.key()])
        .unwrap_or_default()
}

/// Tenant ids are written into routing tables, so tenant changes re-render them.
pub fn routing_keys_for_tenant_event(event: &WatchEvent<Tenant>) -> Vec<String> {
    event
        .object()
        .service_storage()
        .map(|pair| vec![pair.key()])
        .unwrap_or_default()
}

/// A routing table deleted out from under the controller is rebuilt.
pub fn routing_keys_for_table_event(event: &WatchEvent<RoutingTableDocument>) -> Vec<String> {
    match event {
        WatchEvent::Deleted(table) => table
            .meta
            .service_storage()
            .map(|pair| vec![pair.key()])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::ServiceStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn work_queue_deduplicates_pending_keys() {
        let queue = WorkQueue::default();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn key_added_while_processing_is_redelivered_after_done() {
        let queue = WorkQueue::default();
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.add("a");
        assert!(queue.is_empty(), "in-flight key must not be handed out twice");
        queue.done(&key);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let queue = Arc::new(WorkQueue::default());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_backoff_doubles_up_to_cap() {
        let queue = Arc::new(WorkQueue::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
        ));
        assert_eq!(queue.add_rate_limited("a"), Duration::from_secs(1));
        assert_eq!(queue.add_rate_limited("a"), Duration::from_secs(2));
        assert_eq!(queue.add_rate_limited("a"), Duration::from_secs(4));
        assert_eq!(queue.add_rate_limited("a"), Duration::from_secs(5));
        assert_eq!(queue.failures("a"), 4);
        queue.forget("a");
        assert_eq!(queue.failures("a"), 0);
    }

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn reconcile(&self, _key: &str) -> Result<(), ReconcileError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StoreError::Unavailable("first call fails".into()).into());
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn workers_retry_failed_keys_with_backoff() {
        let queue = Arc::new(WorkQueue::default());
        let reconciler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        let handles = spawn_workers(
            Arc::clone(&reconciler),
            Arc::clone(&queue),
            1,
            Arc::new(ControllerMetrics::default()),
        );
        queue.add("a");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.failures("a"), 0);

        queue.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn shard_events_map_to_listed_tenants_and_routing_pairs() {
        let pair = ServiceStorage::new("svc", "store");
        let mut ingester = Shard::new(&pair, ShardKind::Ingestion, 0, 1);
        ingester.add_tenant("a");
        ingester.add_tenant("b");
        let event = WatchEvent::Deleted(ingester);
        assert_eq!(tenant_keys_for_shard_event(&event), vec!["a", "b"]);
        assert_eq!(routing_keys_for_shard_event(&event), vec!["svc/store"]);

        let compactor = WatchEvent::Modified(Shard::new(&pair, ShardKind::Compaction, 0, 1));
        assert!(routing_keys_for_shard_event(&compactor).is_empty());
    }

    #[test]
    fn tenant_deletion_events_need_no_reconcile() {
        let tenant = Tenant::new("acme");
        assert_eq!(
            tenant_keys_for_tenant_event(&WatchEvent::Modified(tenant.clone())),
            vec!["acme"]
        );
        assert!(tenant_keys_for_tenant_event(&WatchEvent::Deleted(tenant.clone())).is_empty());
        assert!(routing_keys_for_tenant_event(&WatchEvent::Added(tenant)).is_empty());

        let labelled = Tenant::new("acme").with_service_storage("svc", "store");
        assert_eq!(
            routing_keys_for_tenant_event(&WatchEvent::Modified(labelled)),
            vec!["svc/store"]
        );
    }

    #[test]
    fn deleted_routing_table_is_rebuilt() {
        let table = RoutingTableDocument::new(&ServiceStorage::new("svc", "store"), "[]".into());
        assert_eq!(
            routing_keys_for_table_event(&WatchEvent::Deleted(table.clone())),
            vec!["svc/store"]
        );
        assert!(routing_keys_for_table_event(&WatchEvent::Modified(table)).is_empty());
    }
}
