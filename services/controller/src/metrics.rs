use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ControllerMetrics {
    reconcile_total: AtomicU64,
    reconcile_error_total: AtomicU64,
    conflict_retry_total: AtomicU64,
    drift_total: AtomicU64,
    shards_created_total: AtomicU64,
    shards_drained_total: AtomicU64,
    shards_recycled_total: AtomicU64,
    recycle_backoff_total: AtomicU64,
    routing_tables_published_total: AtomicU64,
}

impl ControllerMetrics {
    pub fn observe_reconcile(&self) {
        self.reconcile_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_reconcile_error(&self) {
        self.reconcile_error_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_conflict_retry(&self) {
        self.conflict_retry_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_drift(&self) {
        self.drift_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_shard_created(&self) {
        self.shards_created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_shard_drained(&self) {
        self.shards_drained_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_shard_recycled(&self) {
        self.shards_recycled_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_recycle_backoff(&self) {
        self.recycle_backoff_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_routing_table_published(&self) {
        self.routing_tables_published_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn drift_total(&self) -> u64 {
        self.drift_total.load(Ordering::Relaxed)
    }

    pub fn shards_created_total(&self) -> u64 {
        self.shards_created_total.load(Ordering::Relaxed)
    }

    pub fn shards_recycled_total(&self) -> u64 {
        self.shards_recycled_total.load(Ordering::Relaxed)
    }

    pub fn metrics_text(&self) -> String {
        format!(
            "# TYPE tenancy_controller_reconcile_total counter\n\
tenancy_controller_reconcile_total {}\n\
# TYPE tenancy_controller_reconcile_error_total counter\n\
tenancy_controller_reconcile_error_total {}\n\
# TYPE tenancy_controller_conflict_retry_total counter\n\
tenancy_controller_conflict_retry_total {}\n\
# TYPE tenancy_controller_drift_total counter\n\
tenancy_controller_drift_total {}\n\
# TYPE tenancy_controller_shards_created_total counter\n\
tenancy_controller_shards_created_total {}\n\
# TYPE tenancy_controller_shards_drained_total counter\n\
tenancy_controller_shards_drained_total {}\n\
# TYPE tenancy_controller_shards_recycled_total counter\n\
tenancy_controller_shards_recycled_total {}\n\
# TYPE tenancy_controller_recycle_backoff_total counter\n\
tenancy_controller_recycle_backoff_total {}\n\
# TYPE tenancy_controller_routing_tables_published_total counter\n\
tenancy_controller_routing_tables_published_total {}\n",
            self.reconcile_total.load(Ordering::Relaxed),
            self.reconcile_error_total.load(Ordering::Relaxed),
            self.conflict_retry_total.load(Ordering::Relaxed),
            self.drift_total.load(Ordering::Relaxed),
            self.shards_created_total.load(Ordering::Relaxed),
            self.shards_drained_total.load(Ordering::Relaxed),
            self.shards_recycled_total.load(Ordering::Relaxed),
            self.recycle_backoff_total.load(Ordering::Relaxed),
            self.routing_tables_published_total.load(Ordering::Relaxed),
        )
    }
}
