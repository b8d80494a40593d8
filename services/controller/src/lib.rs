pub mod admin;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod recycler;
pub mod routing;
pub mod runtime;
pub mod scheduler;

pub use clock::{Clock, InstantClock, SystemClock};
pub use config::{ConfigError, ControllerConfig, config_from_env};
pub use dispatch::{ReconcileError, Reconciler, WorkQueue};
pub use metrics::ControllerMetrics;
pub use recycler::{
    RECYCLE_BACKOFF, RecycleOutcome, RecycleQueue, RecycleReceiver, ShardRecycler, recycle_channel,
};
pub use routing::{RoutingError, RoutingOutcome, RoutingReconciler, RoutingTableBuilder};
pub use runtime::{ControlPlane, ControlPlaneStores};
pub use scheduler::{ScheduleOutcome, SchedulerConfig, SchedulerError, TenantShardScheduler};
