//! Delayed deletion of drained shards.
//!
//! Timers are in-memory only. The durable state is the deadline annotation
//! on the shard, which [`ShardRecycler::recover`] turns back into timers at
//! startup and which is re-checked before every delete.

use std::{sync::Arc, time::Duration};

use schema::{Shard, ShardState};
use store::{LabelSelector, ResourceStore, StoreError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{clock::Clock, metrics::ControllerMetrics};

/// Retry delay after a failed delete, and the delay used at startup for
/// shards whose deadline already passed.
pub const RECYCLE_BACKOFF: Duration = Duration::from_secs(600);

/// Sending half of the recycle work queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RecycleQueue {
    tx: mpsc::UnboundedSender<String>,
}

pub struct RecycleReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

pub fn recycle_channel() -> (RecycleQueue, RecycleReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RecycleQueue { tx }, RecycleReceiver { rx })
}

impl RecycleQueue {
    /// Schedules a delete check for `shard` after `delay`.
    pub fn enqueue(&self, shard: &str, delay: Duration) {
        let name = shard.to_string();
        if delay.is_zero() {
            if self.tx.send(name).is_err() {
                debug!(shard, "recycle queue closed, dropping check");
            }
            return;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(name);
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleOutcome {
    Deleted,
    AlreadyGone,
    /// Reassigned or otherwise no longer draining; nothing to do.
    StillInUse,
    /// Deadline not reached yet; re-enqueued for the remaining time.
    Deferred(Duration),
    /// Lost a write race; re-checked immediately.
    Requeued,
    /// Store failure; retried after [`RECYCLE_BACKOFF`].
    BackedOff,
}

pub struct ShardRecycler {
    shards: Arc<dyn ResourceStore<Shard>>,
    clock: Arc<dyn Clock>,
    queue: RecycleQueue,
    metrics: Arc<ControllerMetrics>,
    backoff: Duration,
}

impl ShardRecycler {
    pub fn new(
        shards: Arc<dyn ResourceStore<Shard>>,
        clock: Arc<dyn Clock>,
        queue: RecycleQueue,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            shards,
            clock,
            queue,
            metrics,
            backoff: RECYCLE_BACKOFF,
        }
    }

    pub fn queue(&self) -> &RecycleQueue {
        &self.queue
    }

    /// Re-enqueues every draining shard. Returns how many were found.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_unix_secs();
        let mut recovered = 0;
        for shard in self.shards.list(&LabelSelector::everything()).await? {
            if shard.state() != ShardState::Deleting {
                continue;
            }
            let delay = match shard.deadline() {
                Some(deadline) if deadline > now => Duration::from_secs(deadline - now),
                _ => self.backoff,
            };
            debug!(shard = %shard.meta.name, delay_secs = delay.as_secs(), "recovered draining shard");
            self.queue.enqueue(&shard.meta.name, delay);
            recovered += 1;
        }
        info!(recovered, "recycler startup recovery complete");
        Ok(recovered)
    }

    pub async fn run(&self, mut receiver: RecycleReceiver, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                next = receiver.rx.recv() => match next {
                    Some(name) => {
                        self.process(&name).await;
                    }
                    None => break,
                },
            }
        }
        debug!("recycler worker stopped");
    }

    pub async fn process(&self, name: &str) -> RecycleOutcome {
        match self.try_recycle(name).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(shard = name, error = %err, backoff_secs = self.backoff.as_secs(), "shard delete failed, backing off");
                self.metrics.observe_recycle_backoff();
                self.queue.enqueue(name, self.backoff);
                RecycleOutcome::BackedOff
            }
        }
    }

    async fn try_recycle(&self, name: &str) -> Result<RecycleOutcome, StoreError> {
        let Some(shard) = self.shards.get(name).await? else {
            return Ok(RecycleOutcome::AlreadyGone);
        };
        if shard.state() != ShardState::Deleting || !shard.tenants.is_empty() {
            debug!(shard = name, "shard back in use, skipping delete");
            return Ok(RecycleOutcome::StillInUse);
        }

        let now = self.clock.now_unix_secs();
        if let Some(deadline) = shard.deadline()
            && deadline > now
        {
            let remaining = Duration::from_secs(deadline - now);
            self.queue.enqueue(name, remaining);
            return Ok(RecycleOutcome::Deferred(remaining));
        }

        match self
            .shards
            .delete(name, Some(shard.meta.resource_version))
            .await
        {
            Ok(()) => {
                info!(shard = name, "recycled drained shard");
                self.metrics.observe_shard_recycled();
                Ok(RecycleOutcome::Deleted)
            }
            Err(err) if err.is_not_found() => Ok(RecycleOutcome::AlreadyGone),
            Err(err) if err.is_conflict() => {
                self.queue.enqueue(name, Duration::ZERO);
                Ok(RecycleOutcome::Requeued)
            }
            Err(err) => Err(err),
        }
    }
}
