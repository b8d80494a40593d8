//! Typed, watchable object store consumed by the control plane.
//!
//! The control plane only ever talks to [`ResourceStore`]; the in-memory
//! implementation backs tests and single-process deployments.

mod memory;
mod snapshot;

use std::collections::BTreeMap;

use async_trait::async_trait;
use schema::{ObjectMeta, Resource};
use tokio::sync::broadcast;

pub use memory::InMemoryStore;
pub use snapshot::write_atomic;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} '{name}' was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        kind: &'static str,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store io error: {0}")]
    Io(String),

    #[error("store serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Version mismatch or a lost create race; both mean "re-read and recompute".
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Equality-based label query. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.match_labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| meta.label(key) == Some(value.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<R> {
    Added(R),
    Modified(R),
    Deleted(R),
}

impl<R> WatchEvent<R> {
    pub fn object(&self) -> &R {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }
}

/// Consistent key/value store of typed objects with optimistic concurrency.
///
/// Writes carry the `resource_version` they were computed from; a stale
/// version fails with [`StoreError::Conflict`] and the caller must re-read.
#[async_trait]
pub trait ResourceStore<R: Resource>: Send + Sync {
    async fn get(&self, name: &str) -> StoreResult<Option<R>>;

    /// Objects matching `selector`, ordered by name.
    async fn list(&self, selector: &LabelSelector) -> StoreResult<Vec<R>>;

    async fn create(&self, object: R) -> StoreResult<R>;

    async fn update(&self, object: R) -> StoreResult<R>;

    /// Objects holding finalizers are only marked for deletion.
    async fn delete(&self, name: &str, precondition: Option<u64>) -> StoreResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent<R>>;
}
