use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use schema::Resource;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use crate::{
    LabelSelector, ResourceStore, StoreError, StoreResult, WatchEvent,
    snapshot::{load_snapshot, write_snapshot},
};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

pub struct InMemoryStore<R: Resource> {
    objects: RwLock<BTreeMap<String, R>>,
    events: broadcast::Sender<WatchEvent<R>>,
    snapshot_path: Option<PathBuf>,
    last_version: AtomicU64,
    unavailable: AtomicBool,
}

impl<R: Resource> Default for InMemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resource> InMemoryStore<R> {
    pub fn new() -> Self {
        Self::with_objects(BTreeMap::new(), None)
    }

    /// Loads `path` if it exists and rewrites it atomically after every mutation.
    pub fn open_with_snapshot(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let objects = load_snapshot::<R>(&path)?;
        debug!(
            kind = R::KIND,
            path = %path.display(),
            objects = objects.len(),
            "loaded store snapshot"
        );
        Ok(Self::with_objects(objects, Some(path)))
    }

    fn with_objects(objects: BTreeMap<String, R>, snapshot_path: Option<PathBuf>) -> Self {
        let last_version = objects
            .values()
            .map(|object| object.meta().resource_version)
            .max()
            .unwrap_or(0);
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(objects),
            events,
            snapshot_path,
            last_version: AtomicU64::new(last_version),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Fault switch: while set every operation fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "{} store is not accepting requests",
                R::KIND
            )));
        }
        Ok(())
    }

    fn next_version(&self) -> u64 {
        self.last_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn not_found(name: &str) -> StoreError {
        StoreError::NotFound {
            kind: R::KIND,
            name: name.to_string(),
        }
    }

    /// On a failed snapshot write the in-memory change is rolled back.
    fn persist(
        &self,
        objects: &mut BTreeMap<String, R>,
        name: &str,
        previous: Option<R>,
    ) -> StoreResult<()> {
        let Some(path) = self.snapshot_path.as_deref() else {
            return Ok(());
        };
        if let Err(err) = write_snapshot(path, objects) {
            match previous {
                Some(previous) => {
                    objects.insert(name.to_string(), previous);
                }
                None => {
                    objects.remove(name);
                }
            }
            warn!(kind = R::KIND, %name, error = %err, "store snapshot write failed");
            return Err(err);
        }
        Ok(())
    }

    fn emit(&self, event: WatchEvent<R>) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl<R: Resource> ResourceStore<R> for InMemoryStore<R> {
    async fn get(&self, name: &str) -> StoreResult<Option<R>> {
        self.check_available()?;
        Ok(self.objects.read().await.get(name).cloned())
    }

    async fn list(&self, selector: &LabelSelector) -> StoreResult<Vec<R>> {
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter(|object| selector.matches(object.meta()))
            .cloned()
            .collect())
    }

    async fn create(&self, mut object: R) -> StoreResult<R> {
        self.check_available()?;
        let name = object.name().to_string();
        if name.trim().is_empty() {
            return Err(StoreError::Serialization(format!(
                "{} name must not be empty",
                R::KIND
            )));
        }
        let mut objects = self.objects.write().await;
        if objects.contains_key(&name) {
            return Err(StoreError::AlreadyExists {
                kind: R::KIND,
                name,
            });
        }
        let meta = object.meta_mut();
        meta.deletion_timestamp = None;
        meta.resource_version = self.next_version();
        objects.insert(name.clone(), object.clone());
        self.persist(&mut objects, &name, None)?;
        self.emit(WatchEvent::Added(object.clone()));
        Ok(object)
    }

    async fn update(&self, mut object: R) -> StoreResult<R> {
        self.check_available()?;
        let name = object.name().to_string();
        let mut objects = self.objects.write().await;
        let current = objects
            .get(&name)
            .cloned()
            .ok_or_else(|| Self::not_found(&name))?;
        let actual = current.meta().resource_version;
        let expected = object.meta().resource_version;
        if expected != actual {
            return Err(StoreError::Conflict {
                kind: R::KIND,
                name,
                expected,
                actual,
            });
        }

        let meta = object.meta_mut();
        meta.deletion_timestamp = current.meta().deletion_timestamp;
        meta.resource_version = self.next_version();

        if object.meta().is_deleting() && object.meta().finalizers.is_empty() {
            objects.remove(&name);
            self.persist(&mut objects, &name, Some(current))?;
            self.emit(WatchEvent::Deleted(object.clone()));
            return Ok(object);
        }

        objects.insert(name.clone(), object.clone());
        self.persist(&mut objects, &name, Some(current))?;
        self.emit(WatchEvent::Modified(object.clone()));
        Ok(object)
    }

    async fn delete(&self, name: &str, precondition: Option<u64>) -> StoreResult<()> {
        self.check_available()?;
        let mut objects = self.objects.write().await;
        let current = objects
            .get(name)
            .cloned()
            .ok_or_else(|| Self::not_found(name))?;
        if let Some(expected) = precondition
            && expected != current.meta().resource_version
        {
            return Err(StoreError::Conflict {
                kind: R::KIND,
                name: name.to_string(),
                expected,
                actual: current.meta().resource_version,
            });
        }

        if !current.meta().finalizers.is_empty() {
            if current.meta().is_deleting() {
                return Ok(());
            }
            let mut marked = current.clone();
            let meta = marked.meta_mut();
            meta.deletion_timestamp = Some(unix_now_secs());
            meta.resource_version = self.next_version();
            objects.insert(name.to_string(), marked.clone());
            self.persist(&mut objects, name, Some(current))?;
            self.emit(WatchEvent::Modified(marked));
            return Ok(());
        }

        objects.remove(name);
        self.persist(&mut objects, name, Some(current.clone()))?;
        self.emit(WatchEvent::Deleted(current));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent<R>> {
        self.events.subscribe()
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
