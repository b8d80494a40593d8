use std::{
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use schema::{ServiceStorage, Shard, ShardKind, ShardState};
use store::{InMemoryStore, LabelSelector, ResourceStore};

fn temp_snapshot_path() -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic")
        .as_nanos();
    path.push(format!(
        "tenancy-store-snapshot-{}-{}.json",
        std::process::id(),
        nanos
    ));
    path
}

#[tokio::test]
async fn snapshot_keeps_deleting_deadline_across_reopen() {
    let path = temp_snapshot_path();
    let pair = ServiceStorage::new("svc", "store");

    {
        let store = InMemoryStore::<Shard>::open_with_snapshot(&path).unwrap();
        let mut shard = Shard::new(&pair, ShardKind::Ingestion, 0, 2);
        shard.mark_deleting(1_900_000_000);
        store.create(shard).await.unwrap();
        store
            .create(Shard::new(&pair, ShardKind::Ingestion, 1, 2))
            .await
            .unwrap();
    }

    let reopened = InMemoryStore::<Shard>::open_with_snapshot(&path).unwrap();
    let shards = reopened.list(&LabelSelector::everything()).await.unwrap();
    assert_eq!(shards.len(), 2);
    assert_eq!(shards[0].state(), ShardState::Deleting);
    assert_eq!(shards[0].deadline(), Some(1_900_000_000));
    assert_eq!(shards[0].replicas, 2);

    // Versions keep increasing after reopen so stale writers still conflict.
    let max_version = shards
        .iter()
        .map(|shard| shard.meta.resource_version)
        .max()
        .unwrap();
    let created = reopened
        .create(Shard::new(&pair, ShardKind::Ingestion, 2, 1))
        .await
        .unwrap();
    assert!(created.meta.resource_version > max_version);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn missing_snapshot_file_opens_empty() {
    let path = temp_snapshot_path();
    let store = InMemoryStore::<Shard>::open_with_snapshot(&path).unwrap();
    assert!(store.is_empty().await);
    assert!(!path.exists());
}
