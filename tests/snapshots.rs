mod common;

use common::{open_storage, test_config};
use storyboard_store::models::Project;
use storyboard_store::snapshots::{validate_snapshot, SnapshotManager, MAX_SNAPSHOTS};
use storyboard_store::storage::SettingsStore;

fn version(name: &str) -> Project {
    let mut project = Project::new(1_712_000_000_000);
    project.name = name.to_string();
    project
}

#[tokio::test]
async fn pop_without_snapshots_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = SnapshotManager::new(SettingsStore::new(open_storage(&test_config(&dir)).await));

    assert!(snapshots.pop_latest_snapshot(42).await.unwrap().is_none());
}

#[tokio::test]
async fn only_the_three_most_recent_snapshots_are_kept() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = SnapshotManager::new(SettingsStore::new(open_storage(&test_config(&dir)).await));
    let id = 1_712_000_000_000;

    for name in ["v1", "v2", "v3", "v4"] {
        snapshots.push_snapshot(id, &version(name)).await.unwrap();
    }

    let kept: Vec<String> = snapshots
        .list(id)
        .await
        .unwrap()
        .iter()
        .map(|s| validate_snapshot(s).unwrap().name)
        .collect();
    assert_eq!(kept.len(), MAX_SNAPSHOTS);
    assert_eq!(kept, vec!["v2", "v3", "v4"]);

    // Popping walks back from the newest
    let latest = snapshots.pop_latest_snapshot(id).await.unwrap().unwrap();
    assert_eq!(validate_snapshot(&latest).unwrap().name, "v4");
    let next = snapshots.pop_latest_snapshot(id).await.unwrap().unwrap();
    assert_eq!(validate_snapshot(&next).unwrap().name, "v3");
    assert_eq!(snapshots.list(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn snapshot_lists_are_kept_per_project() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = SnapshotManager::new(SettingsStore::new(open_storage(&test_config(&dir)).await));

    snapshots.push_snapshot(1, &version("one")).await.unwrap();
    snapshots.push_snapshot(2, &version("two")).await.unwrap();
    assert_eq!(snapshots.all().await.unwrap().len(), 2);

    snapshots.clear(1).await.unwrap();
    assert!(snapshots.list(1).await.unwrap().is_empty());
    assert_eq!(snapshots.list(2).await.unwrap().len(), 1);
}

#[tokio::test]
async fn corrupt_snapshot_list_reads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let settings = SettingsStore::new(open_storage(&test_config(&dir)).await);
    settings.set("projectSnapshots_5", "not json").await.unwrap();

    let snapshots = SnapshotManager::new(settings);
    assert!(snapshots.pop_latest_snapshot(5).await.unwrap().is_none());

    // Pushing replaces the unreadable list
    snapshots.push_snapshot(5, &version("fresh")).await.unwrap();
    assert_eq!(snapshots.list(5).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pushes_are_all_kept() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = SnapshotManager::new(SettingsStore::new(open_storage(&test_config(&dir)).await));
    let id = 7;

    let (va, vb, vc) = (version("a"), version("b"), version("c"));
    let (a, b, c) = tokio::join!(
        snapshots.push_snapshot(id, &va),
        snapshots.push_snapshot(id, &vb),
        snapshots.push_snapshot(id, &vc),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let mut names: Vec<String> = snapshots
        .list(id)
        .await
        .unwrap()
        .iter()
        .map(|s| validate_snapshot(s).unwrap().name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["a", "b", "c"]);

    // Spawned pushes race on separate worker threads
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let snapshots = snapshots.clone();
            tokio::spawn(async move { snapshots.push_snapshot(8, &version(&format!("t{}", i))).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(snapshots.list(8).await.unwrap().len(), MAX_SNAPSHOTS);
}
