//! Artifact Store Integration Tests
//!
//! Concurrent writers and on-disk durability of the local store.

use std::collections::BTreeSet;
use std::sync::Arc;

use mlpipe::domain::{ArtifactDescriptor, ArtifactRef, ArtifactTag, RunGroup};
use mlpipe::tracking::{LocalArtifactStore, Tracker};
use tempfile::TempDir;

fn group() -> RunGroup {
    RunGroup::new("nyc_airbnb", "development")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishes_get_distinct_versions() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(LocalArtifactStore::new(temp.path().join("store")));
    let descriptor = ArtifactDescriptor::new("clean_sample.csv", "clean_sample", "Cleaned data");

    let mut handles = Vec::new();
    for i in 0..8 {
        let source_dir = temp.path().join(format!("src{}", i));
        std::fs::create_dir_all(&source_dir).unwrap();
        let source = source_dir.join("clean_sample.csv");
        std::fs::write(&source, format!("row {}\n", i)).unwrap();

        let store = Arc::clone(&store);
        let descriptor = descriptor.clone();
        handles.push(tokio::spawn(async move {
            store.publish(&group(), &descriptor, &source).await.unwrap()
        }));
    }

    let mut versions = BTreeSet::new();
    for handle in handles {
        versions.insert(handle.await.unwrap().version);
    }
    assert_eq!(versions, (0..8).collect::<BTreeSet<u32>>());

    let latest = store
        .resolve(&group(), &ArtifactRef::latest("clean_sample.csv").unwrap())
        .await
        .unwrap();
    assert_eq!(latest.version, 7);
}

#[tokio::test]
async fn test_store_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");
    let source = temp.path().join("sample1.csv");
    std::fs::write(&source, "id,price\n").unwrap();

    {
        let store = LocalArtifactStore::new(&root);
        let descriptor = ArtifactDescriptor::new("sample1.csv", "raw_data", "Raw data from local file");
        store.publish(&group(), &descriptor, &source).await.unwrap();
        store
            .promote("nyc_airbnb", "sample1.csv", 0, ArtifactTag::Reference)
            .await
            .unwrap();
    }

    // The source can go away; the store keeps its own copy
    std::fs::remove_file(&source).unwrap();

    let reopened = LocalArtifactStore::new(&root);
    let reference = "sample1.csv:reference".parse::<ArtifactRef>().unwrap();
    let handle = reopened.resolve(&group(), &reference).await.unwrap();
    assert_eq!(handle.version, 0);
    assert_eq!(handle.description, "Raw data from local file");
    assert_eq!(std::fs::read_to_string(&handle.path).unwrap(), "id,price\n");
}
