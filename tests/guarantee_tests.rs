//! Guarantee barrier tests: completeness of the all-started/all-completed
//! conditions and exactly-once callback firing under racing instances.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use shardlite::JobConfig;
use test_harness::TestCluster;

fn config() -> JobConfig {
    JobConfig::new("guarantee-job", 4)
}

/// The barrier opens only after every item across all instances registered.
#[tokio::test]
async fn test_all_started_requires_every_item() {
    let mut cluster = TestCluster::new(2, config()).await;
    cluster.converge_sharding().await;

    let first = cluster.get("instance-1").coordinator.clone();
    let second = cluster.get("instance-2").coordinator.clone();

    first.register_start(&[0, 1]).await.unwrap();
    assert!(!first.is_all_started().await.unwrap());
    assert!(!second.is_all_started().await.unwrap());

    second.register_start(&[2, 3]).await.unwrap();
    assert!(first.is_all_started().await.unwrap());
    assert!(second.is_all_started().await.unwrap());

    cluster.shutdown().await;
}

/// Racing instances fire the cycle callback exactly once; the markers are
/// cleared for the next cycle.
#[tokio::test]
async fn test_started_callback_fires_exactly_once() {
    let mut cluster = TestCluster::new(2, config()).await;
    cluster.converge_sharding().await;

    let first = cluster.get("instance-1").coordinator.clone();
    let second = cluster.get("instance-2").coordinator.clone();
    first.register_start(&[0, 1]).await.unwrap();
    second.register_start(&[2, 3]).await.unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_first = fired.clone();
    let fired_second = fired.clone();

    let first_won = first
        .guarantee
        .fire_when_all_started(move || {
            fired_first.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    let second_won = second
        .guarantee
        .fire_when_all_started(move || {
            fired_second.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert!(first_won);
    assert!(!second_won);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!first.is_all_started().await.unwrap());

    cluster.shutdown().await;
}

/// Same exactly-once discipline for the completion barrier.
#[tokio::test]
async fn test_completed_callback_fires_exactly_once() {
    let mut cluster = TestCluster::new(2, config()).await;
    cluster.converge_sharding().await;

    let first = cluster.get("instance-1").coordinator.clone();
    let second = cluster.get("instance-2").coordinator.clone();
    first.register_complete(&[0, 1]).await.unwrap();
    assert!(!first.is_all_completed().await.unwrap());
    second.register_complete(&[2, 3]).await.unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = fired.clone();
    let won = second
        .guarantee
        .fire_when_all_completed(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    assert!(won);

    let fired_clone = fired.clone();
    let won_again = first
        .guarantee
        .fire_when_all_completed(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    assert!(!won_again);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    cluster.shutdown().await;
}

/// Streaming jobs have no discrete start barrier; completion still works.
#[tokio::test]
async fn test_streaming_job_excluded_from_started_barrier() {
    let mut cluster =
        TestCluster::new(1, config().with_streaming_process(true)).await;
    cluster.converge_sharding().await;

    let coordinator = cluster.get("instance-1").coordinator.clone();
    coordinator.register_start(&[0, 1, 2, 3]).await.unwrap();
    assert!(!coordinator.is_all_started().await.unwrap());

    coordinator.register_complete(&[0, 1, 2, 3]).await.unwrap();
    assert!(coordinator.is_all_completed().await.unwrap());

    cluster.shutdown().await;
}

/// Explicit clears reset the barrier for the next cycle.
#[tokio::test]
async fn test_explicit_clear_resets_barrier() {
    let mut cluster = TestCluster::new(1, config()).await;
    cluster.converge_sharding().await;

    let coordinator = cluster.get("instance-1").coordinator.clone();
    coordinator.register_start(&[0, 1, 2, 3]).await.unwrap();
    coordinator.register_complete(&[0, 1, 2, 3]).await.unwrap();
    assert!(coordinator.is_all_started().await.unwrap());
    assert!(coordinator.is_all_completed().await.unwrap());

    coordinator.guarantee.clear_all_started_info().await.unwrap();
    coordinator
        .guarantee
        .clear_all_completed_info()
        .await
        .unwrap();
    assert!(!coordinator.is_all_started().await.unwrap());
    assert!(!coordinator.is_all_completed().await.unwrap());

    cluster.shutdown().await;
}
