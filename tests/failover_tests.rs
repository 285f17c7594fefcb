//! Failover tests: crash-signal detection, exactly-once queueing, the
//! claim/execute/clear lifecycle and configuration toggling.


use std::time::Duration;

use shardlite::node_path::JobNodePath;
use shardlite::registry::RegistryClient;
use shardlite::JobConfig;
use test_harness::{assert_eventually, TestCluster};

fn config() -> JobConfig {
    JobConfig::new("failover-job", 3).with_failover(true)
}

fn paths() -> JobNodePath {
    JobNodePath::new("failover-job")
}

/// A running marker vanishing without a completed marker queues the item
/// for failover exactly once, even when notifications repeat.
#[tokio::test]
async fn test_crash_signal_queues_item_once() {
    let mut cluster = TestCluster::new(2, config()).await;
    cluster.converge_sharding().await;

    let victim_items = cluster
        .get("instance-1")
        .coordinator
        .get_local_items()
        .await
        .unwrap();
    let crashed_item = victim_items[0];
    cluster
        .get("instance-1")
        .coordinator
        .register_job_begin(&[crashed_item])
        .await
        .unwrap();
    cluster.crash_instance("instance-1").await;

    let probe = cluster.registry.connect();
    let paths = paths();
    assert_eventually(
        || async {
            probe
                .is_existed(&paths.failover_queue_item(crashed_item))
                .await
                .unwrap()
        },
        Duration::from_secs(3),
        "crashed item should be queued for failover",
    )
    .await;

    // A duplicate notification adds nothing.
    cluster
        .get("instance-2")
        .coordinator
        .failover
        .set_crashed_failover_flag(crashed_item)
        .await
        .unwrap();
    assert_eq!(
        probe
            .get_num_children(&paths.failover_items_root())
            .await
            .unwrap(),
        1
    );

    cluster.shutdown().await;
}

/// Full scenario: an instance crashes mid-execution, a peer claims the
/// item, runs it out of cycle, and clears every failover record.
#[tokio::test]
async fn test_claimed_item_is_executed_and_cleared() {
    let mut cluster = TestCluster::new(2, config()).await;
    cluster.converge_sharding().await;

    let victim_items = cluster
        .get("instance-1")
        .coordinator
        .get_local_items()
        .await
        .unwrap();
    let crashed_item = victim_items[0];
    cluster
        .get("instance-1")
        .coordinator
        .register_job_begin(&[crashed_item])
        .await
        .unwrap();
    cluster.crash_instance("instance-1").await;

    let probe = cluster.registry.connect();
    let paths = paths();
    assert_eventually(
        || async {
            probe
                .is_existed(&paths.failover_queue_item(crashed_item))
                .await
                .unwrap()
        },
        Duration::from_secs(3),
        "crashed item should be queued for failover",
    )
    .await;

    let survivor = cluster.get("instance-2").coordinator.clone();
    let mut immediate_runs = survivor
        .take_immediate_run_events()
        .expect("immediate-run receiver should be available");

    survivor.failover_if_necessary().await.unwrap();

    // The claim names the survivor, empties the queue, and triggers an
    // immediate local run of exactly that item.
    assert_eq!(
        probe
            .get(&paths.item_failover(crashed_item))
            .await
            .unwrap()
            .as_deref(),
        Some("instance-2")
    );
    assert_eq!(
        probe
            .get_num_children(&paths.failover_items_root())
            .await
            .unwrap(),
        0
    );
    let triggered = tokio::time::timeout(Duration::from_secs(1), immediate_runs.recv())
        .await
        .expect("immediate run should be triggered");
    assert_eq!(triggered, Some(crashed_item));

    // Failover items take priority over the survivor's own slice.
    assert_eq!(
        survivor.get_local_items().await.unwrap(),
        vec![crashed_item]
    );

    survivor.register_job_begin(&[crashed_item]).await.unwrap();
    survivor
        .register_job_completed(&[crashed_item])
        .await
        .unwrap();

    assert!(!probe
        .is_existed(&paths.item_failover(crashed_item))
        .await
        .unwrap());
    assert!(!probe
        .is_existed(&paths.failover_queue_item(crashed_item))
        .await
        .unwrap());

    cluster.shutdown().await;
}

/// An item that completed normally before the crash is no crash signal.
#[tokio::test]
async fn test_completed_item_does_not_failover() {
    let mut cluster = TestCluster::new(2, config()).await;
    cluster.converge_sharding().await;

    let victim_items = cluster
        .get("instance-1")
        .coordinator
        .get_local_items()
        .await
        .unwrap();
    let item = victim_items[0];
    let victim = cluster.get("instance-1").coordinator.clone();
    victim.register_job_begin(&[item]).await.unwrap();
    victim.register_job_completed(&[item]).await.unwrap();
    cluster.crash_instance("instance-1").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let probe = cluster.registry.connect();
    assert_eq!(
        probe
            .get_num_children(&paths().failover_items_root())
            .await
            .unwrap(),
        0
    );

    cluster.shutdown().await;
}

/// With failover disabled nothing is queued on a crash.
#[tokio::test]
async fn test_no_failover_when_disabled() {
    let mut cluster =
        TestCluster::new(2, JobConfig::new("failover-job", 3).with_failover(false)).await;
    cluster.converge_sharding().await;

    let victim_items = cluster
        .get("instance-1")
        .coordinator
        .get_local_items()
        .await
        .unwrap();
    cluster
        .get("instance-1")
        .coordinator
        .register_job_begin(&victim_items)
        .await
        .unwrap();
    cluster.crash_instance("instance-1").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let probe = cluster.registry.connect();
    assert_eq!(
        probe
            .get_num_children(&paths().failover_items_root())
            .await
            .unwrap(),
        0
    );

    cluster.shutdown().await;
}

/// A claim is deferred while the claimer still runs its own items, so
/// failover never steals capacity mid-execution.
#[tokio::test]
async fn test_claim_deferred_while_local_items_running() {
    let mut cluster = TestCluster::new(2, config()).await;
    cluster.converge_sharding().await;

    let victim_items = cluster
        .get("instance-1")
        .coordinator
        .get_local_items()
        .await
        .unwrap();
    let crashed_item = victim_items[0];
    cluster
        .get("instance-1")
        .coordinator
        .register_job_begin(&[crashed_item])
        .await
        .unwrap();
    cluster.crash_instance("instance-1").await;

    let probe = cluster.registry.connect();
    let paths = paths();
    assert_eventually(
        || async {
            probe
                .is_existed(&paths.failover_queue_item(crashed_item))
                .await
                .unwrap()
        },
        Duration::from_secs(3),
        "crashed item should be queued for failover",
    )
    .await;

    let survivor = cluster.get("instance-2").coordinator.clone();
    let own_items = survivor.get_local_items().await.unwrap();
    survivor.register_job_begin(&own_items).await.unwrap();

    survivor.failover_if_necessary().await.unwrap();
    assert_eq!(
        probe
            .get_num_children(&paths.failover_items_root())
            .await
            .unwrap(),
        1,
        "claim should be deferred while own items run"
    );

    survivor.register_job_completed(&own_items).await.unwrap();
    survivor.failover_if_necessary().await.unwrap();
    assert_eq!(
        probe
            .get_num_children(&paths.failover_items_root())
            .await
            .unwrap(),
        0,
        "claim should proceed once own items finished"
    );

    cluster.shutdown().await;
}

/// Queued items are claimed lowest id first.
#[tokio::test]
async fn test_lowest_queued_item_claimed_first() {
    let mut cluster = TestCluster::new(1, config()).await;
    cluster.converge_sharding().await;

    let coordinator = cluster.get("instance-1").coordinator.clone();
    coordinator.failover.set_crashed_failover_flag(2).await.unwrap();
    coordinator.failover.set_crashed_failover_flag(0).await.unwrap();

    coordinator.failover_if_necessary().await.unwrap();

    let probe = cluster.registry.connect();
    let paths = paths();
    assert_eq!(
        probe.get(&paths.item_failover(0)).await.unwrap().as_deref(),
        Some("instance-1")
    );
    assert!(probe.is_existed(&paths.failover_queue_item(2)).await.unwrap());

    cluster.shutdown().await;
}

/// Turning failover off through configuration clears stale failover
/// records.
#[tokio::test]
async fn test_disabling_failover_clears_records() {
    let mut cluster = TestCluster::new(2, config()).await;
    cluster.converge_sharding().await;

    let coordinator = cluster.get("instance-2").coordinator.clone();
    coordinator.failover.set_crashed_failover_flag(1).await.unwrap();

    let probe = cluster.registry.connect();
    let paths = paths();
    assert!(probe.is_existed(&paths.failover_queue_item(1)).await.unwrap());

    let disabled = config().with_failover(false).with_overwrite(true);
    probe
        .persist(&paths.config(), &serde_json::to_string(&disabled).unwrap())
        .await
        .unwrap();

    assert_eventually(
        || async {
            probe
                .get_num_children(&paths.failover_items_root())
                .await
                .unwrap()
                == 0
        },
        Duration::from_secs(3),
        "disabling failover should clear queued records",
    )
    .await;

    cluster.shutdown().await;
}
