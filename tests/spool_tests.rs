mod test_harness;

use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use qspool::config::{DispatchStrategy, SpoolConfig};
use qspool::dispenser::request_job;
use qspool::spool::Phase;
use qspool::{Spool, SpoolError};
use test_harness::{
    assert_eventually, data_files, qstat_listing, template_file, test_config, FakeScheduler,
    FAKE_JOB_ID,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

fn loopback(spool: &Spool) -> SocketAddr {
    let port = spool.dispenser_addr().expect("array spool runs a dispenser").port();
    SocketAddr::from(([127, 0, 0, 1], port))
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn test_start_without_script_fails() {
    let result = Spool::start(SpoolConfig::default()).await;
    assert!(matches!(result, Err(SpoolError::Configuration(_))));
}

#[tokio::test]
async fn test_start_with_zero_cap_fails() {
    let scratch = tempfile::tempdir().unwrap();
    let config = test_config(DispatchStrategy::Direct, scratch.path()).with_max_concurrent(0);
    assert!(matches!(
        Spool::start(config).await,
        Err(SpoolError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_start_with_zero_settle_fails() {
    let scratch = tempfile::tempdir().unwrap();
    let config = test_config(DispatchStrategy::Direct, scratch.path())
        .with_delays(Duration::ZERO, Duration::ZERO);
    assert!(matches!(
        Spool::start(config).await,
        Err(SpoolError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_start_with_invalid_pattern_fails() {
    let scratch = tempfile::tempdir().unwrap();
    let config = test_config(DispatchStrategy::Direct, scratch.path()).with_pattern("(unclosed");
    assert!(matches!(
        Spool::start(config).await,
        Err(SpoolError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_start_fails_when_port_taken() {
    let scratch = tempfile::tempdir().unwrap();
    let taken = TcpListener::bind("0.0.0.0:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let config = test_config(DispatchStrategy::Array, scratch.path()).with_port(port);
    assert!(Spool::start(config).await.is_err());
}

#[tokio::test]
async fn test_direct_spool_has_no_dispenser() {
    let scratch = tempfile::tempdir().unwrap();
    let spool = Spool::start(test_config(DispatchStrategy::Direct, scratch.path()))
        .await
        .unwrap();
    assert!(spool.dispenser_addr().is_none());
    assert_eq!(spool.phase(), Phase::Idle);
    spool.stop(false).await;
}

// =============================================================================
// Direct strategy
// =============================================================================

#[tokio::test]
async fn test_direct_spool_drains() {
    let data = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let files = data_files(data.path(), 5, "txt");
    let config = test_config(DispatchStrategy::Direct, scratch.path()).with_max_concurrent(2);
    let spool = Spool::start(config).await.unwrap();

    for file in &files {
        assert!(spool.enqueue(file.clone()).await);
    }

    tokio::time::timeout(DRAIN_TIMEOUT, spool.wait_drained())
        .await
        .expect("spool should drain");

    let status = spool.status().await;
    assert_eq!(status.size, 0);
    assert_eq!(status.phase, Phase::Idle);
    spool.stop(false).await;
}

#[tokio::test]
async fn test_dequeue_cancels_dispatched_item() {
    let data = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let files = data_files(data.path(), 3, "txt");
    let mut config = test_config(DispatchStrategy::Direct, scratch.path()).with_max_concurrent(2);
    config.templates.submission = Some(template_file(scratch.path(), "sleeper.sh", "sleep 30\n"));
    let spool = Spool::start(config).await.unwrap();

    for file in &files {
        spool.enqueue(file.clone()).await;
    }
    assert_eventually(
        || async { spool.status().await.dispatched == 2 },
        Duration::from_secs(5),
        "two items should be dispatched",
    )
    .await;

    assert!(spool.dequeue(&files[0]).await);
    assert_eq!(spool.size().await, 2);
    assert!(!spool.dequeue(&files[0]).await);

    spool.stop(false).await;
}

#[tokio::test]
async fn test_stop_waits_for_queue_to_empty() {
    let data = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let files = data_files(data.path(), 3, "txt");
    let config = test_config(DispatchStrategy::Direct, scratch.path()).with_max_concurrent(1);
    let spool = Spool::start(config).await.unwrap();
    let store = spool.store();

    for file in &files {
        spool.enqueue(file.clone()).await;
    }

    tokio::time::timeout(DRAIN_TIMEOUT, spool.stop(true))
        .await
        .expect("stop should return once drained");
    assert!(store.lock().await.is_empty());
}

#[tokio::test]
async fn test_stop_now_keeps_waiting_items() {
    let data = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let files = data_files(data.path(), 3, "txt");
    let mut config = test_config(DispatchStrategy::Direct, scratch.path()).with_max_concurrent(1);
    config.templates.submission = Some(template_file(scratch.path(), "sleeper.sh", "sleep 30\n"));
    let spool = Spool::start(config).await.unwrap();
    let store = spool.store();

    for file in &files {
        spool.enqueue(file.clone()).await;
    }
    assert_eventually(
        || async { spool.status().await.dispatched == 1 },
        Duration::from_secs(5),
        "one item should be dispatched",
    )
    .await;

    spool.stop(false).await;

    let store = store.lock().await;
    assert_eq!(store.dispatched_count(), 0);
    assert_eq!(store.waiting_count(), 2);
}

// =============================================================================
// Array strategy
// =============================================================================

/// The test plays the array tasks: it claims every item over the dispenser,
/// then reports the batch finished.
#[tokio::test]
async fn test_array_spool_drains() {
    let data = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let scheduler = FakeScheduler::new();
    scheduler.report(FAKE_JOB_ID, "R");
    let files = data_files(data.path(), 3, "txt");
    let config = test_config(DispatchStrategy::Array, scratch.path()).with_scheduler(scheduler.config());
    let spool = Spool::start(config).await.unwrap();
    let addr = loopback(&spool);

    for file in &files {
        spool.enqueue(file.clone()).await;
    }
    assert_eventually(
        || async { spool.status().await.batch.is_some() },
        Duration::from_secs(5),
        "array batch should be submitted",
    )
    .await;
    assert_eq!(scheduler.submitted().len(), 1);

    let mut claimed = Vec::new();
    while let Some(path) = request_job(addr).await.unwrap() {
        claimed.push(path);
    }
    assert_eq!(claimed, files);

    // Still running: nothing retires yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(spool.size().await, 3);

    scheduler.set_status(&qstat_listing(&[(FAKE_JOB_ID, "C")]));
    tokio::time::timeout(DRAIN_TIMEOUT, spool.wait_drained())
        .await
        .expect("spool should drain");

    let status = spool.status().await;
    assert_eq!(status.size, 0);
    assert!(status.batch.is_none());
    assert_eq!(scheduler.submitted().len(), 1);
    spool.stop(false).await;
    assert!(scheduler.cancelled().is_empty());
}

#[tokio::test]
async fn test_array_stop_cancels_live_batch() {
    let data = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let scheduler = FakeScheduler::new();
    scheduler.report(FAKE_JOB_ID, "Q");
    let files = data_files(data.path(), 2, "txt");
    let config = test_config(DispatchStrategy::Array, scratch.path()).with_scheduler(scheduler.config());
    let spool = Spool::start(config).await.unwrap();

    for file in &files {
        spool.enqueue(file.clone()).await;
    }
    assert_eventually(
        || async { spool.status().await.batch.is_some() },
        Duration::from_secs(5),
        "array batch should be submitted",
    )
    .await;

    spool.stop(false).await;
    assert_eq!(scheduler.cancelled(), vec![FAKE_JOB_ID.to_string()]);
}

#[tokio::test]
async fn test_status_serializes_to_json() {
    let scratch = tempfile::tempdir().unwrap();
    let spool = Spool::start(test_config(DispatchStrategy::Direct, scratch.path()))
        .await
        .unwrap();

    let json = serde_json::to_value(spool.status().await).unwrap();
    assert_eq!(json["size"], 0);
    assert_eq!(json["phase"], "idle");
    assert!(json["batch"].is_null());

    spool.stop(false).await;
}
