mod common;

use cleanlog_sync::model::{DrainReport, LogStatus};
use cleanlog_sync::sync::RetryPolicy;
use common::{offline_err, record, setup_core, setup_core_with, test_settings, RecordingRemote};
use std::time::Duration;

#[tokio::test]
async fn drain_syncs_everything_in_creation_order() {
    let remote = RecordingRemote::new();
    let core = setup_core(&remote, true).await;

    let x = core
        .store
        .enqueue(&record("loc-1", "x", LogStatus::Complete))
        .await
        .unwrap();
    let y = core
        .store
        .enqueue(&record("loc-2", "y", LogStatus::AttentionRequired))
        .await
        .unwrap();

    let report = core.engine.drain().await.unwrap();
    assert_eq!(
        report,
        DrainReport {
            synced: 2,
            failed: 0,
            deferred: 0,
            dead_lettered: 0
        }
    );
    assert!(core.store.is_empty().await.unwrap());

    let calls = remote.insert_calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].record.staff_name, "x");
    assert_eq!(calls[1].record.staff_name, "y");
    // The offline id travels as the idempotency key, not in the payload.
    assert_eq!(calls[0].idempotency_key.as_deref(), Some(x.as_str()));
    assert_eq!(calls[1].idempotency_key.as_deref(), Some(y.as_str()));
}

#[tokio::test]
async fn failed_record_stays_queued_and_later_records_still_sync() {
    let remote = RecordingRemote::new();
    remote.push_insert(Err(offline_err())).await;
    remote.push_insert(Ok(())).await;
    let core = setup_core(&remote, true).await;

    let x = core
        .store
        .enqueue(&record("loc-1", "x", LogStatus::Complete))
        .await
        .unwrap();
    core.store
        .enqueue(&record("loc-1", "y", LogStatus::Complete))
        .await
        .unwrap();

    let report = core.engine.drain().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.synced + report.failed, 2);

    let left = core.store.list_by_creation_order().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].offline_id, x);
    assert_eq!(left[0].attempt, 1);
    assert!(left[0].last_error.as_deref().unwrap().contains("connection refused"));
    assert!(left[0].next_attempt_at > left[0].created_at);
}

#[tokio::test]
async fn backed_off_record_is_deferred_until_due() {
    let remote = RecordingRemote::new();
    remote.push_insert(Err(offline_err())).await;
    let core = setup_core(&remote, true).await;
    core.store
        .enqueue(&record("loc-1", "x", LogStatus::Complete))
        .await
        .unwrap();

    let first = core.engine.drain().await.unwrap();
    assert_eq!(first.failed, 1);

    let second = core.engine.drain().await.unwrap();
    assert_eq!(
        second,
        DrainReport {
            synced: 0,
            failed: 0,
            deferred: 1,
            dead_lettered: 0
        }
    );
    assert_eq!(remote.insert_calls().await.len(), 1);
}

#[tokio::test]
async fn record_is_dead_lettered_at_the_attempt_ceiling() {
    let remote = RecordingRemote::new();
    remote.push_insert(Err(common::rejection(422, "bad payload"))).await;
    let mut settings = test_settings();
    settings.retry = RetryPolicy {
        max_attempts: Some(1),
        ..settings.retry
    };
    let core = setup_core_with(&remote, true, settings).await;
    let id = core
        .store
        .enqueue(&record("loc-1", "x", LogStatus::Complete))
        .await
        .unwrap();

    let report = core.engine.drain().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.dead_lettered, 1);

    assert!(core.store.list_by_creation_order().await.unwrap().is_empty());
    let dead = core.store.list_dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].offline_id, id);
    assert!(dead[0].dead_lettered_at.is_some());

    // Dead letters are not retried.
    let again = core.engine.drain().await.unwrap();
    assert_eq!(again, DrainReport::default());
    assert_eq!(remote.insert_calls().await.len(), 1);
}

#[tokio::test]
async fn drain_while_offline_leaves_store_untouched() {
    let remote = RecordingRemote::new();
    let core = setup_core(&remote, false).await;
    core.store
        .enqueue(&record("loc-1", "x", LogStatus::Complete))
        .await
        .unwrap();

    let report = core.engine.drain().await.unwrap();
    assert_eq!(report, DrainReport::default());
    assert!(remote.insert_calls().await.is_empty());

    let left = core.store.list_by_creation_order().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].attempt, 0);
}

#[tokio::test]
async fn drain_of_empty_store_is_a_noop() {
    let remote = RecordingRemote::new();
    let core = setup_core(&remote, true).await;
    assert_eq!(core.engine.drain().await.unwrap(), DrainReport::default());
    assert!(remote.insert_calls().await.is_empty());
}

#[tokio::test]
async fn concurrent_drain_returns_immediately() {
    let (remote, started, release) = RecordingRemote::gated();
    let core = setup_core(&remote, true).await;
    core.store
        .enqueue(&record("loc-1", "x", LogStatus::Complete))
        .await
        .unwrap();

    let engine = core.engine.clone();
    let first = tokio::spawn(async move { engine.drain().await.unwrap() });
    started.notified().await;
    assert!(core.engine.is_draining());

    let second = core.engine.drain().await.unwrap();
    assert_eq!(second, DrainReport::default());
    assert_eq!(remote.insert_calls().await.len(), 1);

    release.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.synced, 1);
    assert!(!core.engine.is_draining());
    assert!(core.store.is_empty().await.unwrap());
}

#[tokio::test]
async fn hung_insert_times_out_and_counts_as_failure() {
    let (remote, _started, _release) = RecordingRemote::gated();
    let mut settings = test_settings();
    settings.call_timeout = Duration::from_millis(50);
    let core = setup_core_with(&remote, true, settings).await;
    core.store
        .enqueue(&record("loc-1", "x", LogStatus::Complete))
        .await
        .unwrap();

    let report = core.engine.drain().await.unwrap();
    assert_eq!(report.failed, 1);
    let left = core.store.list_by_creation_order().await.unwrap();
    assert_eq!(left[0].attempt, 1);
    assert!(left[0].last_error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn drain_timeout_releases_the_single_flight_flag() {
    let (remote, _started, _release) = RecordingRemote::gated();
    let mut settings = test_settings();
    settings.call_timeout = Duration::from_secs(60);
    settings.drain_timeout = Duration::from_millis(50);
    let core = setup_core_with(&remote, true, settings).await;
    core.store
        .enqueue(&record("loc-1", "x", LogStatus::Complete))
        .await
        .unwrap();

    let report = core.engine.drain().await.unwrap();
    assert_eq!(report.synced + report.failed, 0);
    assert!(!core.engine.is_draining());
    assert_eq!(core.store.count_pending().await.unwrap(), 1);
}

#[tokio::test]
async fn sync_loop_drains_on_startup_and_after_reconnect() {
    let remote = RecordingRemote::new();
    let core = setup_core(&remote, true).await;
    core.store
        .enqueue(&record("loc-1", "before start", LogStatus::Complete))
        .await
        .unwrap();

    let handle = core.spawn_sync_loop();
    wait_until_empty(&core).await;
    assert_eq!(remote.insert_calls().await.len(), 1);

    core.network.set_connected(false);
    core.store
        .enqueue(&record("loc-1", "while offline", LogStatus::Complete))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(core.store.count_pending().await.unwrap(), 1);

    core.network.set_connected(true);
    wait_until_empty(&core).await;
    let calls = remote.insert_calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].record.staff_name, "while offline");

    handle.abort();
}

#[tokio::test]
async fn link_dropping_during_settle_delay_skips_the_drain() {
    let remote = RecordingRemote::new();
    let mut settings = test_settings();
    settings.schedule.settle_delay = Duration::from_millis(200);
    let core = setup_core_with(&remote, false, settings).await;
    core.store
        .enqueue(&record("loc-1", "flapping", LogStatus::Complete))
        .await
        .unwrap();

    let handle = core.spawn_sync_loop();
    // Let the startup sweep run while offline.
    tokio::time::sleep(Duration::from_millis(50)).await;

    core.network.set_connected(true);
    core.network.set_connected(false);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(remote.insert_calls().await.is_empty());
    assert_eq!(core.store.count_pending().await.unwrap(), 1);

    // The next stable regain still drains.
    core.network.set_connected(true);
    wait_until_empty(&core).await;
    assert_eq!(remote.insert_calls().await.len(), 1);

    handle.abort();
}

async fn wait_until_empty(core: &cleanlog_sync::app::Core) {
    for _ in 0..200 {
        if core.store.is_empty().await.unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pending queue never drained");
}
