use super::{
    core_config, next_completion, outbox_send, start, start_default, stored_notification,
    wait_idle, wait_until, Notice, RecordingAlarm, RecordingNotifier, START_MS,
};
use crate::connectivity::{LeaseMode, SimulatedConnectivity};
use crate::policy::{DefaultRetryScheme, RetryPolicy};
use crate::retry::RetryScheduler;
use crate::service::TransactionBundle;
use crate::store::{DownloadState, ErrorType, InMemoryStore, MessageStore};
use crate::time::ManualClock;
use crate::transaction::TransactionKind;
use std::sync::Arc;

const LOCATION: &str = "http://mmsc.test/get/missing";

fn scheduler(
    store: &InMemoryStore,
    clock: Arc<ManualClock>,
    connected: bool,
    policy: RetryPolicy,
) -> (Arc<RetryScheduler>, Arc<RecordingAlarm>, Arc<RecordingNotifier>) {
    let alarm = Arc::new(RecordingAlarm::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let mode = if connected {
        LeaseMode::Active
    } else {
        LeaseMode::Deferred
    };
    let scheduler = RetryScheduler::new(
        Arc::new(store.clone()),
        Arc::new(SimulatedConnectivity::new(true, mode)),
        alarm.clone(),
        notifier.clone(),
        Arc::new(DefaultRetryScheme::new(policy).expect("policy")),
        clock,
    );
    (Arc::new(scheduler), alarm, notifier)
}

#[tokio::test]
async fn failed_retrieve_schedules_first_retry() {
    let h = start_default();
    let uri = stored_notification(&h.store, LOCATION).await;
    let mut rx = h.handle.subscribe();

    h.handle
        .launch(TransactionBundle::stored(TransactionKind::Retrieve, uri))
        .expect("launch");
    let (_, _, state) = next_completion(&mut rx).await;
    assert!(state.is_failed());
    assert_eq!(state.content_uri, Some(uri));

    let alarm = h.alarm.clone();
    assert!(wait_until(move || {
        let alarm = alarm.clone();
        async move { !alarm.armed().is_empty() }
    })
    .await);
    assert_eq!(h.alarm.armed(), vec![START_MS + 60_000]);

    let row = h
        .store
        .pending_for(&uri)
        .await
        .expect("pending")
        .expect("row");
    assert_eq!(row.retry_index, 1);
    assert_eq!(row.error_type, ErrorType::Generic);
    assert_eq!(row.due_time, START_MS + 60_000);
    assert_eq!(row.last_try, START_MS);
    assert_eq!(
        h.store.download_state(&uri).await.expect("state"),
        Some(DownloadState::TransientFailure)
    );
    h.engine.shutdown().await;
}

#[tokio::test]
async fn retrieve_becomes_permanent_after_limit() {
    let policy = RetryPolicy {
        incoming_retry_limit: 3,
        ..RetryPolicy::default()
    };
    let h = start(
        core_config(),
        policy,
        SimulatedConnectivity::new(true, LeaseMode::Active),
    );
    let uri = stored_notification(&h.store, LOCATION).await;
    let thread_id = h.store.thread_id(&uri).await.expect("thread").expect("id");
    let mut rx = h.handle.subscribe();

    h.handle
        .launch(TransactionBundle::stored(TransactionKind::Retrieve, uri))
        .expect("launch");
    for (attempt, wait) in [(1u32, 60_000u64), (2, 5 * 60_000), (3, 0)] {
        let (_, _, state) = next_completion(&mut rx).await;
        assert!(state.is_failed());
        wait_idle(&mut rx).await;
        let store = &h.store;
        assert!(
            wait_until(move || async move {
                matches!(
                    store.pending_for(&uri).await,
                    Ok(Some(row)) if row.retry_index == attempt
                )
            })
            .await
        );
        if wait > 0 {
            h.clock.advance(wait);
            h.handle.scan().expect("scan");
        }
    }

    let row = h
        .store
        .pending_for(&uri)
        .await
        .expect("pending")
        .expect("row");
    assert_eq!(row.error_type, ErrorType::GenericPermanent);
    let notifier = h.notifier.clone();
    assert!(wait_until(move || {
        let notifier = notifier.clone();
        async move { notifier.count(&Notice::DownloadFailed(thread_id)) == 1 }
    })
    .await);
    assert_eq!(
        h.store.download_state(&uri).await.expect("state"),
        Some(DownloadState::PermanentFailure)
    );
    assert_eq!(h.mmsc.get_count(LOCATION).await, 3);

    h.clock.advance(60 * 60_000);
    h.handle.scan().expect("scan");
    wait_idle(&mut rx).await;
    assert_eq!(h.mmsc.get_count(LOCATION).await, 3);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn scan_skips_retrieve_rows_without_transient_error() {
    let h = start_default();
    let _uri = stored_notification(&h.store, LOCATION).await;
    let mut rx = h.handle.subscribe();

    h.handle.scan().expect("scan");
    wait_idle(&mut rx).await;
    assert_eq!(h.mmsc.get_count(LOCATION).await, 0);
    assert_eq!(h.connectivity.begins(), 0);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn alarm_follows_failed_download_past_untried_notification() {
    let h = start_default();
    let untried = "http://mmsc.test/get/untried";
    stored_notification(&h.store, untried).await;
    let failing = stored_notification(&h.store, LOCATION).await;
    let mut rx = h.handle.subscribe();

    h.handle
        .launch(TransactionBundle::stored(TransactionKind::Retrieve, failing))
        .expect("launch");
    let (_, _, state) = next_completion(&mut rx).await;
    assert!(state.is_failed());
    wait_idle(&mut rx).await;
    let alarm = h.alarm.clone();
    assert!(wait_until(move || {
        let alarm = alarm.clone();
        async move { !alarm.armed().is_empty() }
    })
    .await);
    assert_eq!(h.alarm.armed(), vec![START_MS + 60_000]);

    h.handle.scan().expect("scan");
    wait_idle(&mut rx).await;
    assert_eq!(h.alarm.armed(), vec![START_MS + 60_000, START_MS + 60_000]);
    assert_eq!(h.mmsc.get_count(untried).await, 0);

    h.clock.advance(60_000);
    h.handle.scan().expect("scan");
    let (_, kind, state) = next_completion(&mut rx).await;
    assert_eq!(kind, TransactionKind::Retrieve);
    assert_eq!(state.content_uri, Some(failing));
    assert_eq!(h.mmsc.get_count(LOCATION).await, 2);
    assert_eq!(h.mmsc.get_count(untried).await, 0);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn send_failure_past_limit_notifies_user() {
    let policy = RetryPolicy {
        outgoing_retry_limit: 1,
        ..RetryPolicy::default()
    };
    let h = start(
        core_config(),
        policy,
        SimulatedConnectivity::new(true, LeaseMode::Active),
    );
    let uri = outbox_send(&h.store, b"S1").await;
    h.mmsc.fail_next_posts(1).await;
    let mut rx = h.handle.subscribe();

    h.handle
        .launch(TransactionBundle::stored(TransactionKind::Send, uri))
        .expect("launch");
    let (_, _, state) = next_completion(&mut rx).await;
    assert!(state.is_failed());

    let notifier = h.notifier.clone();
    assert!(wait_until(move || {
        let notifier = notifier.clone();
        async move { notifier.count(&Notice::SendFailed(true)) == 1 }
    })
    .await);
    let row = h
        .store
        .pending_for(&uri)
        .await
        .expect("pending")
        .expect("row");
    assert_eq!(row.error_type, ErrorType::GenericPermanent);
    assert_eq!(row.due_time, START_MS);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn concurrent_failures_never_lose_an_attempt() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = InMemoryStore::new(clock.clone());
    let uri = stored_notification(&store, LOCATION).await;
    let (scheduler, _, _) = scheduler(&store, clock, true, RetryPolicy::default());

    let (a, b) = tokio::join!(scheduler.schedule_retry(&uri), scheduler.schedule_retry(&uri));
    let mut indexes = vec![
        a.expect("first").expect("row").retry_index,
        b.expect("second").expect("row").retry_index,
    ];
    indexes.sort();
    assert_eq!(indexes, vec![1, 2]);

    let row = store.pending_for(&uri).await.expect("pending").expect("row");
    assert_eq!(row.retry_index, 2);
    assert_eq!(row.due_time, START_MS + 5 * 60_000);
}

#[tokio::test]
async fn retry_index_only_grows() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = InMemoryStore::new(clock.clone());
    let uri = stored_notification(&store, LOCATION).await;
    let (scheduler, _, _) = scheduler(&store, clock.clone(), true, RetryPolicy::default());

    let mut last_index = 0;
    let mut last_due = 0;
    for _ in 0..4 {
        let row = scheduler
            .schedule_retry(&uri)
            .await
            .expect("schedule")
            .expect("row");
        assert!(row.retry_index > last_index);
        assert!(row.due_time >= last_due);
        last_index = row.retry_index;
        last_due = row.due_time;
        clock.advance(1_000);
    }
    assert_eq!(last_index, 4);
}

#[tokio::test]
async fn alarm_targets_earliest_pending_row() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = InMemoryStore::new(clock.clone());
    let later = stored_notification(&store, "http://mmsc.test/get/later").await;
    let sooner = outbox_send(&store, b"S2").await;
    let (scheduler, alarm, _) = scheduler(&store, clock.clone(), true, RetryPolicy::default());

    scheduler.schedule_retry(&later).await.expect("later");
    scheduler.schedule_retry(&later).await.expect("later again");
    scheduler.schedule_retry(&sooner).await.expect("sooner");

    let next = scheduler.arm_next_alarm().await.expect("arm");
    assert_eq!(next, Some(START_MS + 60_000));
    assert_eq!(alarm.armed(), vec![START_MS + 60_000]);
}

#[tokio::test]
async fn alarm_ignores_rows_a_scan_would_skip() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = InMemoryStore::new(clock.clone());
    let untried = stored_notification(&store, "http://mmsc.test/get/untried").await;
    let failing = stored_notification(&store, LOCATION).await;
    let (scheduler, alarm, _) = scheduler(&store, clock, true, RetryPolicy::default());

    scheduler.schedule_retry(&failing).await.expect("schedule");
    let row = store.pending_for(&untried).await.expect("pending").expect("row");
    assert_eq!(row.due_time, START_MS);
    assert!(!row.awaits_scan());

    assert_eq!(
        scheduler.arm_next_alarm().await.expect("arm"),
        Some(START_MS + 60_000)
    );
    assert_eq!(alarm.armed(), vec![START_MS + 60_000]);
}

#[tokio::test]
async fn alarm_horizon_limits_lookahead() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = InMemoryStore::new(clock.clone());
    let uri = stored_notification(&store, LOCATION).await;
    let (scheduler, alarm, _) = scheduler(&store, clock, true, RetryPolicy::default());
    let scheduler = Arc::new(
        Arc::try_unwrap(scheduler)
            .ok()
            .expect("unique scheduler")
            .with_alarm_horizon(Some(30_000)),
    );

    scheduler.schedule_retry(&uri).await.expect("schedule");
    assert_eq!(scheduler.arm_next_alarm().await.expect("arm"), None);
    assert!(alarm.armed().is_empty());
}

#[tokio::test]
async fn disconnected_failure_leaves_alarm_unarmed() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = InMemoryStore::new(clock.clone());
    let uri = stored_notification(&store, LOCATION).await;
    let (scheduler, alarm, _) = scheduler(&store, clock, false, RetryPolicy::default());

    scheduler
        .on_complete(&crate::state::TransactionState::failed(Some(uri)))
        .await;
    let row = store.pending_for(&uri).await.expect("pending").expect("row");
    assert_eq!(row.retry_index, 1);
    assert!(alarm.armed().is_empty());
}
