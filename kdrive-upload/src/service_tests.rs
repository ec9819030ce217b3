use super::*;
use crate::record::DEFAULT_RETRY_BUDGET;
use crate::test_support::{
    DRIVE_ID, Harness, RecordingNotifier, REMOTE_FILE_ID, TestProducer, USER_ID, api_error,
    eventually, mount_session_api, test_policy, write_source,
};
use crate::transfer::TransferKey;
use std::sync::Mutex as StdMutex;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, ResponseTemplate};

fn service(
    harness: &mut Harness,
    notifier: Arc<RecordingNotifier>,
    configure: impl FnOnce(UploadServiceBuilder) -> UploadServiceBuilder,
) -> Arc<UploadService> {
    let builder = UploadService::builder(
        Arc::clone(&harness.store),
        harness.client.clone(),
        harness.transfers.clone(),
        ScratchStore::new(harness.dir.path().join("scratch")),
    )
    .keep_alive(Arc::new(harness.keep_alive.clone()))
    .handoff(harness.handoff.clone())
    .storage(harness.storage.clone())
    .file_cache(harness.cache.clone())
    .notifier(notifier)
    .policy(test_policy())
    .auto_retry(false);
    let service = configure(builder).build();
    service.start(harness.completions.take().unwrap());
    service
}

/// A record with a real source file, not yet persisted.
fn upload(harness: &Harness, id: &str, parent: i64, len: usize) -> UploadRecord {
    let mut upload = crate::test_support::record(id, parent);
    upload.source = crate::record::UploadSource::Path(write_source(
        harness.dir.path(),
        &format!("{id}.bin"),
        len,
    ));
    upload.size = len as u64;
    upload
}

fn collect_uploaded(service: &UploadService) -> (Arc<StdMutex<Vec<FileUploaded>>>, crate::observe::Subscription) {
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = service
        .observers()
        .observe_file_uploaded(None, move |event| sink.lock().unwrap().push(event.clone()));
    (seen, subscription)
}

async fn mount_slow_chunks(harness: &Harness) {
    Mock::given(method("POST"))
        .and(path_regex(r"/chunk$"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .with_priority(1)
        .mount(&harness.server)
        .await;
}

#[tokio::test]
async fn uploads_and_reports_when_drained() {
    let mut harness = Harness::new().await;
    mount_session_api(&harness.server).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let service = service(&mut harness, notifier.clone(), |builder| builder);
    let (seen, _subscription) = collect_uploaded(&service);

    let record = upload(&harness, "a", 42, 5000);
    assert!(service.add_to_queue(record).await.unwrap());

    let store = Arc::clone(&harness.store);
    assert!(eventually(|| async { store.get("a").await.unwrap().is_none() }).await);
    assert!(eventually(|| async { notifier.events() == vec!["done:a.bin".to_string()] }).await);
    assert_eq!(harness.cache.merged(), vec![REMOTE_FILE_ID]);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].remote_file.as_ref().map(|file| file.id),
        Some(REMOTE_FILE_ID)
    );
    assert_eq!(service.operation_count(), 0);
}

#[tokio::test]
async fn adding_a_tracked_record_twice_is_a_no_op() {
    let mut harness = Harness::new().await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    service.suspend_all_operations();

    let record = upload(&harness, "a", 42, 2048);
    assert!(service.add_to_queue(record.clone()).await.unwrap());
    assert!(!service.add_to_queue(record).await.unwrap());

    assert_eq!(service.operation_count(), 1);
    let count = service
        .folder_upload_count(42, USER_ID, DRIVE_ID)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn records_of_another_context_are_not_admitted() {
    let mut harness = Harness::new().await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    service.suspend_all_operations();

    let record = upload(&harness, "a", 42, 2048).with_owner(ExecutionContext::Extension);
    assert!(!service.add_to_queue(record).await.unwrap());
    assert_eq!(service.operation_count(), 0);
}

#[tokio::test]
async fn cancelling_a_queued_upload_publishes_once() {
    let mut harness = Harness::new().await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    service.suspend_all_operations();
    let (seen, _subscription) = collect_uploaded(&service);

    assert!(service.add_to_queue(upload(&harness, "a", 42, 2048)).await.unwrap());
    assert!(service.cancel("a").await.unwrap());

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].record.error, Some(UploadErrorKind::TaskCancelled));
    assert!(seen[0].remote_file.is_none());
    assert!(!service.is_tracked("a"));
    assert!(harness.store.get("a").await.unwrap().is_none());
    assert_eq!(harness.received("POST", "/start").await, 0);
}

#[tokio::test]
async fn cancelling_a_running_upload_stops_its_transfers() {
    let mut harness = Harness::new().await;
    mount_session_api(&harness.server).await;
    mount_slow_chunks(&harness).await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    let (seen, _subscription) = collect_uploaded(&service);

    assert!(service.add_to_queue(upload(&harness, "a", 42, 5000)).await.unwrap());
    let transfers = harness.transfers.clone();
    assert!(eventually(|| async { transfers.inflight_count() > 0 }).await);

    assert!(service.cancel("a").await.unwrap());

    assert!(eventually(|| async { service.operation_count() == 0 }).await);
    assert!(eventually(|| async { transfers.inflight_count() == 0 }).await);
    assert!(harness.store.get("a").await.unwrap().is_none());
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_all_clears_one_folder_only() {
    let mut harness = Harness::new().await;
    mount_session_api(&harness.server).await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    service.suspend_all_operations();

    for id in ["a", "b", "c"] {
        assert!(service.add_to_queue(upload(&harness, id, 42, 2048)).await.unwrap());
    }
    assert!(service.add_to_queue(upload(&harness, "other", 43, 2048)).await.unwrap());

    let cancelled = service
        .cancel_all_operations(42, USER_ID, DRIVE_ID)
        .await
        .unwrap();

    assert_eq!(cancelled, 3);
    for id in ["a", "b", "c"] {
        assert!(!service.is_tracked(id));
    }
    let remaining = service
        .folder_upload_count(42, USER_ID, DRIVE_ID)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
    assert!(!service.queue(Lane::General).unwrap().is_suspended());
}

#[tokio::test]
async fn missing_destination_cancels_the_folder_and_disables_its_producer() {
    let mut harness = Harness::new().await;
    Mock::given(method("POST"))
        .and(path(format!("/3/drive/{DRIVE_ID}/upload/session/start")))
        .respond_with(api_error(404, "object_not_found"))
        .mount(&harness.server)
        .await;
    let notifier = Arc::new(RecordingNotifier::default());
    let service = service(&mut harness, notifier.clone(), |builder| builder.parallelism(1));
    let producer: Arc<dyn UploadProducer> = Arc::new(TestProducer::new(DRIVE_ID, 42));
    let unrelated: Arc<dyn UploadProducer> = Arc::new(TestProducer::new(DRIVE_ID, 43));
    service.register_producer(&producer);
    service.register_producer(&unrelated);

    service.suspend_all_operations();
    for id in ["a", "b", "c"] {
        assert!(service.add_to_queue(upload(&harness, id, 42, 2048)).await.unwrap());
    }
    service.resume_all_operations();

    let store = Arc::clone(&harness.store);
    assert!(
        eventually(|| async {
            store
                .count(&RecordFilter::in_parent(42, USER_ID, DRIVE_ID))
                .await
                .unwrap()
                == 0
        })
        .await
    );
    assert!(eventually(|| async { service.operation_count() == 0 }).await);
    assert!(eventually(|| async { notifier.events().contains(&"disabled:42".to_string()) }).await);
    assert!(!notifier.events().contains(&"disabled:43".to_string()));
}

#[tokio::test]
async fn quota_exceeded_suspends_every_lane() {
    let mut harness = Harness::new().await;
    Mock::given(method("POST"))
        .and(path(format!("/3/drive/{DRIVE_ID}/upload/session/start")))
        .respond_with(api_error(400, "quota_exceeded_error"))
        .mount(&harness.server)
        .await;
    let notifier = Arc::new(RecordingNotifier::default());
    let service = service(&mut harness, notifier.clone(), |builder| builder);

    assert!(service.add_to_queue(upload(&harness, "a", 42, 2048)).await.unwrap());

    assert!(eventually(|| async { notifier.events().contains(&"failed:1/1".to_string()) }).await);
    assert!(notifier.events().contains(&"quota".to_string()));
    for lane in Lane::ALL {
        assert!(service.queue(lane).unwrap().is_suspended());
    }
    let record = harness.store.get("a").await.unwrap().unwrap();
    assert_eq!(record.error, Some(UploadErrorKind::QuotaExceeded));
    assert_eq!(record.retry_budget, 0);
}

#[tokio::test]
async fn retryable_failure_is_queued_again_after_backoff() {
    let mut harness = Harness::new().await;
    Mock::given(method("POST"))
        .and(path(format!("/3/drive/{DRIVE_ID}/upload/session/start")))
        .respond_with(api_error(423, "lock_error"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&harness.server)
        .await;
    mount_session_api(&harness.server).await;
    let service = service(&mut harness, Arc::default(), |builder| {
        builder
            .auto_retry(true)
            .backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5), false))
    });

    assert!(service.add_to_queue(upload(&harness, "a", 42, 2048)).await.unwrap());

    let store = Arc::clone(&harness.store);
    assert!(eventually(|| async { store.get("a").await.unwrap().is_none() }).await);
    assert_eq!(harness.cache.merged(), vec![REMOTE_FILE_ID]);
    assert_eq!(harness.received("POST", "/start").await, 2);
}

#[tokio::test]
async fn exhausted_record_is_never_queued() {
    let mut harness = Harness::new().await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    service.suspend_all_operations();

    let mut record = upload(&harness, "a", 42, 2048);
    record.retry_budget = 0;
    assert!(!service.add_to_queue(record).await.unwrap());
    assert_eq!(service.rebuild_upload_queue().await.unwrap(), 0);
    assert_eq!(service.operation_count(), 0);
}

#[tokio::test]
async fn last_attempt_failing_retryably_is_not_retried() {
    let mut harness = Harness::new().await;
    Mock::given(method("POST"))
        .and(path(format!("/3/drive/{DRIVE_ID}/upload/session/start")))
        .respond_with(api_error(423, "lock_error"))
        .mount(&harness.server)
        .await;
    let service = service(&mut harness, Arc::default(), |builder| {
        builder
            .auto_retry(true)
            .backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5), false))
    });

    let mut record = upload(&harness, "a", 42, 2048);
    record.retry_budget = 1;
    assert!(service.add_to_queue(record).await.unwrap());

    let store = Arc::clone(&harness.store);
    assert!(
        eventually(|| async {
            store
                .get("a")
                .await
                .unwrap()
                .is_some_and(|record| record.error == Some(UploadErrorKind::Lock))
        })
        .await
    );
    assert!(eventually(|| async { service.operation_count() == 0 }).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.received("POST", "/start").await, 1);
    assert!(!service.is_tracked("a"));
    let record = harness.store.get("a").await.unwrap().unwrap();
    assert_eq!(record.retry_budget, 0);
}

#[tokio::test]
async fn late_retryable_error_leaves_exhausted_record_alone() {
    let mut harness = Harness::new().await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    service.suspend_all_operations();
    let mut record = upload(&harness, "spent", 42, 2048);
    record.retry_budget = 0;
    harness.store.insert(&record).await.unwrap();

    service
        .route_completion(orphan(
            "spent",
            TransferOutcome::Response {
                status: 423,
                body: error_body("lock_error"),
                retry_after: None,
            },
        ))
        .await;

    let spent = harness.store.get("spent").await.unwrap().unwrap();
    assert_eq!(spent.error, Some(UploadErrorKind::Lock));
    assert_eq!(spent.retry_budget, 0);
    assert!(!service.is_tracked("spent"));
    assert_eq!(service.operation_count(), 0);
}

#[tokio::test]
async fn rebuild_recovers_own_pending_records_without_tokens() {
    let mut harness = Harness::new().await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    service.suspend_all_operations();

    let mut stale = upload(&harness, "stale", 42, 2048);
    stale.session_token = Some("old".into());
    harness.store.insert(&stale).await.unwrap();
    let foreign = upload(&harness, "foreign", 42, 2048).with_owner(ExecutionContext::Extension);
    harness.store.insert(&foreign).await.unwrap();
    let mut spent = upload(&harness, "spent", 42, 2048);
    spent.retry_budget = 0;
    harness.store.insert(&spent).await.unwrap();

    assert_eq!(service.rebuild_upload_queue().await.unwrap(), 1);

    assert!(service.is_tracked("stale"));
    assert!(!service.is_tracked("foreign"));
    assert!(!service.is_tracked("spent"));
    let stale = harness.store.get("stale").await.unwrap().unwrap();
    assert_eq!(stale.session_token, None);
}

#[tokio::test]
async fn retry_all_restores_failed_records_of_a_folder() {
    let mut harness = Harness::new().await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    service.suspend_all_operations();

    let mut failed = upload(&harness, "failed", 42, 2048);
    failed.error = Some(UploadErrorKind::QuotaExceeded);
    failed.retry_budget = 0;
    harness.store.insert(&failed).await.unwrap();
    let mut elsewhere = upload(&harness, "elsewhere", 43, 2048);
    elsewhere.error = Some(UploadErrorKind::QuotaExceeded);
    elsewhere.retry_budget = 0;
    harness.store.insert(&elsewhere).await.unwrap();

    let retried = service
        .retry_all_operations(42, USER_ID, DRIVE_ID)
        .await
        .unwrap();

    assert_eq!(retried, 1);
    assert!(service.is_tracked("failed"));
    let failed = harness.store.get("failed").await.unwrap().unwrap();
    assert_eq!(failed.error, None);
    assert_eq!(failed.retry_budget, DEFAULT_RETRY_BUDGET);
    let elsewhere = harness.store.get("elsewhere").await.unwrap().unwrap();
    assert_eq!(elsewhere.retry_budget, 0);
}

#[tokio::test]
async fn cleaning_errors_keeps_server_decisions() {
    let mut harness = Harness::new().await;
    let service = service(&mut harness, Arc::default(), |builder| builder);

    let mut network = upload(&harness, "network", 42, 2048);
    network.error = Some(UploadErrorKind::NetworkError);
    harness.store.insert(&network).await.unwrap();
    let mut exists = upload(&harness, "exists", 42, 2048);
    exists.error = Some(UploadErrorKind::FileAlreadyExists);
    harness.store.insert(&exists).await.unwrap();

    assert_eq!(
        service
            .clean_network_and_local_errors_for_all_operations()
            .await
            .unwrap(),
        1
    );

    let network = harness.store.get("network").await.unwrap().unwrap();
    assert_eq!(network.error, None);
    let exists = harness.store.get("exists").await.unwrap().unwrap();
    assert_eq!(exists.error, Some(UploadErrorKind::FileAlreadyExists));
    assert_eq!(service.operation_count(), 0);
}

fn orphan(record_id: &str, outcome: TransferOutcome) -> TransferCompletion {
    TransferCompletion {
        key: TransferKey {
            record_id: record_id.into(),
            session_token: "gone".into(),
            chunk_number: 1,
            attempt: 0,
        },
        outcome,
    }
}

fn error_body(code: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "result": "error",
        "error": {"code": code, "description": code}
    }))
    .unwrap()
}

#[tokio::test]
async fn late_completions_reconcile_their_records() {
    let mut harness = Harness::new().await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    service.suspend_all_operations();
    for id in ["locked", "quota", "cancelled"] {
        harness
            .store
            .insert(&upload(&harness, id, 42, 2048))
            .await
            .unwrap();
    }

    service
        .route_completion(orphan(
            "locked",
            TransferOutcome::Response {
                status: 423,
                body: error_body("lock_error"),
                retry_after: None,
            },
        ))
        .await;
    service
        .route_completion(orphan(
            "quota",
            TransferOutcome::Response {
                status: 400,
                body: error_body("quota_exceeded_error"),
                retry_after: None,
            },
        ))
        .await;
    service
        .route_completion(orphan("cancelled", TransferOutcome::Cancelled))
        .await;
    service
        .route_completion(orphan("unknown", TransferOutcome::Interrupted))
        .await;

    let locked = harness.store.get("locked").await.unwrap().unwrap();
    assert_eq!(locked.error, Some(UploadErrorKind::Lock));
    assert!(service.is_tracked("locked"));

    let quota = harness.store.get("quota").await.unwrap().unwrap();
    assert_eq!(quota.error, Some(UploadErrorKind::QuotaExceeded));
    assert_eq!(quota.retry_budget, 0);
    assert!(!service.is_tracked("quota"));

    assert!(!service.is_tracked("cancelled"));
    assert_eq!(service.operation_count(), 1);
}

#[tokio::test]
async fn memory_pressure_requeues_running_uploads() {
    let mut harness = Harness::new().await;
    mount_session_api(&harness.server).await;
    mount_slow_chunks(&harness).await;
    let service = service(&mut harness, Arc::default(), |builder| builder);

    assert!(service.add_to_queue(upload(&harness, "a", 42, 5000)).await.unwrap());
    let transfers = harness.transfers.clone();
    assert!(eventually(|| async { transfers.inflight_count() > 0 }).await);

    assert_eq!(service.reschedule_running_operations().await, 1);

    assert_eq!(harness.handoff.calls(), 1);
    let store = Arc::clone(&harness.store);
    assert!(
        eventually(|| async {
            store.get("a").await.unwrap().is_some_and(|record| record.attempts() == 2)
        })
        .await
    );
    assert!(service.is_tracked("a"));
}

#[tokio::test]
async fn parallelism_is_shared_between_active_lanes() {
    let mut harness = Harness::new().await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    service.suspend_all_operations();
    service.parallelism_should_change(6);

    assert!(service.add_to_queue(upload(&harness, "a", 42, 2048)).await.unwrap());
    let general = service.queue(Lane::General).unwrap();
    let photos = service.queue(Lane::PhotoLibrary).unwrap();
    assert_eq!(general.parallelism(), 6);

    let photo = upload(&harness, "p", 42, 2048).with_lane(Lane::PhotoLibrary);
    assert!(service.add_to_queue(photo).await.unwrap());
    assert_eq!(general.parallelism(), 3);
    assert_eq!(photos.parallelism(), 3);
}

#[tokio::test]
async fn count_observers_follow_queue_changes() {
    let mut harness = Harness::new().await;
    let service = service(&mut harness, Arc::default(), |builder| builder);
    service.suspend_all_operations();
    let counts = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&counts);
    let _subscription = service
        .observers()
        .observe_folder_count(DRIVE_ID, 42, move |event| sink.lock().unwrap().push(event.count));

    assert!(service.add_to_queue(upload(&harness, "a", 42, 2048)).await.unwrap());
    assert!(service.add_to_queue(upload(&harness, "b", 42, 2048)).await.unwrap());
    service.cancel("a").await.unwrap();

    assert_eq!(*counts.lock().unwrap(), vec![1, 2, 1]);
}
