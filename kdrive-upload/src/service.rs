use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use kdrive_api::decode_response;
use reqwest::StatusCode;
use tokio::{
    sync::{RwLock, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::chunk::{ChunkPolicy, ScratchStore};
use crate::error::{UploadError, UploadErrorKind, classify_api_error};
use crate::host::{
    AssetResolver, DriveFileCache, NoAssetResolver, NoFileCache, SilentNotifier, StorageSpace,
    UnboundedStorage, UploadNotifier, UploadProducer,
};
use crate::keepalive::{BackgroundHandoff, KeepAlive, NoHandoff, NoKeepAlive};
use crate::notify::NotificationTracker;
use crate::observe::{CountChanged, CountScope, FileUploaded, ObserverHub};
use crate::operation::{
    DEFAULT_CHUNK_PARALLELISM, ExpireReason, OperationDeps, OperationOutcome, OperationReport,
};
use crate::parallelism::{MEDIUM_PARALLELISM, split_among_lanes};
use crate::queue::{CancelResult, QueueEvent, UploadQueue};
use crate::record::{Destination, ExecutionContext, Lane, UploadRecord};
use crate::session::{SessionCache, UploadSessionClient};
use crate::store::{BATCH_SIZE, RecordFilter, RecordState, RecordStore};
use crate::transfer::{CompletionReceiver, TransferCompletion, TransferExecutor, TransferOutcome};

pub struct UploadServiceBuilder {
    store: Arc<RecordStore>,
    sessions: Arc<dyn UploadSessionClient>,
    transfers: Arc<dyn TransferExecutor>,
    scratch: ScratchStore,
    keep_alive: Arc<dyn KeepAlive>,
    handoff: Arc<dyn BackgroundHandoff>,
    assets: Arc<dyn AssetResolver>,
    storage: Arc<dyn StorageSpace>,
    file_cache: Arc<dyn DriveFileCache>,
    notifier: Arc<dyn UploadNotifier>,
    policy: ChunkPolicy,
    chunk_parallelism: usize,
    parallelism: usize,
    context: ExecutionContext,
    auto_retry: bool,
    backoff: Backoff,
}

impl UploadServiceBuilder {
    pub fn keep_alive(mut self, keep_alive: Arc<dyn KeepAlive>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn handoff(mut self, handoff: Arc<dyn BackgroundHandoff>) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn assets(mut self, assets: Arc<dyn AssetResolver>) -> Self {
        self.assets = assets;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageSpace>) -> Self {
        self.storage = storage;
        self
    }

    pub fn file_cache(mut self, file_cache: Arc<dyn DriveFileCache>) -> Self {
        self.file_cache = file_cache;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn UploadNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn policy(mut self, policy: ChunkPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn chunk_parallelism(mut self, chunk_parallelism: usize) -> Self {
        self.chunk_parallelism = chunk_parallelism.max(1);
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn auto_retry(mut self, auto_retry: bool) -> Self {
        self.auto_retry = auto_retry;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn build(self) -> Arc<UploadService> {
        let session_cache = SessionCache::new();
        let deps = Arc::new(OperationDeps {
            store: Arc::clone(&self.store),
            sessions: Arc::clone(&self.sessions),
            transfers: Arc::clone(&self.transfers),
            scratch: self.scratch,
            keep_alive: self.keep_alive,
            handoff: self.handoff,
            assets: self.assets,
            storage: self.storage,
            file_cache: self.file_cache,
            session_cache: session_cache.clone(),
            policy: self.policy,
            chunk_parallelism: self.chunk_parallelism,
            context: self.context,
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let lanes = Lane::ALL
            .into_iter()
            .map(|lane| {
                let limit = split_among_lanes(self.parallelism, 1, lane == Lane::General);
                (
                    lane,
                    UploadQueue::new(lane, Arc::clone(&deps), limit, events_tx.clone()),
                )
            })
            .collect();

        Arc::new(UploadService {
            store: self.store,
            sessions: self.sessions,
            transfers: self.transfers,
            session_cache,
            notifier: self.notifier,
            context: self.context,
            lanes,
            observers: ObserverHub::new(),
            notifications: Mutex::new(NotificationTracker::new(self.context)),
            producers: Mutex::new(Vec::new()),
            rebuild: RwLock::new(()),
            parallelism: AtomicUsize::new(self.parallelism),
            auto_retry: self.auto_retry,
            backoff: self.backoff,
            events: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Owns the upload lanes of one execution context and everything that
/// reacts to finished operations.
pub struct UploadService {
    store: Arc<RecordStore>,
    sessions: Arc<dyn UploadSessionClient>,
    transfers: Arc<dyn TransferExecutor>,
    session_cache: SessionCache,
    notifier: Arc<dyn UploadNotifier>,
    context: ExecutionContext,
    lanes: BTreeMap<Lane, Arc<UploadQueue>>,
    observers: ObserverHub,
    notifications: Mutex<NotificationTracker>,
    producers: Mutex<Vec<Weak<dyn UploadProducer>>>,
    /// Held exclusively while the queue is rebuilt so no user upload starts
    /// ahead of recovered ones.
    rebuild: RwLock<()>,
    parallelism: AtomicUsize,
    auto_retry: bool,
    backoff: Backoff,
    events: Mutex<Option<mpsc::UnboundedReceiver<QueueEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for UploadService {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

impl UploadService {
    pub fn builder(
        store: Arc<RecordStore>,
        sessions: Arc<dyn UploadSessionClient>,
        transfers: Arc<dyn TransferExecutor>,
        scratch: ScratchStore,
    ) -> UploadServiceBuilder {
        UploadServiceBuilder {
            store,
            sessions,
            transfers,
            scratch,
            keep_alive: Arc::new(NoKeepAlive),
            handoff: Arc::new(NoHandoff),
            assets: Arc::new(NoAssetResolver),
            storage: Arc::new(UnboundedStorage),
            file_cache: Arc::new(NoFileCache),
            notifier: Arc::new(SilentNotifier),
            policy: ChunkPolicy::default(),
            chunk_parallelism: DEFAULT_CHUNK_PARALLELISM,
            parallelism: MEDIUM_PARALLELISM,
            context: ExecutionContext::App,
            auto_retry: true,
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(10), true),
        }
    }

    /// Spawns the queue-event loop and the transfer completion router.
    pub fn start(self: &Arc<Self>, mut completions: CompletionReceiver) {
        let Some(mut events) = self.events.lock().ok().and_then(|mut events| events.take()) else {
            warn!("upload service already started");
            return;
        };

        let service = Arc::downgrade(self);
        let event_loop = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.handle_event(event).await;
            }
        });

        let service = Arc::downgrade(self);
        let router = tokio::spawn(async move {
            while let Some(completion) = completions.recv().await {
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.route_completion(completion).await;
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(event_loop);
            tasks.push(router);
        }
    }

    pub fn observers(&self) -> &ObserverHub {
        &self.observers
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn queue(&self, lane: Lane) -> Option<&Arc<UploadQueue>> {
        self.lanes.get(&lane)
    }

    /// Persists `record` if it is new and admits it. A second call for a
    /// record already tracked is a no-op.
    pub async fn add_to_queue(&self, record: UploadRecord) -> Result<bool, UploadError> {
        let _rebuild = self.rebuild.read().await;
        if record.owner != self.context {
            debug!(record_id = %record.id, "record belongs to another context");
            return Ok(false);
        }
        let record = match self.store.get(&record.id).await? {
            Some(stored) => stored,
            None => {
                self.store.insert(&record).await?;
                record
            }
        };
        let admitted = self.admit(&record);
        if admitted {
            self.publish_counts(record.destination).await;
        }
        Ok(admitted)
    }

    pub fn suspend_all_operations(&self) {
        for queue in self.lanes.values() {
            queue.suspend();
        }
    }

    pub fn resume_all_operations(&self) {
        if let Ok(mut notifications) = self.notifications.lock() {
            notifications.rearm_paused();
        }
        for queue in self.lanes.values() {
            queue.resume();
        }
    }

    /// Stops and forgets one upload. Observers see a single cancelled event.
    pub async fn cancel(&self, record_id: &str) -> Result<bool, UploadError> {
        let record = self.store.get(record_id).await?;
        let mut running = false;
        for queue in self.lanes.values() {
            if queue.cancel(record_id) == CancelResult::Running {
                running = true;
            }
        }
        let Some(mut record) = record else {
            return Ok(running);
        };

        self.store.delete(record_id).await?;
        self.session_cache.remove(record_id);
        if !running {
            if let Some(token) = &record.session_token {
                if let Err(err) = self
                    .sessions
                    .cancel_session(record.destination.drive_id, token)
                    .await
                {
                    debug!(record_id, error = %err, "failed to cancel remote session");
                }
            }
        }
        info!(record_id, "upload cancelled");

        record.error = Some(UploadErrorKind::TaskCancelled);
        self.observers.publish_file_uploaded(&FileUploaded {
            record: record.clone(),
            remote_file: None,
        });
        self.publish_counts(record.destination).await;
        Ok(true)
    }

    /// Removes every upload into `parent`, queued or running.
    pub async fn cancel_all_operations(
        &self,
        parent_directory_id: i64,
        user_id: i64,
        drive_id: i64,
    ) -> Result<usize, UploadError> {
        self.suspend_all_operations();
        let filter = RecordFilter::in_parent(parent_directory_id, user_id, drive_id);
        let deleted = self.store.delete_matching(&filter).await;
        let deleted = match deleted {
            Ok(deleted) => deleted,
            Err(err) => {
                self.resume_all_operations();
                return Err(err.into());
            }
        };
        for record_id in &deleted {
            self.session_cache.remove(record_id);
            for queue in self.lanes.values() {
                queue.cancel(record_id);
            }
        }
        self.resume_all_operations();
        info!(
            parent_directory_id,
            drive_id,
            count = deleted.len(),
            "cancelled uploads in folder"
        );
        self.publish_counts(Destination {
            parent_directory_id,
            drive_id,
            user_id,
        })
        .await;
        Ok(deleted.len())
    }

    pub async fn retry(&self, record_id: &str) -> Result<bool, UploadError> {
        self.store
            .clear_errors_for_retry(&[record_id.to_string()])
            .await?;
        let Some(record) = self.store.get(record_id).await? else {
            return Ok(false);
        };
        Ok(self.admit(&record))
    }

    /// Clears errors of failed uploads into `parent` and queues them again.
    pub async fn retry_all_operations(
        &self,
        parent_directory_id: i64,
        user_id: i64,
        drive_id: i64,
    ) -> Result<usize, UploadError> {
        let filter = RecordFilter::in_parent(parent_directory_id, user_id, drive_id)
            .owned_by(self.context)
            .with_state(RecordState::Failed);
        let ids = self.store.list_ids(&filter).await?;
        let mut admitted = 0;
        for batch in ids.chunks(BATCH_SIZE) {
            self.store.clear_errors_for_retry(batch).await?;
            for record_id in batch {
                if let Some(record) = self.store.get(record_id).await? {
                    if self.admit(&record) {
                        admitted += 1;
                    }
                }
            }
        }
        info!(parent_directory_id, drive_id, admitted, "retrying failed uploads");
        Ok(admitted)
    }

    /// Clears errors that better conditions may fix. Records are picked up by
    /// the next rebuild or retry.
    pub async fn clean_network_and_local_errors_for_all_operations(
        &self,
    ) -> Result<u64, UploadError> {
        let ids = self
            .store
            .ids_with_errors(self.context, &UploadErrorKind::NETWORK_AND_LOCAL)
            .await?;
        let cleaned = self.store.clear_errors_for_retry(&ids).await?;
        info!(cleaned, "cleaned network and local upload errors");
        Ok(cleaned)
    }

    /// Recovery after launch: forgets stale session tokens and queues every
    /// pending record owned by this context before any new upload proceeds.
    pub async fn rebuild_upload_queue(&self) -> Result<usize, UploadError> {
        let _rebuild = self.rebuild.write().await;
        self.store.clear_session_tokens(self.context).await?;
        let filter = RecordFilter::default()
            .owned_by(self.context)
            .with_state(RecordState::Retryable);
        let records = self.store.list(&filter).await?;
        let mut admitted = 0;
        for batch in records.chunks(BATCH_SIZE) {
            for record in batch {
                if self.admit(record) {
                    admitted += 1;
                }
            }
            tokio::task::yield_now().await;
        }
        info!(admitted, context = self.context.as_str(), "upload queue rebuilt");
        Ok(admitted)
    }

    /// Applies a new global concurrency budget to every lane.
    pub fn parallelism_should_change(&self, value: usize) {
        self.parallelism.store(value.max(1), Ordering::Relaxed);
        self.rebalance_parallelism();
    }

    /// Memory pressure: stops running uploads now; records that are not
    /// handed off are queued again when their reports arrive.
    pub async fn reschedule_running_operations(&self) -> usize {
        let running: Vec<_> = self
            .lanes
            .values()
            .flat_map(|queue| queue.running_operations())
            .collect();
        let mut expired = 0;
        for operation in running {
            if operation.expire(ExpireReason::MemoryPressure).await {
                expired += 1;
            }
        }
        info!(expired, "rescheduled running uploads");
        expired
    }

    /// Keeps a weak reference; dropped producers are forgotten.
    pub fn register_producer(&self, producer: &Arc<dyn UploadProducer>) {
        if let Ok(mut producers) = self.producers.lock() {
            producers.retain(|producer| producer.strong_count() > 0);
            producers.push(Arc::downgrade(producer));
        }
    }

    pub async fn reconnect_transfers(&self) -> Result<usize, UploadError> {
        Ok(self.transfers.reconnect().await?)
    }

    pub async fn folder_upload_count(
        &self,
        parent_directory_id: i64,
        user_id: i64,
        drive_id: i64,
    ) -> Result<u64, UploadError> {
        let filter = RecordFilter::in_parent(parent_directory_id, user_id, drive_id)
            .with_state(RecordState::Pending);
        Ok(self.store.count(&filter).await?)
    }

    pub async fn drive_upload_count(&self, user_id: i64, drive_id: i64) -> Result<u64, UploadError> {
        let filter = RecordFilter::in_drive(user_id, drive_id).with_state(RecordState::Pending);
        Ok(self.store.count(&filter).await?)
    }

    pub fn operation_count(&self) -> usize {
        self.lanes.values().map(|queue| queue.tracked_count()).sum()
    }

    pub fn running_count(&self) -> usize {
        self.lanes.values().map(|queue| queue.running_count()).sum()
    }

    pub fn is_tracked(&self, record_id: &str) -> bool {
        self.lanes.values().any(|queue| queue.is_tracked(record_id))
    }

    fn admit(&self, record: &UploadRecord) -> bool {
        if record.owner != self.context {
            return false;
        }
        let Some(queue) = self.lanes.get(&record.lane) else {
            return false;
        };
        let admitted = queue.add(record);
        if admitted {
            self.rebalance_parallelism();
        }
        admitted
    }

    fn rebalance_parallelism(&self) {
        let value = self.parallelism.load(Ordering::Relaxed);
        let active: Vec<bool> = self
            .lanes
            .values()
            .map(|queue| queue.tracked_count() > 0)
            .collect();
        let active_lanes = active.iter().filter(|active| **active).count();
        for (queue, lane_active) in self.lanes.values().zip(active) {
            queue.set_parallelism(split_among_lanes(value, active_lanes, lane_active));
        }
    }

    async fn handle_event(self: &Arc<Self>, event: QueueEvent) {
        let QueueEvent::Finished { lane, report } = event;
        debug!(lane = lane.as_str(), record_id = %report.record_id, outcome = ?report.outcome, "upload operation finished");

        if let Some(record) = &report.record {
            if let Ok(mut notifications) = self.notifications.lock() {
                notifications.record_outcome(record, report.outcome.error_kind());
            }
            match &report.outcome {
                OperationOutcome::Uploaded { remote_file } => {
                    self.observers.publish_file_uploaded(&FileUploaded {
                        record: record.clone(),
                        remote_file: Some(remote_file.clone()),
                    });
                }
                OperationOutcome::Failed { kind, .. } => {
                    let mut record = record.clone();
                    record.error = Some(*kind);
                    self.observers.publish_file_uploaded(&FileUploaded {
                        record,
                        remote_file: None,
                    });
                }
                OperationOutcome::Cancelled | OperationOutcome::Rescheduled { .. } => {}
            }
            self.publish_counts(record.destination).await;
        }

        match &report.outcome {
            OperationOutcome::Failed { kind, retry_after } => {
                self.handle_failure(&report, *kind, *retry_after).await;
            }
            OperationOutcome::Rescheduled {
                handed_off_to: None,
                reason: ExpireReason::Deadline,
            } => {
                if let Ok(mut notifications) = self.notifications.lock() {
                    notifications.paused(self.notifier.as_ref());
                }
            }
            OperationOutcome::Rescheduled {
                handed_off_to: None,
                reason: ExpireReason::MemoryPressure,
            } => {
                if let Some(record) = self.store.get(&report.record_id).await.ok().flatten() {
                    self.admit(&record);
                }
            }
            OperationOutcome::Rescheduled { .. }
            | OperationOutcome::Uploaded { .. }
            | OperationOutcome::Cancelled => {}
        }

        if self.operation_count() == 0 {
            if let Ok(mut notifications) = self.notifications.lock() {
                notifications.drained(self.notifier.as_ref());
            }
        }
        self.rebalance_parallelism();
    }

    async fn handle_failure(
        self: &Arc<Self>,
        report: &OperationReport,
        kind: UploadErrorKind,
        retry_after: Option<Duration>,
    ) {
        let handling = kind.handling();
        if handling.suspend_all {
            warn!(kind = kind.as_str(), "suspending all uploads");
            self.suspend_all_operations();
            match kind {
                UploadErrorKind::NotEnoughLocalStorage => self.notifier.not_enough_space(),
                UploadErrorKind::QuotaExceeded => self.notifier.quota_exceeded(),
                _ => {}
            }
        }

        let Some(record) = &report.record else {
            return;
        };
        if handling.cascade {
            let destination = record.destination;
            warn!(
                parent_directory_id = destination.parent_directory_id,
                "upload destination is gone, cancelling its uploads"
            );
            if let Err(err) = self
                .cancel_all_operations(
                    destination.parent_directory_id,
                    destination.user_id,
                    destination.drive_id,
                )
                .await
            {
                warn!(error = %err, "failed to cancel uploads of a missing folder");
            }
            self.disable_producers(destination);
            return;
        }

        if handling.retryable && self.auto_retry && record.can_retry() {
            self.schedule_retry(record.id.clone(), record.attempts(), retry_after);
        }
    }

    fn schedule_retry(self: &Arc<Self>, record_id: String, attempts: u32, hint: Option<Duration>) {
        let delay = self.backoff.delay_for(attempts, hint);
        debug!(record_id = %record_id, attempts, delay_ms = delay.as_millis() as u64, "retry scheduled");
        let service = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(service) = service.upgrade() else {
                return;
            };
            match service.store.get(&record_id).await {
                Ok(Some(record)) => {
                    service.admit(&record);
                }
                Ok(None) => {}
                Err(err) => warn!(record_id = %record_id, error = %err, "failed to load record for retry"),
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|task| !task.is_finished());
            tasks.push(task);
        }
    }

    fn disable_producers(&self, destination: Destination) {
        let producers: Vec<Arc<dyn UploadProducer>> = self
            .producers
            .lock()
            .map(|producers| producers.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default();
        let mut disabled = false;
        for producer in producers {
            if producer.target() == Some((destination.drive_id, destination.parent_directory_id)) {
                producer.disable();
                disabled = true;
            }
        }
        if disabled {
            self.notifier.producer_disabled(destination);
        }
    }

    /// Delivers a completion to its live operation or reconciles the record
    /// it belongs to.
    async fn route_completion(&self, completion: TransferCompletion) {
        let mut completion = completion;
        for queue in self.lanes.values() {
            if let Some(operation) = queue.operation(&completion.key.record_id) {
                match operation.deliver(completion) {
                    Ok(()) => return,
                    Err(returned) => completion = returned,
                }
            }
        }
        self.reconcile_orphan(completion).await;
    }

    async fn reconcile_orphan(&self, completion: TransferCompletion) {
        let record_id = completion.key.record_id.clone();
        let failure = match &completion.outcome {
            TransferOutcome::Cancelled => return,
            TransferOutcome::Response {
                status,
                body,
                retry_after,
            } => StatusCode::from_u16(*status).ok().and_then(|status| {
                decode_response::<serde_json::Value>(status, body, *retry_after)
                    .err()
                    .map(|err| classify_api_error(&err))
            }),
            TransferOutcome::Interrupted | TransferOutcome::Failed(_) => None,
        };
        debug!(record_id = %record_id, transfer = %completion.key, "completion without a live operation");

        let record = match failure {
            Some(kind) => {
                let handling = kind.handling();
                self.store
                    .update(&record_id, move |record| {
                        if record.is_pending() {
                            record.error = Some(kind);
                            if handling.zero_budget {
                                record.retry_budget = 0;
                            }
                        }
                    })
                    .await
            }
            None => self.store.get(&record_id).await,
        };
        let record = match record {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!(record_id = %record_id, error = %err, "failed to reconcile completion");
                return;
            }
        };
        let retryable = record.error.is_none_or(|kind| kind.handling().retryable);
        if retryable && self.admit(&record) {
            info!(record_id = %record_id, "re-created upload from a late completion");
        }
    }

    async fn publish_counts(&self, destination: Destination) {
        let folder = self
            .folder_upload_count(
                destination.parent_directory_id,
                destination.user_id,
                destination.drive_id,
            )
            .await;
        let drive = self
            .drive_upload_count(destination.user_id, destination.drive_id)
            .await;
        if let Ok(count) = folder {
            self.observers.publish_count(&CountChanged {
                scope: CountScope::Folder {
                    drive_id: destination.drive_id,
                    parent_directory_id: destination.parent_directory_id,
                },
                count,
            });
        }
        if let Ok(count) = drive {
            self.observers.publish_count(&CountChanged {
                scope: CountScope::Drive {
                    drive_id: destination.drive_id,
                },
                count,
            });
        }
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
