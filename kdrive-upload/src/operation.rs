use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
};

use kdrive_api::{
    ApiErrorCode, ChunkParams, ChunkRequest, DirectUploadRequest, RemoteFile, StartSessionRequest,
    UploadedChunk, decode_response,
};
use reqwest::StatusCode;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunk::{ByteRange, ChunkPolicy, ScratchStore, compute_ranges, read_chunk};
use crate::error::{UploadError, UploadErrorKind};
use crate::host::{AssetResolver, DriveFileCache, StorageSpace};
use crate::keepalive::{BackgroundHandoff, KeepAlive};
use crate::record::{ExecutionContext, UploadRecord, UploadSource, now_unix};
use crate::session::{SessionCache, SourceIdentity, UploadSession, UploadSessionClient};
use crate::store::RecordStore;
use crate::transfer::{
    TransferCompletion, TransferExecutor, TransferHandle, TransferKey, TransferOutcome,
};

/// Client-side cancellations of one chunk tolerated before giving up.
pub const MAX_CHUNK_REDISPATCH: u32 = 3;
pub const DEFAULT_CHUNK_PARALLELISM: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Init,
    Startup,
    FetchingSession,
    Chunking,
    SchedulingUpload,
    Terminated,
    Cancelled,
}

impl OperationState {
    pub fn is_final(&self) -> bool {
        matches!(self, OperationState::Terminated | OperationState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireReason {
    /// The keep-alive lease ran out.
    Deadline,
    MemoryPressure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Uploaded {
        remote_file: RemoteFile,
    },
    Cancelled,
    Rescheduled {
        handed_off_to: Option<ExecutionContext>,
        reason: ExpireReason,
    },
    Failed {
        kind: UploadErrorKind,
        retry_after: Option<std::time::Duration>,
    },
}

impl OperationOutcome {
    /// Error kind as persisted on the record.
    pub fn error_kind(&self) -> Option<UploadErrorKind> {
        match self {
            OperationOutcome::Uploaded { .. } => None,
            OperationOutcome::Cancelled => Some(UploadErrorKind::TaskCancelled),
            OperationOutcome::Rescheduled { .. } => Some(UploadErrorKind::TaskRescheduled),
            OperationOutcome::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// Final word of an operation. `record` is the last known snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationReport {
    pub record_id: String,
    pub record: Option<UploadRecord>,
    pub outcome: OperationOutcome,
}

/// Everything an operation talks to.
#[derive(Clone)]
pub struct OperationDeps {
    pub store: Arc<RecordStore>,
    pub sessions: Arc<dyn UploadSessionClient>,
    pub transfers: Arc<dyn TransferExecutor>,
    pub scratch: ScratchStore,
    pub keep_alive: Arc<dyn KeepAlive>,
    pub handoff: Arc<dyn BackgroundHandoff>,
    pub assets: Arc<dyn AssetResolver>,
    pub storage: Arc<dyn StorageSpace>,
    pub file_cache: Arc<dyn DriveFileCache>,
    pub session_cache: SessionCache,
    pub policy: ChunkPolicy,
    pub chunk_parallelism: usize,
    pub context: ExecutionContext,
}

enum Termination {
    Finished(Result<RemoteFile, UploadError>),
    Expired(ExpireReason),
}

struct InflightChunk {
    key: TransferKey,
    request: ChunkRequest,
    path: PathBuf,
}

/// Uploads one record. `run` drives the attempt; `expire` and `cancel` may
/// race with it from other tasks. Whichever reaches [`Self::finish`] first
/// writes the terminal state, the others get the same report back.
pub struct UploadOperation {
    record_id: String,
    deps: Arc<OperationDeps>,
    state: StdMutex<OperationState>,
    snapshot: StdMutex<Option<UploadRecord>>,
    session: StdMutex<Option<UploadSession>>,
    inflight: StdMutex<HashMap<TransferKey, TransferHandle>>,
    finalizing: AtomicBool,
    finalizer: Mutex<Option<OperationReport>>,
    cancel: CancellationToken,
    terminated: CancellationToken,
    inbox_tx: mpsc::UnboundedSender<TransferCompletion>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<TransferCompletion>>,
}

impl UploadOperation {
    pub fn new(record_id: impl Into<String>, deps: Arc<OperationDeps>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            record_id: record_id.into(),
            deps,
            state: StdMutex::new(OperationState::Init),
            snapshot: StdMutex::new(None),
            session: StdMutex::new(None),
            inflight: StdMutex::new(HashMap::new()),
            finalizing: AtomicBool::new(false),
            finalizer: Mutex::new(None),
            cancel: CancellationToken::new(),
            terminated: CancellationToken::new(),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
        }
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn state(&self) -> OperationState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(OperationState::Terminated)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Cooperative: the attempt stops at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Forces the attempt to stop and reschedule. Returns `true` when this
    /// call performed the terminal transition.
    pub async fn expire(&self, reason: ExpireReason) -> bool {
        let (_, finalized) = self.finish(Termination::Expired(reason)).await;
        finalized
    }

    /// Hands a transfer completion to the running attempt. Gives it back
    /// when the operation has already terminated.
    pub fn deliver(&self, completion: TransferCompletion) -> Result<(), TransferCompletion> {
        if self.terminated.is_cancelled() || self.finalizing.load(Ordering::Acquire) {
            return Err(completion);
        }
        self.inbox_tx.send(completion).map_err(|err| err.0)
    }

    pub async fn run(self: Arc<Self>) -> OperationReport {
        let lease = self
            .deps
            .keep_alive
            .begin(&format!("upload:{}", self.record_id));

        let termination = tokio::select! {
            biased;
            _ = self.terminated.cancelled() => None,
            _ = self.cancel.cancelled() => {
                Some(Termination::Finished(Err(UploadErrorKind::TaskCancelled.into())))
            }
            _ = lease.expiration().cancelled() => Some(Termination::Expired(ExpireReason::Deadline)),
            result = self.drive() => Some(Termination::Finished(result)),
        };

        let report = match termination {
            Some(termination) => self.finish(termination).await.0,
            None => self.report().await,
        };
        drop(lease);
        report
    }

    async fn report(&self) -> OperationReport {
        let finalized = self.finalizer.lock().await;
        finalized.clone().unwrap_or_else(|| OperationReport {
            record_id: self.record_id.clone(),
            record: self.snapshot(),
            outcome: OperationOutcome::Cancelled,
        })
    }

    async fn drive(&self) -> Result<RemoteFile, UploadError> {
        self.set_state(OperationState::Startup);
        self.check_cancelled()?;

        let record = self
            .deps
            .store
            .get(&self.record_id)
            .await?
            .ok_or(UploadErrorKind::DatabaseRecordMissing)?;
        self.remember(record.clone());

        let reserve = self.deps.chunk_parallelism as u64 * self.deps.policy.max_chunk_size;
        if !self.deps.storage.has_room_for(self.deps.scratch.root(), reserve) {
            return Err(UploadErrorKind::NotEnoughLocalStorage.into());
        }
        if record.retry_budget == 0 {
            return Err(UploadErrorKind::RetryBudgetExhausted.into());
        }
        let record = self
            .write(|record| {
                record.error = None;
                record.retry_budget = record.retry_budget.saturating_sub(1);
            })
            .await?;
        info!(
            record_id = %self.record_id,
            name = %record.name,
            budget = record.retry_budget,
            "upload attempt started"
        );

        let source = self.resolve_source(&record).await?;
        let identity = tokio::fs::metadata(&source)
            .await
            .map(|metadata| SourceIdentity::of(&metadata))
            .map_err(|err| {
                warn!(record_id = %self.record_id, error = %err, "upload source is unreadable");
                UploadErrorKind::FileNotFound
            })?;
        let size = identity.size;

        if size == 0 {
            return self.upload_empty(&record).await;
        }
        let ranges = compute_ranges(size, &self.deps.policy)?;

        self.set_state(OperationState::FetchingSession);
        let (session, uploaded) = self
            .negotiate(&record, identity, ranges.len() as u64)
            .await?;
        self.write({
            let token = session.token().to_string();
            move |record| {
                record.session_token = Some(token);
                record.size = size;
            }
        })
        .await?;
        if let Ok(mut current) = self.session.lock() {
            *current = Some(session.clone());
        }

        self.upload_chunks(&record, &source, &session, ranges, &uploaded)
            .await?;

        self.set_state(OperationState::SchedulingUpload);
        self.check_cancelled()?;
        let uploaded = self
            .deps
            .sessions
            .close_session(record.destination.drive_id, session.token())
            .await?;
        Ok(uploaded.file)
    }

    async fn resolve_source(&self, record: &UploadRecord) -> Result<PathBuf, UploadError> {
        match &record.source {
            UploadSource::Path(path) => Ok(path.clone()),
            UploadSource::Asset(asset_id) => self
                .deps
                .assets
                .materialize(asset_id, &record.id)
                .await
                .map_err(|err| {
                    warn!(record_id = %record.id, asset_id = %asset_id, error = %err, "failed to materialize asset");
                    UploadError::from(UploadErrorKind::FileNotFound)
                }),
        }
    }

    async fn upload_empty(&self, record: &UploadRecord) -> Result<RemoteFile, UploadError> {
        self.set_state(OperationState::SchedulingUpload);
        let request = DirectUploadRequest {
            conflict: record.conflict,
            directory_id: record.destination.parent_directory_id,
            file_name: record.name.clone(),
            last_modified_at: record.last_modified_at,
        };
        debug!(record_id = %record.id, "uploading empty file directly");
        Ok(self
            .deps
            .sessions
            .direct_upload(record.destination.drive_id, &request, Vec::new())
            .await?)
    }

    /// Continues the session of an earlier attempt when it is still valid
    /// for the same source, otherwise opens a new one. Returns the session
    /// and the chunks the server already holds.
    async fn negotiate(
        &self,
        record: &UploadRecord,
        source: SourceIdentity,
        total_chunks: u64,
    ) -> Result<(UploadSession, BTreeSet<u64>), UploadError> {
        let drive_id = record.destination.drive_id;
        let cache = &self.deps.session_cache;
        if let Some(cached) = cache.get(&record.id) {
            if cached.resumable_for(&source, record.session_token.as_deref())
                && cached.session.total_chunks == total_chunks
            {
                info!(
                    record_id = %record.id,
                    uploaded = cached.uploaded.len(),
                    chunks = total_chunks,
                    "resuming upload session"
                );
                return Ok((cached.session, cached.uploaded));
            }
            cache.remove(&record.id);
            if cached.source != source {
                info!(record_id = %record.id, "upload source changed since its session was opened");
            }
            if record.session_token.as_deref() != Some(cached.session.token()) {
                self.cancel_remote_session(drive_id, cached.session.token())
                    .await;
            }
        }
        if let Some(stale) = &record.session_token {
            self.cancel_remote_session(drive_id, stale).await;
        }

        let request = StartSessionRequest {
            conflict: record.conflict,
            directory_id: record.destination.parent_directory_id,
            file_name: record.name.clone(),
            total_chunks,
            total_size: source.size,
            last_modified_at: record.last_modified_at,
        };
        match self.deps.sessions.start_session(drive_id, &request).await {
            Ok(session) => {
                debug!(record_id = %record.id, chunks = total_chunks, "upload session opened");
                cache.insert(&record.id, session.clone(), source);
                Ok((session, BTreeSet::new()))
            }
            Err(err) if err.code() == Some(&ApiErrorCode::UploadNotTerminated) => {
                warn!(record_id = %record.id, "server still holds an unfinished session");
                self.write(|record| record.session_token = None).await?;
                Err(UploadErrorKind::SessionInvalid.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn upload_chunks(
        &self,
        record: &UploadRecord,
        source: &Path,
        session: &UploadSession,
        ranges: Vec<ByteRange>,
        uploaded: &BTreeSet<u64>,
    ) -> Result<(), UploadError> {
        self.set_state(OperationState::Chunking);
        let total = ranges.len() as u64;
        let mut pending: VecDeque<(u64, ByteRange)> = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| (index as u64 + 1, range))
            .filter(|(number, _)| !uploaded.contains(number))
            .collect();
        let mut inflight: HashMap<u64, InflightChunk> = HashMap::new();
        let mut redispatched: HashMap<u64, u32> = HashMap::new();
        let mut done = total - pending.len() as u64;
        let parallelism = self.deps.chunk_parallelism.max(1);
        let mut inbox = self.inbox_rx.lock().await;

        loop {
            while inflight.len() < parallelism {
                let Some((number, range)) = pending.pop_front() else {
                    break;
                };
                let chunk = self
                    .dispatch_chunk(record, source, session, number, range)
                    .await?;
                inflight.insert(number, chunk);
            }
            if inflight.is_empty() {
                return Ok(());
            }
            if pending.is_empty() {
                self.set_state(OperationState::SchedulingUpload);
            }

            let completion = tokio::select! {
                _ = self.cancel.cancelled() => return Err(UploadErrorKind::TaskCancelled.into()),
                completion = inbox.recv() => completion.ok_or(UploadErrorKind::NetworkError)?,
            };
            let number = completion.key.chunk_number;
            if inflight.get(&number).is_none_or(|chunk| chunk.key != completion.key) {
                debug!(record_id = %self.record_id, transfer = %completion.key, "ignoring stale completion");
                continue;
            }
            let Some(chunk) = inflight.remove(&number) else {
                continue;
            };
            self.untrack(&chunk.key);

            match completion.outcome {
                TransferOutcome::Response {
                    status,
                    body,
                    retry_after,
                } => {
                    let status =
                        StatusCode::from_u16(status).map_err(|_| UploadErrorKind::ParseError)?;
                    let uploaded: UploadedChunk = decode_response(status, &body, retry_after)?;
                    if uploaded.number != number {
                        warn!(
                            record_id = %self.record_id,
                            chunk = number,
                            reported = uploaded.number,
                            "server acknowledged a different chunk"
                        );
                        return Err(UploadErrorKind::ChunkMismatch.into());
                    }
                    self.deps
                        .session_cache
                        .acknowledge(&self.record_id, session.token(), number);
                    if let Err(err) = self.deps.scratch.remove(&chunk.path).await {
                        warn!(record_id = %self.record_id, chunk = number, error = %err, "failed to remove chunk file");
                    }
                    done += 1;
                    let progress = (done as f64 / total as f64).max(0.01);
                    self.write(move |record| record.progress = Some(progress))
                        .await?;
                    debug!(record_id = %self.record_id, chunk = number, done, total, "chunk uploaded");
                }
                TransferOutcome::Cancelled | TransferOutcome::Interrupted => {
                    let count = redispatched.entry(number).or_default();
                    *count += 1;
                    if *count > MAX_CHUNK_REDISPATCH {
                        return Err(UploadErrorKind::NetworkError.into());
                    }
                    self.write(|record| {
                        if record.error.is_none() {
                            record.error = Some(UploadErrorKind::TaskRescheduled);
                        }
                    })
                    .await?;
                    info!(record_id = %self.record_id, chunk = number, attempt = *count, "re-dispatching chunk");
                    let key = TransferKey {
                        attempt: chunk.key.attempt + 1,
                        ..chunk.key
                    };
                    let chunk = self.schedule(key, chunk.request, chunk.path).await?;
                    inflight.insert(number, chunk);
                }
                TransferOutcome::Failed(reason) => {
                    warn!(record_id = %self.record_id, chunk = number, reason = %reason, "chunk transfer failed");
                    return Err(UploadErrorKind::NetworkError.into());
                }
            }
        }
    }

    async fn dispatch_chunk(
        &self,
        record: &UploadRecord,
        source: &Path,
        session: &UploadSession,
        number: u64,
        range: ByteRange,
    ) -> Result<InflightChunk, UploadError> {
        self.check_cancelled()?;
        if session.is_expired() {
            info!(record_id = %record.id, "upload session expired");
            return Err(UploadErrorKind::SessionInvalid.into());
        }

        let source = source.to_path_buf();
        let chunk = tokio::task::spawn_blocking(move || read_chunk(&source, number, range)).await??;
        let path = self.deps.scratch.store(&record.id, &chunk).await?;
        let params = ChunkParams {
            number,
            size: chunk.data.len() as u64,
            sha256: chunk.sha256,
        };
        let request =
            self.deps
                .sessions
                .append_chunk(record.destination.drive_id, session, &params)?;
        let key = TransferKey {
            record_id: record.id.clone(),
            session_token: session.token().to_string(),
            chunk_number: number,
            attempt: 0,
        };
        self.schedule(key, request, path).await
    }

    async fn schedule(
        &self,
        key: TransferKey,
        request: ChunkRequest,
        path: PathBuf,
    ) -> Result<InflightChunk, UploadError> {
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.insert(key.clone(), TransferHandle { key: key.clone() });
        }
        let handle = match self
            .deps
            .transfers
            .schedule(key.clone(), request.clone(), path.clone())
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                self.untrack(&key);
                return Err(err.into());
            }
        };
        // Finalization may have drained `inflight` while the executor was
        // still registering this transfer.
        if self.finalizing.load(Ordering::Acquire) {
            debug!(record_id = %self.record_id, transfer = %key, "cancelling transfer scheduled during finalization");
            self.deps.transfers.cancel(&handle);
            self.untrack(&key);
            return Err(UploadErrorKind::TaskCancelled.into());
        }
        Ok(InflightChunk { key, request, path })
    }

    async fn finish(&self, termination: Termination) -> (OperationReport, bool) {
        let mut finalized = self.finalizer.lock().await;
        if let Some(report) = finalized.as_ref() {
            return (report.clone(), false);
        }
        self.finalizing.store(true, Ordering::Release);
        self.cancel_inflight();

        let outcome = match termination {
            Termination::Finished(Ok(remote_file)) => self.finish_uploaded(remote_file).await,
            Termination::Finished(Err(err)) => self.finish_failed(err).await,
            Termination::Expired(reason) => self.finish_expired(reason).await,
        };

        if let Err(err) = self.deps.scratch.remove_record(&self.record_id).await {
            warn!(record_id = %self.record_id, error = %err, "failed to clean chunk files");
        }
        self.set_state(match outcome {
            OperationOutcome::Cancelled => OperationState::Cancelled,
            _ => OperationState::Terminated,
        });

        let report = OperationReport {
            record_id: self.record_id.clone(),
            record: self.snapshot(),
            outcome,
        };
        *finalized = Some(report.clone());
        self.terminated.cancel();
        (report, true)
    }

    async fn finish_uploaded(&self, remote_file: RemoteFile) -> OperationOutcome {
        let remote_id = remote_file.id;
        let updated = self
            .deps
            .store
            .update(&self.record_id, move |record| {
                record.uploaded_at = Some(now_unix());
                record.remote_file_id = Some(remote_id);
                record.error = None;
                record.session_token = None;
                record.progress = None;
            })
            .await;
        self.deps.session_cache.remove(&self.record_id);
        let record = match updated {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                info!(record_id = %self.record_id, file_id = remote_id, "record deleted while its upload finished");
                return OperationOutcome::Cancelled;
            }
            Err(err) => {
                error!(record_id = %self.record_id, error = %err, "failed to persist uploaded record");
                None
            }
        };

        if let Some(record) = record {
            self.remember(record.clone());
            self.deps.file_cache.merge_uploaded(&record, &remote_file).await;
            if record.remove_source_after_upload {
                if let UploadSource::Path(path) = &record.source {
                    if let Err(err) = tokio::fs::remove_file(path).await {
                        warn!(record_id = %record.id, error = %err, "failed to remove uploaded source");
                    }
                }
            }
            if record.owner == self.deps.context {
                if let Err(err) = self.deps.store.delete(&record.id).await {
                    error!(record_id = %record.id, error = %err, "failed to delete uploaded record");
                }
            }
        }
        info!(record_id = %self.record_id, file_id = remote_file.id, "upload finished");
        OperationOutcome::Uploaded { remote_file }
    }

    async fn finish_failed(&self, err: UploadError) -> OperationOutcome {
        let kind = err.kind();
        let retry_after = err.retry_after();
        let handling = kind.handling();
        if kind.is_failure() {
            warn!(record_id = %self.record_id, error = %err, kind = kind.as_str(), "upload attempt failed");
        } else {
            debug!(record_id = %self.record_id, kind = kind.as_str(), "upload attempt stopped");
        }

        if handling.clear_session || handling.delete_record {
            self.deps.session_cache.remove(&self.record_id);
        }
        if handling.clear_session {
            let token = self
                .session
                .lock()
                .ok()
                .and_then(|session| session.as_ref().map(|s| s.token().to_string()))
                .or_else(|| self.snapshot().and_then(|record| record.session_token));
            if let (Some(token), Some(record)) = (token, self.snapshot()) {
                self.cancel_remote_session(record.destination.drive_id, &token)
                    .await;
            }
        }

        if handling.delete_record {
            if let Err(err) = self.deps.store.delete(&self.record_id).await {
                error!(record_id = %self.record_id, error = %err, "failed to delete record");
            }
            return match kind {
                UploadErrorKind::TaskCancelled | UploadErrorKind::DatabaseRecordMissing => {
                    OperationOutcome::Cancelled
                }
                _ => OperationOutcome::Failed { kind, retry_after },
            };
        }

        let updated = self
            .deps
            .store
            .update(&self.record_id, move |record| {
                record.error = Some(kind);
                record.progress = None;
                if handling.zero_budget {
                    record.retry_budget = 0;
                }
                if handling.clear_session {
                    record.session_token = None;
                }
            })
            .await;
        match updated {
            Ok(Some(record)) => self.remember(record),
            Ok(None) => {}
            Err(err) => {
                error!(record_id = %self.record_id, error = %err, "failed to persist upload error")
            }
        }
        OperationOutcome::Failed { kind, retry_after }
    }

    async fn finish_expired(&self, reason: ExpireReason) -> OperationOutcome {
        info!(record_id = %self.record_id, ?reason, "upload attempt expired");
        let updated = self
            .deps
            .store
            .update(&self.record_id, |record| {
                record.error = Some(UploadErrorKind::TaskRescheduled);
                record.progress = None;
            })
            .await;
        let record = match updated {
            Ok(record) => record,
            Err(err) => {
                error!(record_id = %self.record_id, error = %err, "failed to mark record rescheduled");
                None
            }
        };

        let mut handed_off_to = None;
        if let Some(record) = record {
            self.remember(record.clone());
            if let Some(owner) = self.deps.handoff.hand_off(&record).await {
                handed_off_to = Some(owner);
                if owner != record.owner {
                    match self
                        .deps
                        .store
                        .update(&self.record_id, move |record| record.owner = owner)
                        .await
                    {
                        Ok(Some(record)) => self.remember(record),
                        Ok(None) => {}
                        Err(err) => {
                            error!(record_id = %self.record_id, error = %err, "failed to record handoff")
                        }
                    }
                }
            }
        }
        OperationOutcome::Rescheduled {
            handed_off_to,
            reason,
        }
    }

    async fn cancel_remote_session(&self, drive_id: i64, token: &str) {
        match self.deps.sessions.cancel_session(drive_id, token).await {
            Ok(_) => debug!(record_id = %self.record_id, "remote session cancelled"),
            Err(err) => {
                debug!(record_id = %self.record_id, error = %err, "failed to cancel remote session")
            }
        }
    }

    async fn write<F>(&self, mutate: F) -> Result<UploadRecord, UploadError>
    where
        F: FnOnce(&mut UploadRecord) + Send,
    {
        if self.finalizing.load(Ordering::Acquire) {
            return Err(UploadErrorKind::TaskCancelled.into());
        }
        let record = self.deps.store.update_existing(&self.record_id, mutate).await?;
        self.remember(record.clone());
        Ok(record)
    }

    fn check_cancelled(&self) -> Result<(), UploadError> {
        if self.cancel.is_cancelled() || self.finalizing.load(Ordering::Acquire) {
            return Err(UploadErrorKind::TaskCancelled.into());
        }
        Ok(())
    }

    fn cancel_inflight(&self) {
        let handles: Vec<TransferHandle> = self
            .inflight
            .lock()
            .map(|mut inflight| inflight.drain().map(|(_, handle)| handle).collect())
            .unwrap_or_default();
        for handle in &handles {
            self.deps.transfers.cancel(handle);
        }
    }

    fn untrack(&self, key: &TransferKey) {
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.remove(key);
        }
    }

    fn set_state(&self, next: OperationState) {
        if let Ok(mut state) = self.state.lock() {
            if !state.is_final() {
                *state = next;
            }
        }
    }

    fn remember(&self, record: UploadRecord) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            *snapshot = Some(record);
        }
    }

    fn snapshot(&self) -> Option<UploadRecord> {
        self.snapshot.lock().ok().and_then(|snapshot| snapshot.clone())
    }
}

#[cfg(test)]
#[path = "operation_tests.rs"]
mod tests;
