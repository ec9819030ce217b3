use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use kdrive_api::ChunkRequest;
use reqwest::Client;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info, warn};

use crate::record::now_unix;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer journal error: {0}")]
    Journal(#[from] sqlx::Error),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

/// Stable identity of one transfer attempt, carried from dispatch to
/// completion so a late result finds its owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub record_id: String,
    pub session_token: String,
    pub chunk_number: u64,
    pub attempt: u32,
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.record_id, self.session_token, self.chunk_number, self.attempt
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHandle {
    pub key: TransferKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Response {
        status: u16,
        body: Vec<u8>,
        retry_after: Option<Duration>,
    },
    /// Stopped on the client side before a response arrived.
    Cancelled,
    /// Left over from a previous process; the result is unknown.
    Interrupted,
    /// No response, e.g. connection refused or reset.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompletion {
    pub key: TransferKey,
    pub outcome: TransferOutcome,
}

pub type CompletionSender = mpsc::UnboundedSender<TransferCompletion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<TransferCompletion>;

/// Background transfer primitive. Scheduling is fire-and-forget; every
/// scheduled transfer produces exactly one [`TransferCompletion`] on the
/// executor's completion channel.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn schedule(
        &self,
        key: TransferKey,
        request: ChunkRequest,
        chunk_file: PathBuf,
    ) -> Result<TransferHandle, TransferError>;

    fn cancel(&self, handle: &TransferHandle);

    /// Re-attaches to transfers scheduled by a previous process and emits a
    /// completion for each. Returns how many were found.
    async fn reconnect(&self) -> Result<usize, TransferError>;
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: 4,
        }
    }
}

/// Journal of scheduled transfers, kept next to the upload records.
#[derive(Clone)]
pub struct TransferJournal {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub key: TransferKey,
    pub url: String,
    pub chunk_path: PathBuf,
}

impl TransferJournal {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        key: &TransferKey,
        request: &ChunkRequest,
        chunk_file: &Path,
    ) -> Result<(), TransferError> {
        sqlx::query(
            "INSERT INTO transfers (transfer_key, record_id, chunk_number, session_token, attempt, url, chunk_path, scheduled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(transfer_key) DO UPDATE SET
                url = excluded.url,
                chunk_path = excluded.chunk_path,
                scheduled_at = excluded.scheduled_at",
        )
        .bind(key.to_string())
        .bind(&key.record_id)
        .bind(i64::try_from(key.chunk_number).unwrap_or(i64::MAX))
        .bind(&key.session_token)
        .bind(i64::from(key.attempt))
        .bind(request.url.as_str())
        .bind(chunk_file.to_string_lossy().into_owned())
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn forget(&self, key: &TransferKey) -> Result<(), TransferError> {
        sqlx::query("DELETE FROM transfers WHERE transfer_key = ?1")
            .bind(key.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn entries(&self) -> Result<Vec<JournalEntry>, TransferError> {
        let rows = sqlx::query(
            "SELECT record_id, chunk_number, session_token, attempt, url, chunk_path
             FROM transfers ORDER BY scheduled_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let chunk_number: i64 = row.try_get("chunk_number")?;
            let attempt: i64 = row.try_get("attempt")?;
            let chunk_path: String = row.try_get("chunk_path")?;
            out.push(JournalEntry {
                key: TransferKey {
                    record_id: row.try_get("record_id")?,
                    session_token: row.try_get("session_token")?,
                    chunk_number: u64::try_from(chunk_number).unwrap_or_default(),
                    attempt: u32::try_from(attempt).unwrap_or_default(),
                },
                url: row.try_get("url")?,
                chunk_path: PathBuf::from(chunk_path),
            });
        }
        Ok(out)
    }
}

/// Chunk transport over HTTP. Transfers run on their own tasks and outlive
/// the operation that scheduled them until they complete or are cancelled.
pub struct HttpTransferExecutor {
    http: Client,
    upload_limit: Arc<Semaphore>,
    journal: TransferJournal,
    completions: CompletionSender,
    inflight: Arc<Mutex<HashMap<TransferKey, CancellationToken>>>,
}

impl HttpTransferExecutor {
    pub fn new(config: TransferConfig, journal: TransferJournal) -> (Self, CompletionReceiver) {
        let (completions, receiver) = mpsc::unbounded_channel();
        let executor = Self {
            http: Client::new(),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
            journal,
            completions,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        };
        (executor, receiver)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().map(|map| map.len()).unwrap_or_default()
    }
}

#[async_trait]
impl TransferExecutor for HttpTransferExecutor {
    async fn schedule(
        &self,
        key: TransferKey,
        request: ChunkRequest,
        chunk_file: PathBuf,
    ) -> Result<TransferHandle, TransferError> {
        // Registered before the first await so a cancel issued while the
        // journal write is pending still reaches the transfer.
        let token = CancellationToken::new();
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.insert(key.clone(), token.clone());
        }
        if let Err(err) = self.journal.record(&key, &request, &chunk_file).await {
            if let Ok(mut inflight) = self.inflight.lock() {
                inflight.remove(&key);
            }
            return Err(err.into());
        }
        debug!(transfer = %key, "chunk transfer scheduled");

        let http = self.http.clone();
        let limit = Arc::clone(&self.upload_limit);
        let journal = self.journal.clone();
        let completions = self.completions.clone();
        let inflight = Arc::clone(&self.inflight);
        let handle = TransferHandle { key: key.clone() };

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => TransferOutcome::Cancelled,
                outcome = send_chunk(&http, &limit, &request, &chunk_file) => outcome,
            };
            if let Ok(mut inflight) = inflight.lock() {
                inflight.remove(&key);
            }
            if let Err(err) = journal.forget(&key).await {
                warn!(transfer = %key, error = %err, "failed to clear transfer journal entry");
            }
            debug!(transfer = %key, ?outcome, "chunk transfer finished");
            let _ = completions.send(TransferCompletion { key, outcome });
        });

        Ok(handle)
    }

    fn cancel(&self, handle: &TransferHandle) {
        let token = self
            .inflight
            .lock()
            .ok()
            .and_then(|inflight| inflight.get(&handle.key).cloned());
        if let Some(token) = token {
            token.cancel();
        }
    }

    async fn reconnect(&self) -> Result<usize, TransferError> {
        let entries = self.journal.entries().await?;
        let live: Vec<TransferKey> = self
            .inflight
            .lock()
            .map(|inflight| inflight.keys().cloned().collect())
            .unwrap_or_default();

        let mut reconnected = 0;
        for entry in entries {
            if live.contains(&entry.key) {
                continue;
            }
            info!(transfer = %entry.key, "reconciling transfer left by a previous run");
            let completion = TransferCompletion {
                key: entry.key.clone(),
                outcome: TransferOutcome::Interrupted,
            };
            if self.completions.send(completion).is_err() {
                warn!(transfer = %entry.key, "nobody listens for completions, keeping journal entry");
                continue;
            }
            self.journal.forget(&entry.key).await?;
            reconnected += 1;
        }
        Ok(reconnected)
    }
}

async fn send_chunk(
    http: &Client,
    limit: &Arc<Semaphore>,
    request: &ChunkRequest,
    chunk_file: &Path,
) -> TransferOutcome {
    match try_send_chunk(http, limit, request, chunk_file).await {
        Ok(outcome) => outcome,
        Err(err) => TransferOutcome::Failed(err.to_string()),
    }
}

async fn try_send_chunk(
    http: &Client,
    limit: &Arc<Semaphore>,
    request: &ChunkRequest,
    chunk_file: &Path,
) -> Result<TransferOutcome, TransferError> {
    let _permit = Arc::clone(limit)
        .acquire_owned()
        .await
        .map_err(|_| TransferError::ConcurrencyClosed)?;
    let file = tokio::fs::File::open(chunk_file).await?;
    let length = file.metadata().await?.len();
    let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
    let response = http
        .post(request.url.clone())
        .header("Authorization", &request.authorization)
        .header(reqwest::header::CONTENT_LENGTH, length)
        .body(body)
        .send()
        .await?;
    let status = response.status().as_u16();
    let retry_after = kdrive_api::retry_after_from_headers(response.headers());
    let body = response.bytes().await?.to_vec();
    Ok(TransferOutcome::Response {
        status,
        body,
        retry_after,
    })
}
