use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use kdrive_api::{
    ChunkParams, ChunkRequest, DirectUploadRequest, DriveApiError, DriveClient, RemoteFile,
    SessionHandle, StartSessionRequest, UploadedFile,
};
use time::OffsetDateTime;

/// The server keeps a session for 12 hours; stop trusting it an hour early.
pub const SESSION_VALIDITY: Duration = Duration::from_secs(11 * 60 * 60);

/// Server-side upload session API, as the engine sees it.
#[async_trait]
pub trait UploadSessionClient: Send + Sync {
    async fn start_session(
        &self,
        drive_id: i64,
        request: &StartSessionRequest,
    ) -> Result<UploadSession, DriveApiError>;

    fn append_chunk(
        &self,
        drive_id: i64,
        session: &UploadSession,
        chunk: &ChunkParams,
    ) -> Result<ChunkRequest, DriveApiError>;

    async fn close_session(&self, drive_id: i64, token: &str)
    -> Result<UploadedFile, DriveApiError>;

    async fn cancel_session(&self, drive_id: i64, token: &str) -> Result<bool, DriveApiError>;

    async fn direct_upload(
        &self,
        drive_id: i64,
        request: &DirectUploadRequest,
        body: Vec<u8>,
    ) -> Result<RemoteFile, DriveApiError>;
}

/// An open session. Lives only in memory; [`SessionCache`] carries it
/// across attempts of the same process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub handle: SessionHandle,
    pub total_chunks: u64,
    pub expires_at: OffsetDateTime,
}

impl UploadSession {
    pub fn new(handle: SessionHandle, total_chunks: u64) -> Self {
        Self {
            handle,
            total_chunks,
            expires_at: OffsetDateTime::now_utc() + SESSION_VALIDITY,
        }
    }

    pub fn token(&self) -> &str {
        &self.handle.token
    }

    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() >= self.expires_at
    }
}

/// What the source looked like when its session was opened. A session is
/// only resumed for the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceIdentity {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl SourceIdentity {
    pub fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            size: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
    pub session: UploadSession,
    pub source: SourceIdentity,
    /// Chunk numbers the server acknowledged.
    pub uploaded: BTreeSet<u64>,
}

impl CachedSession {
    /// Whether the next attempt for `source` may continue in this session.
    pub fn resumable_for(&self, source: &SourceIdentity, token: Option<&str>) -> bool {
        !self.session.is_expired()
            && self.source == *source
            && token == Some(self.session.token())
    }
}

/// Open sessions by record id, shared by every operation of a service.
#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    entries: Arc<Mutex<HashMap<String, CachedSession>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record_id: &str, session: UploadSession, source: SourceIdentity) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                record_id.to_string(),
                CachedSession {
                    session,
                    source,
                    uploaded: BTreeSet::new(),
                },
            );
        }
    }

    pub fn get(&self, record_id: &str) -> Option<CachedSession> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(record_id).cloned())
    }

    /// Notes an acknowledged chunk. Ignored when the record has moved to
    /// another session meanwhile.
    pub fn acknowledge(&self, record_id: &str, token: &str, chunk_number: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(record_id) {
                if entry.session.token() == token {
                    entry.uploaded.insert(chunk_number);
                }
            }
        }
    }

    pub fn remove(&self, record_id: &str) -> Option<CachedSession> {
        self.entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.remove(record_id))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UploadSessionClient for DriveClient {
    async fn start_session(
        &self,
        drive_id: i64,
        request: &StartSessionRequest,
    ) -> Result<UploadSession, DriveApiError> {
        let started = DriveClient::start_session(self, drive_id, request).await?;
        Ok(UploadSession::new(
            SessionHandle {
                token: started.token,
                upload_url: started.upload_url,
            },
            request.total_chunks,
        ))
    }

    fn append_chunk(
        &self,
        drive_id: i64,
        session: &UploadSession,
        chunk: &ChunkParams,
    ) -> Result<ChunkRequest, DriveApiError> {
        self.append_chunk_request(drive_id, &session.handle, chunk)
    }

    async fn close_session(
        &self,
        drive_id: i64,
        token: &str,
    ) -> Result<UploadedFile, DriveApiError> {
        DriveClient::close_session(self, drive_id, token).await
    }

    async fn cancel_session(&self, drive_id: i64, token: &str) -> Result<bool, DriveApiError> {
        DriveClient::cancel_session(self, drive_id, token).await
    }

    async fn direct_upload(
        &self,
        drive_id: i64,
        request: &DirectUploadRequest,
        body: Vec<u8>,
    ) -> Result<RemoteFile, DriveApiError> {
        DriveClient::direct_upload(self, drive_id, request, body).await
    }
}
