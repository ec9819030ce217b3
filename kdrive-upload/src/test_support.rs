//! Fixtures shared by the engine tests: a mock session API on wiremock,
//! the real HTTP transfer executor and recording host collaborators.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use kdrive_api::{DriveClient, RemoteFile};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::chunk::{ChunkPolicy, ScratchStore};
use crate::host::{
    DoneSummary, DriveFileCache, NoAssetResolver, StorageSpace, UploadNotifier, UploadProducer,
};
use crate::keepalive::{BackgroundHandoff, HostKeepAlive};
use crate::operation::{DEFAULT_CHUNK_PARALLELISM, OperationDeps, UploadOperation};
use crate::record::{Destination, ExecutionContext, UploadRecord, UploadSource};
use crate::session::SessionCache;
use crate::store::RecordStore;
use crate::transfer::{
    CompletionReceiver, HttpTransferExecutor, TransferConfig, TransferJournal,
};

pub const DRIVE_ID: i64 = 7;
pub const USER_ID: i64 = 1;
pub const SESSION_TOKEN: &str = "tok-1";
pub const REMOTE_FILE_ID: i64 = 99;

pub fn record(id: &str, parent: i64) -> UploadRecord {
    let mut record = UploadRecord::new(
        UploadSource::Path(PathBuf::from(format!("/tmp/{id}.bin"))),
        Destination {
            parent_directory_id: parent,
            drive_id: DRIVE_ID,
            user_id: USER_ID,
        },
        format!("{id}.bin"),
    )
    .with_id(id);
    record.size = 2048;
    record
}

/// Small chunks so a few kilobytes exercise the multi-chunk path.
pub fn test_policy() -> ChunkPolicy {
    ChunkPolicy {
        min_chunk_size: 1024,
        max_chunk_size: 4096,
        ..ChunkPolicy::default()
    }
}

pub fn write_source(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl UploadNotifier for RecordingNotifier {
    fn upload_paused(&self) {
        self.push("paused".into());
    }

    fn not_enough_space(&self) {
        self.push("no_space".into());
    }

    fn quota_exceeded(&self) {
        self.push("quota".into());
    }

    fn uploads_failed(&self, failed: usize, total: usize) {
        self.push(format!("failed:{failed}/{total}"));
    }

    fn upload_done(&self, summary: DoneSummary) {
        match summary {
            DoneSummary::Single { name, .. } => self.push(format!("done:{name}")),
            DoneSummary::Many { count } => self.push(format!("done:{count} files")),
        }
    }

    fn producer_disabled(&self, destination: Destination) {
        self.push(format!("disabled:{}", destination.parent_directory_id));
    }
}

#[derive(Default)]
pub struct CountingCache {
    merged: Mutex<Vec<i64>>,
}

impl CountingCache {
    pub fn merged(&self) -> Vec<i64> {
        self.merged.lock().unwrap().clone()
    }
}

#[async_trait]
impl DriveFileCache for CountingCache {
    async fn merge_uploaded(&self, _record: &UploadRecord, file: &RemoteFile) {
        self.merged.lock().unwrap().push(file.id);
    }
}

#[derive(Default)]
pub struct CountingHandoff {
    calls: AtomicUsize,
    accept: Mutex<Option<ExecutionContext>>,
}

impl CountingHandoff {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn accept_into(&self, context: ExecutionContext) {
        *self.accept.lock().unwrap() = Some(context);
    }
}

#[async_trait]
impl BackgroundHandoff for CountingHandoff {
    async fn hand_off(&self, _record: &UploadRecord) -> Option<ExecutionContext> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.accept.lock().unwrap()
    }
}

pub struct SwitchableStorage {
    room: AtomicBool,
}

impl SwitchableStorage {
    pub fn set_room(&self, room: bool) {
        self.room.store(room, Ordering::SeqCst);
    }
}

impl Default for SwitchableStorage {
    fn default() -> Self {
        Self {
            room: AtomicBool::new(true),
        }
    }
}

impl StorageSpace for SwitchableStorage {
    fn has_room_for(&self, _path: &Path, _bytes: u64) -> bool {
        self.room.load(Ordering::SeqCst)
    }
}

pub struct TestProducer {
    pub target: (i64, i64),
    pub disabled: AtomicBool,
}

impl TestProducer {
    pub fn new(drive_id: i64, parent_directory_id: i64) -> Self {
        Self {
            target: (drive_id, parent_directory_id),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }
}

impl UploadProducer for TestProducer {
    fn target(&self) -> Option<(i64, i64)> {
        Some(self.target)
    }

    fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }
}

/// Acknowledges a chunk with the number found in its query string.
pub struct ChunkAck;

impl Respond for ChunkAck {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let number = request
            .url
            .query_pairs()
            .find(|(key, _)| key == "chunk_number")
            .and_then(|(_, value)| value.parse::<u64>().ok())
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(json!({
            "result": "success",
            "data": {"number": number, "status": "ok", "size": request.body.len()}
        }))
    }
}

pub fn remote_file_json(name: &str, parent: i64) -> serde_json::Value {
    json!({"id": REMOTE_FILE_ID, "name": name, "parent_id": parent, "size": 5000})
}

/// Mounts a session API that accepts everything.
pub async fn mount_session_api(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!("/3/drive/{DRIVE_ID}/upload/session/start")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": "success",
            "data": {"token": SESSION_TOKEN}
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/3/drive/7/upload/session/[^/]+/chunk$"))
        .respond_with(ChunkAck)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/3/drive/7/upload/session/[^/]+/finish$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": "success",
            "data": {"token": SESSION_TOKEN, "file": remote_file_json("a.bin", 42)}
        })))
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/3/drive/7/upload/session/[^/]+$"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"result": "success", "data": true})),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/3/drive/{DRIVE_ID}/upload")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": "success",
            "data": remote_file_json("empty.bin", 42)
        })))
        .mount(server)
        .await;
}

pub fn api_error(status: u16, code: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({
        "result": "error",
        "error": {"code": code, "description": code}
    }))
}

pub struct Harness {
    pub server: MockServer,
    pub dir: TempDir,
    pub store: Arc<RecordStore>,
    pub keep_alive: HostKeepAlive,
    pub cache: Arc<CountingCache>,
    pub handoff: Arc<CountingHandoff>,
    pub storage: Arc<SwitchableStorage>,
    pub transfers: Arc<HttpTransferExecutor>,
    pub completions: Option<CompletionReceiver>,
    pub client: Arc<DriveClient>,
    pub sessions: SessionCache,
}

impl Harness {
    pub async fn new() -> Self {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::in_memory().await.unwrap());
        let journal = TransferJournal::new(store.pool().clone());
        let (transfers, completions) =
            HttpTransferExecutor::new(TransferConfig::default(), journal);
        let client = Arc::new(DriveClient::with_base_url(&server.uri(), "test-token").unwrap());
        Self {
            server,
            dir,
            store,
            keep_alive: HostKeepAlive::new(),
            cache: Arc::new(CountingCache::default()),
            handoff: Arc::new(CountingHandoff::default()),
            storage: Arc::new(SwitchableStorage::default()),
            transfers: Arc::new(transfers),
            completions: Some(completions),
            client,
            sessions: SessionCache::new(),
        }
    }

    pub fn deps(&self) -> OperationDeps {
        OperationDeps {
            store: Arc::clone(&self.store),
            sessions: self.client.clone(),
            transfers: self.transfers.clone(),
            scratch: ScratchStore::new(self.dir.path().join("scratch")),
            keep_alive: Arc::new(self.keep_alive.clone()),
            handoff: self.handoff.clone(),
            assets: Arc::new(NoAssetResolver),
            storage: self.storage.clone(),
            file_cache: self.cache.clone(),
            session_cache: self.sessions.clone(),
            policy: test_policy(),
            chunk_parallelism: DEFAULT_CHUNK_PARALLELISM,
            context: ExecutionContext::App,
        }
    }

    /// Writes a source file of `len` bytes and persists a record for it.
    pub async fn insert_upload(&self, id: &str, parent: i64, len: usize) -> UploadRecord {
        let source = write_source(self.dir.path(), &format!("{id}.bin"), len);
        let mut upload = record(id, parent);
        upload.source = UploadSource::Path(source);
        upload.size = len as u64;
        self.store.insert(&upload).await.unwrap();
        upload
    }

    /// Forwards every executor completion to `operation`.
    pub fn route_to(&mut self, operation: Arc<UploadOperation>) {
        self.router().switch_to(operation);
    }

    /// Forwards executor completions to whichever operation the returned
    /// router points at.
    pub fn router(&mut self) -> Router {
        let router = Router::default();
        let Some(mut completions) = self.completions.take() else {
            return router;
        };
        let target = Arc::clone(&router.target);
        tokio::spawn(async move {
            while let Some(completion) = completions.recv().await {
                let operation = target.lock().unwrap().clone();
                if let Some(operation) = operation {
                    let _ = operation.deliver(completion);
                }
            }
        });
        router
    }

    pub async fn received(&self, method_name: &str, path_suffix: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| {
                request.method.as_str() == method_name && request.url.path().ends_with(path_suffix)
            })
            .count()
    }
}

#[derive(Default)]
pub struct Router {
    target: Arc<Mutex<Option<Arc<UploadOperation>>>>,
}

impl Router {
    pub fn switch_to(&self, operation: Arc<UploadOperation>) {
        *self.target.lock().unwrap() = Some(operation);
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
