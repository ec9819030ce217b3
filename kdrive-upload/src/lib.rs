mod backoff;
mod chunk;
mod config;
mod error;
mod host;
mod keepalive;
mod notify;
mod observe;
mod operation;
mod parallelism;
mod queue;
mod record;
mod service;
mod session;
mod store;
mod transfer;

#[cfg(test)]
mod test_support;

pub use backoff::Backoff;
pub use chunk::{
    ByteRange, CHUNK_MAX_SIZE, CHUNK_MIN_SIZE, Chunk, ChunkError, ChunkPolicy, ChunkReader,
    FILE_MAX_SIZE, MAX_CHUNK_COUNT, OPTIMAL_CHUNK_COUNT, ScratchStore, build_ranges,
    checksum_bytes, compute_ranges, preferred_chunk_size, read_chunk, total_chunk_count,
};
pub use config::UploadConfig;
pub use error::{Handling, UploadError, UploadErrorKind, classify_api_error};
pub use host::{
    AssetResolver, DoneSummary, DriveFileCache, NoAssetResolver, NoFileCache, SilentNotifier,
    StorageSpace, UnboundedStorage, UploadNotifier, UploadProducer,
};
pub use keepalive::{
    BackgroundHandoff, DeadlineKeepAlive, HostKeepAlive, KeepAlive, KeepAliveLease, NoHandoff,
    NoKeepAlive,
};
pub use notify::NotificationTracker;
pub use observe::{CountChanged, CountScope, FileUploaded, ObserverHub, Subscription};
pub use operation::{
    DEFAULT_CHUNK_PARALLELISM, ExpireReason, MAX_CHUNK_REDISPATCH, OperationDeps,
    OperationOutcome, OperationReport, OperationState, UploadOperation,
};
pub use parallelism::{
    HIGH_PARALLELISM, MEDIUM_PARALLELISM, REDUCED_PARALLELISM, SERIAL_PARALLELISM, ThermalState,
    WorkloadSignals, split_among_lanes, workload_parallelism,
};
pub use queue::{CancelResult, QueueEvent, UploadQueue};
pub use record::{
    DEFAULT_RETRY_BUDGET, Destination, ExecutionContext, Lane, UploadRecord, UploadSource,
};
pub use service::{UploadService, UploadServiceBuilder};
pub use session::{
    CachedSession, SESSION_VALIDITY, SessionCache, SourceIdentity, UploadSession,
    UploadSessionClient,
};
pub use store::{BATCH_SIZE, RecordFilter, RecordState, RecordStore, StoreError};
pub use transfer::{
    CompletionReceiver, CompletionSender, HttpTransferExecutor, JournalEntry, TransferCompletion,
    TransferConfig, TransferError, TransferExecutor, TransferHandle, TransferJournal,
    TransferKey, TransferOutcome,
};
