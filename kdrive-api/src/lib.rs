mod client;
mod codes;

pub use client::{
    ApiErrorClass, ChunkParams, ChunkRequest, ConflictOption, DirectUploadRequest, DriveApiError,
    DriveClient, RemoteFile, SessionHandle, StartSessionRequest, UploadSessionStarted,
    UploadedChunk, UploadedFile, decode_response, retry_after_from_headers,
};
pub use codes::ApiErrorCode;
