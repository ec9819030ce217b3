use std::io;
use std::time::Duration;

use kdrive_api::{ApiErrorClass, ApiErrorCode, DriveApiError};
use thiserror::Error;

use crate::chunk::ChunkError;
use crate::store::StoreError;
use crate::transfer::TransferError;

/// Classified outcome of a failed attempt, persisted on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadErrorKind {
    FileNotFound,
    NotEnoughLocalStorage,
    FileTooLarge,
    SessionInvalid,
    UnableToBuildRequest,
    ParseError,
    ChunkMismatch,
    DatabaseRecordMissing,
    NetworkError,
    ServerError,
    Lock,
    NotAuthorized,
    Maintenance,
    QuotaExceeded,
    FileAlreadyExists,
    ObjectNotFound,
    RetryBudgetExhausted,
    TaskCancelled,
    TaskRescheduled,
}

/// What the queue does with a record after an attempt ends with a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Handling {
    /// Eligible for automatic re-admission while budget remains.
    pub retryable: bool,
    pub zero_budget: bool,
    pub clear_session: bool,
    pub delete_record: bool,
    pub user_visible: bool,
    /// Cancel every other upload under the same parent.
    pub cascade: bool,
    pub suspend_all: bool,
}

impl UploadErrorKind {
    /// Kinds caused by the device or the connection rather than a decision
    /// of the server. Cleared in bulk when conditions improve.
    pub const NETWORK_AND_LOCAL: [UploadErrorKind; 8] = [
        UploadErrorKind::NetworkError,
        UploadErrorKind::NotEnoughLocalStorage,
        UploadErrorKind::UnableToBuildRequest,
        UploadErrorKind::ParseError,
        UploadErrorKind::ChunkMismatch,
        UploadErrorKind::SessionInvalid,
        UploadErrorKind::TaskRescheduled,
        UploadErrorKind::RetryBudgetExhausted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadErrorKind::FileNotFound => "fileNotFound",
            UploadErrorKind::NotEnoughLocalStorage => "notEnoughLocalStorage",
            UploadErrorKind::FileTooLarge => "fileTooLarge",
            UploadErrorKind::SessionInvalid => "sessionInvalid",
            UploadErrorKind::UnableToBuildRequest => "unableToBuildRequest",
            UploadErrorKind::ParseError => "parseError",
            UploadErrorKind::ChunkMismatch => "chunkMismatch",
            UploadErrorKind::DatabaseRecordMissing => "databaseRecordMissing",
            UploadErrorKind::NetworkError => "networkError",
            UploadErrorKind::ServerError => "serverError",
            UploadErrorKind::Lock => "lock",
            UploadErrorKind::NotAuthorized => "notAuthorized",
            UploadErrorKind::Maintenance => "maintenance",
            UploadErrorKind::QuotaExceeded => "quotaExceeded",
            UploadErrorKind::FileAlreadyExists => "fileAlreadyExists",
            UploadErrorKind::ObjectNotFound => "objectNotFound",
            UploadErrorKind::RetryBudgetExhausted => "retryBudgetExhausted",
            UploadErrorKind::TaskCancelled => "taskCancelled",
            UploadErrorKind::TaskRescheduled => "taskRescheduled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value {
            "fileNotFound" => UploadErrorKind::FileNotFound,
            "notEnoughLocalStorage" => UploadErrorKind::NotEnoughLocalStorage,
            "fileTooLarge" => UploadErrorKind::FileTooLarge,
            "sessionInvalid" => UploadErrorKind::SessionInvalid,
            "unableToBuildRequest" => UploadErrorKind::UnableToBuildRequest,
            "parseError" => UploadErrorKind::ParseError,
            "chunkMismatch" => UploadErrorKind::ChunkMismatch,
            "databaseRecordMissing" => UploadErrorKind::DatabaseRecordMissing,
            "networkError" => UploadErrorKind::NetworkError,
            "serverError" => UploadErrorKind::ServerError,
            "lock" => UploadErrorKind::Lock,
            "notAuthorized" => UploadErrorKind::NotAuthorized,
            "maintenance" => UploadErrorKind::Maintenance,
            "quotaExceeded" => UploadErrorKind::QuotaExceeded,
            "fileAlreadyExists" => UploadErrorKind::FileAlreadyExists,
            "objectNotFound" => UploadErrorKind::ObjectNotFound,
            "retryBudgetExhausted" => UploadErrorKind::RetryBudgetExhausted,
            "taskCancelled" => UploadErrorKind::TaskCancelled,
            "taskRescheduled" => UploadErrorKind::TaskRescheduled,
            _ => return None,
        };
        Some(kind)
    }

    pub fn handling(&self) -> Handling {
        use UploadErrorKind::*;
        match self {
            FileNotFound => Handling {
                zero_budget: true,
                clear_session: true,
                delete_record: true,
                user_visible: true,
                ..Handling::default()
            },
            NotEnoughLocalStorage => Handling {
                zero_budget: true,
                user_visible: true,
                suspend_all: true,
                ..Handling::default()
            },
            SessionInvalid | UnableToBuildRequest | ParseError | ChunkMismatch => Handling {
                retryable: true,
                clear_session: true,
                user_visible: true,
                ..Handling::default()
            },
            DatabaseRecordMissing => Handling {
                clear_session: true,
                delete_record: true,
                ..Handling::default()
            },
            NetworkError | ServerError | Lock | NotAuthorized | Maintenance => Handling {
                retryable: true,
                user_visible: true,
                ..Handling::default()
            },
            QuotaExceeded => Handling {
                zero_budget: true,
                user_visible: true,
                suspend_all: true,
                ..Handling::default()
            },
            FileAlreadyExists | FileTooLarge | RetryBudgetExhausted => Handling {
                zero_budget: true,
                clear_session: true,
                user_visible: true,
                ..Handling::default()
            },
            ObjectNotFound => Handling {
                zero_budget: true,
                clear_session: true,
                user_visible: true,
                cascade: true,
                ..Handling::default()
            },
            TaskCancelled => Handling {
                clear_session: true,
                delete_record: true,
                ..Handling::default()
            },
            TaskRescheduled => Handling {
                retryable: true,
                ..Handling::default()
            },
        }
    }

    /// Rescheduling and cancellation are not failures.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            UploadErrorKind::TaskCancelled
                | UploadErrorKind::TaskRescheduled
                | UploadErrorKind::DatabaseRecordMissing
        )
    }

    pub fn from_api_code(code: &ApiErrorCode) -> Option<Self> {
        if code.is_missing_destination() {
            return Some(UploadErrorKind::ObjectNotFound);
        }
        if code.invalidates_session() {
            return Some(UploadErrorKind::SessionInvalid);
        }
        let kind = match code {
            ApiErrorCode::QuotaExceeded => UploadErrorKind::QuotaExceeded,
            ApiErrorCode::FileAlreadyExists | ApiErrorCode::DestinationAlreadyExists => {
                UploadErrorKind::FileAlreadyExists
            }
            ApiErrorCode::Lock => UploadErrorKind::Lock,
            ApiErrorCode::NotAuthorized | ApiErrorCode::Forbidden => UploadErrorKind::NotAuthorized,
            ApiErrorCode::ProductMaintenance | ApiErrorCode::DriveMaintenance => {
                UploadErrorKind::Maintenance
            }
            ApiErrorCode::LimitExceeded | ApiErrorCode::Conflict => UploadErrorKind::ServerError,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("drive api error: {0}")]
    Api(#[from] DriveApiError),
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("upload failed: {}", .0.as_str())]
    Kind(UploadErrorKind),
}

impl UploadError {
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            UploadError::Api(err) => classify_api_error(err),
            UploadError::Chunk(err) => match err {
                ChunkError::FileTooLarge { .. } => UploadErrorKind::FileTooLarge,
                ChunkError::Read { .. } => UploadErrorKind::FileNotFound,
                ChunkError::Scratch(err) => classify_io(err),
                ChunkError::ChunkedSizeLargerThanSource { .. }
                | ChunkError::IncorrectChunkCount
                | ChunkError::IncorrectChunkSize => UploadErrorKind::UnableToBuildRequest,
            },
            UploadError::Store(StoreError::RecordMissing(_)) => {
                UploadErrorKind::DatabaseRecordMissing
            }
            UploadError::Store(_) => UploadErrorKind::UnableToBuildRequest,
            UploadError::Transfer(TransferError::Request(_)) => UploadErrorKind::NetworkError,
            UploadError::Transfer(_) => UploadErrorKind::UnableToBuildRequest,
            UploadError::Io(err) => classify_io(err),
            UploadError::Join(_) => UploadErrorKind::UnableToBuildRequest,
            UploadError::Kind(kind) => *kind,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UploadError::Api(err) => err.retry_after(),
            _ => None,
        }
    }
}

impl From<UploadErrorKind> for UploadError {
    fn from(kind: UploadErrorKind) -> Self {
        UploadError::Kind(kind)
    }
}

pub fn classify_api_error(err: &DriveApiError) -> UploadErrorKind {
    match err {
        DriveApiError::Request(_) => UploadErrorKind::NetworkError,
        DriveApiError::Url(_) => UploadErrorKind::UnableToBuildRequest,
        DriveApiError::Decode(_) | DriveApiError::MissingData => UploadErrorKind::ParseError,
        DriveApiError::Api { code, .. } => UploadErrorKind::from_api_code(code).unwrap_or_else(
            || match err.classification() {
                Some(ApiErrorClass::Auth) => UploadErrorKind::NotAuthorized,
                _ => UploadErrorKind::ServerError,
            },
        ),
    }
}

fn classify_io(err: &io::Error) -> UploadErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => UploadErrorKind::FileNotFound,
        io::ErrorKind::StorageFull => UploadErrorKind::NotEnoughLocalStorage,
        _ => UploadErrorKind::UnableToBuildRequest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    fn api(status: StatusCode, code: &str) -> UploadError {
        UploadError::Api(DriveApiError::Api {
            status,
            code: ApiErrorCode::parse(code),
            description: String::new(),
            retry_after: None,
        })
    }

    #[test]
    fn structured_codes_drive_classification() {
        let cases = [
            ("object_not_found", UploadErrorKind::ObjectNotFound),
            ("upload_destination_not_writable_error", UploadErrorKind::ObjectNotFound),
            ("quota_exceeded_error", UploadErrorKind::QuotaExceeded),
            ("destination_already_exists", UploadErrorKind::FileAlreadyExists),
            ("upload_not_terminated", UploadErrorKind::SessionInvalid),
            ("upload_token_canceled", UploadErrorKind::SessionInvalid),
            ("drive_is_in_maintenance_error", UploadErrorKind::Maintenance),
            ("lock_error", UploadErrorKind::Lock),
        ];
        for (code, expected) in cases {
            assert_eq!(api(StatusCode::BAD_REQUEST, code).kind(), expected, "{code}");
        }
    }

    #[test]
    fn unknown_codes_fall_back_to_status() {
        assert_eq!(
            api(StatusCode::UNAUTHORIZED, "").kind(),
            UploadErrorKind::NotAuthorized
        );
        assert_eq!(
            api(StatusCode::BAD_GATEWAY, "").kind(),
            UploadErrorKind::ServerError
        );
    }

    #[test]
    fn local_failures_are_classified() {
        let missing = UploadError::Chunk(ChunkError::Read {
            number: 1,
            source: io::Error::from(io::ErrorKind::NotFound),
        });
        assert_eq!(missing.kind(), UploadErrorKind::FileNotFound);
        let full = UploadError::Io(io::Error::from(io::ErrorKind::StorageFull));
        assert_eq!(full.kind(), UploadErrorKind::NotEnoughLocalStorage);
        let gone = UploadError::Store(StoreError::RecordMissing("x".into()));
        assert_eq!(gone.kind(), UploadErrorKind::DatabaseRecordMissing);
    }

    #[test]
    fn handling_matches_taxonomy() {
        let quota = UploadErrorKind::QuotaExceeded.handling();
        assert!(!quota.retryable && quota.zero_budget && quota.user_visible);

        let network = UploadErrorKind::NetworkError.handling();
        assert!(network.retryable && !network.zero_budget && !network.clear_session);

        let session = UploadErrorKind::SessionInvalid.handling();
        assert!(session.retryable && session.clear_session);

        let missing = UploadErrorKind::ObjectNotFound.handling();
        assert!(missing.cascade && missing.zero_budget && !missing.retryable);

        let silent = UploadErrorKind::DatabaseRecordMissing.handling();
        assert!(!silent.user_visible && silent.delete_record);

        assert!(!UploadErrorKind::TaskRescheduled.is_failure());
        assert!(UploadErrorKind::Lock.is_failure());
    }
}
