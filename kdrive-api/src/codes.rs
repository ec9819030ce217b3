use std::fmt;

/// Structured error codes returned in the `error.code` field of a failed
/// drive API response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ApiErrorCode {
    ObjectNotFound,
    UploadDestinationNotFound,
    UploadDestinationNotWritable,
    QuotaExceeded,
    FileAlreadyExists,
    DestinationAlreadyExists,
    Lock,
    NotAuthorized,
    Forbidden,
    ProductMaintenance,
    DriveMaintenance,
    UploadNotTerminated,
    InvalidUploadToken,
    UploadError,
    UploadFailed,
    UploadTokenNotValid,
    UploadTokenCanceled,
    LimitExceeded,
    Conflict,
    Other(String),
}

impl ApiErrorCode {
    pub fn parse(value: &str) -> Self {
        match value {
            "object_not_found" => Self::ObjectNotFound,
            "upload_destination_not_found_error" => Self::UploadDestinationNotFound,
            "upload_destination_not_writable_error" => Self::UploadDestinationNotWritable,
            "quota_exceeded_error" => Self::QuotaExceeded,
            "file_already_exists_error" => Self::FileAlreadyExists,
            "destination_already_exists" => Self::DestinationAlreadyExists,
            "lock_error" => Self::Lock,
            "not_authorized" => Self::NotAuthorized,
            "forbidden_error" => Self::Forbidden,
            "product_maintenance" => Self::ProductMaintenance,
            "drive_is_in_maintenance_error" => Self::DriveMaintenance,
            "upload_not_terminated_error" | "upload_not_terminated" => Self::UploadNotTerminated,
            "invalid_upload_token_error" => Self::InvalidUploadToken,
            "upload_error" => Self::UploadError,
            "upload_failed_error" => Self::UploadFailed,
            "upload_token_is_not_valid" => Self::UploadTokenNotValid,
            "upload_token_canceled" => Self::UploadTokenCanceled,
            "limit_exceeded_error" => Self::LimitExceeded,
            "conflict_error" => Self::Conflict,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ObjectNotFound => "object_not_found",
            Self::UploadDestinationNotFound => "upload_destination_not_found_error",
            Self::UploadDestinationNotWritable => "upload_destination_not_writable_error",
            Self::QuotaExceeded => "quota_exceeded_error",
            Self::FileAlreadyExists => "file_already_exists_error",
            Self::DestinationAlreadyExists => "destination_already_exists",
            Self::Lock => "lock_error",
            Self::NotAuthorized => "not_authorized",
            Self::Forbidden => "forbidden_error",
            Self::ProductMaintenance => "product_maintenance",
            Self::DriveMaintenance => "drive_is_in_maintenance_error",
            Self::UploadNotTerminated => "upload_not_terminated_error",
            Self::InvalidUploadToken => "invalid_upload_token_error",
            Self::UploadError => "upload_error",
            Self::UploadFailed => "upload_failed_error",
            Self::UploadTokenNotValid => "upload_token_is_not_valid",
            Self::UploadTokenCanceled => "upload_token_canceled",
            Self::LimitExceeded => "limit_exceeded_error",
            Self::Conflict => "conflict_error",
            Self::Other(code) => code,
        }
    }

    /// Codes meaning the upload session itself is unusable and a new one
    /// has to be negotiated.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            Self::UploadNotTerminated
                | Self::InvalidUploadToken
                | Self::UploadError
                | Self::UploadFailed
                | Self::UploadTokenNotValid
                | Self::UploadTokenCanceled
        )
    }

    /// Codes meaning the destination directory is gone or unusable.
    pub fn is_missing_destination(&self) -> bool {
        matches!(
            self,
            Self::ObjectNotFound
                | Self::UploadDestinationNotFound
                | Self::UploadDestinationNotWritable
        )
    }
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
