use std::path::PathBuf;

use kdrive_api::ConflictOption;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::UploadErrorKind;

pub const DEFAULT_RETRY_BUDGET: u32 = 5;

/// Where the bytes of an upload come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    Path(PathBuf),
    /// Library asset that must be materialized to a file before reading.
    Asset(String),
}

impl UploadSource {
    pub(crate) fn kind_str(&self) -> &'static str {
        match self {
            UploadSource::Path(_) => "path",
            UploadSource::Asset(_) => "asset",
        }
    }

    pub(crate) fn value(&self) -> String {
        match self {
            UploadSource::Path(path) => path.to_string_lossy().into_owned(),
            UploadSource::Asset(id) => id.clone(),
        }
    }

    pub(crate) fn parse(kind: &str, value: String) -> Option<Self> {
        match kind {
            "path" => Some(UploadSource::Path(PathBuf::from(value))),
            "asset" => Some(UploadSource::Asset(value)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub parent_directory_id: i64,
    pub drive_id: i64,
    pub user_id: i64,
}

/// Independent queues sharing the global parallelism budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    General,
    PhotoLibrary,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::General, Lane::PhotoLibrary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::General => "general",
            Lane::PhotoLibrary => "photo_library",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "general" => Some(Lane::General),
            "photo_library" => Some(Lane::PhotoLibrary),
            _ => None,
        }
    }
}

/// Execution context owning a record. Each context only processes its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionContext {
    App,
    Extension,
}

impl ExecutionContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionContext::App => "app",
            ExecutionContext::Extension => "extension",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "app" => Some(ExecutionContext::App),
            "extension" => Some(ExecutionContext::Extension),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadRecord {
    pub id: String,
    pub source: UploadSource,
    pub destination: Destination,
    pub name: String,
    pub size: u64,
    pub conflict: ConflictOption,
    pub priority: i32,
    pub lane: Lane,
    pub retry_budget: u32,
    pub error: Option<UploadErrorKind>,
    pub uploaded_at: Option<i64>,
    pub session_token: Option<String>,
    pub progress: Option<f64>,
    pub owner: ExecutionContext,
    pub remove_source_after_upload: bool,
    pub remote_file_id: Option<i64>,
    pub last_modified_at: Option<i64>,
    pub created_at: i64,
}

impl UploadRecord {
    pub fn new(source: UploadSource, destination: Destination, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            destination,
            name: name.into(),
            size: 0,
            conflict: ConflictOption::Version,
            priority: 0,
            lane: Lane::General,
            retry_budget: DEFAULT_RETRY_BUDGET,
            error: None,
            uploaded_at: None,
            session_token: None,
            progress: None,
            owner: ExecutionContext::App,
            remove_source_after_upload: false,
            remote_file_id: None,
            last_modified_at: None,
            created_at: now_unix(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictOption) -> Self {
        self.conflict = conflict;
        self
    }

    pub fn with_owner(mut self, owner: ExecutionContext) -> Self {
        self.owner = owner;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.uploaded_at.is_none()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_budget > 0
    }

    pub fn is_failed(&self) -> bool {
        self.is_pending() && (self.error.is_some() || self.retry_budget == 0)
    }

    /// Attempts already spent from the retry budget.
    pub fn attempts(&self) -> u32 {
        DEFAULT_RETRY_BUDGET.saturating_sub(self.retry_budget)
    }

    pub fn clear_errors_for_retry(&mut self) {
        self.error = None;
        self.retry_budget = DEFAULT_RETRY_BUDGET;
    }
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
