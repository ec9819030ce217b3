use std::{
    fs,
    path::{Path, PathBuf},
};

use kdrive_api::ConflictOption;
use sqlx::{
    QueryBuilder, Row, Sqlite, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::error::UploadErrorKind;
use crate::record::{
    DEFAULT_RETRY_BUDGET, Destination, ExecutionContext, Lane, UploadRecord, UploadSource,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Upper bound on rows touched by one bulk statement.
pub const BATCH_SIZE: usize = 100;

const COLUMNS: &str = "id, source_kind, source_value, parent_directory_id, drive_id, user_id, name, size, conflict, priority, lane, retry_budget, error, uploaded_at, session_token, progress, owner, remove_source, remote_file_id, last_modified_at, created_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("upload record {0} does not exist")]
    RecordMissing(String),
    #[error("invalid {column} value: {value}")]
    InvalidValue { column: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordState {
    #[default]
    Any,
    /// Not uploaded yet.
    Pending,
    /// Not uploaded yet and budget left.
    Retryable,
    /// Not uploaded, and either carrying an error or out of budget.
    Failed,
    Uploaded,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub user_id: Option<i64>,
    /// Empty matches every drive.
    pub drive_ids: Vec<i64>,
    pub parent_directory_id: Option<i64>,
    pub owner: Option<ExecutionContext>,
    pub lane: Option<Lane>,
    pub state: RecordState,
}

impl RecordFilter {
    pub fn in_parent(parent_directory_id: i64, user_id: i64, drive_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            drive_ids: vec![drive_id],
            parent_directory_id: Some(parent_directory_id),
            ..Self::default()
        }
    }

    pub fn in_drive(user_id: i64, drive_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            drive_ids: vec![drive_id],
            ..Self::default()
        }
    }

    pub fn owned_by(mut self, owner: ExecutionContext) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn in_lane(mut self, lane: Lane) -> Self {
        self.lane = Some(lane);
        self
    }

    pub fn with_state(mut self, state: RecordState) -> Self {
        self.state = state;
        self
    }

    fn push_where(&self, query: &mut QueryBuilder<'_, Sqlite>) {
        query.push(" WHERE 1 = 1");
        if let Some(user_id) = self.user_id {
            query.push(" AND user_id = ").push_bind(user_id);
        }
        if !self.drive_ids.is_empty() {
            query.push(" AND drive_id IN (");
            let mut ids = query.separated(", ");
            for drive_id in &self.drive_ids {
                ids.push_bind(*drive_id);
            }
            ids.push_unseparated(")");
        }
        if let Some(parent) = self.parent_directory_id {
            query.push(" AND parent_directory_id = ").push_bind(parent);
        }
        if let Some(owner) = self.owner {
            query.push(" AND owner = ").push_bind(owner.as_str());
        }
        if let Some(lane) = self.lane {
            query.push(" AND lane = ").push_bind(lane.as_str());
        }
        query.push(match self.state {
            RecordState::Any => "",
            RecordState::Pending => " AND uploaded_at IS NULL",
            RecordState::Retryable => " AND uploaded_at IS NULL AND retry_budget > 0",
            RecordState::Failed => {
                " AND uploaded_at IS NULL AND (error IS NOT NULL OR retry_budget <= 0)"
            }
            RecordState::Uploaded => " AND uploaded_at IS NOT NULL",
        });
    }
}

/// Persistent home of upload records. Every mutation goes through a single
/// writer lock, so transactions never interleave or nest.
pub struct RecordStore {
    pool: SqlitePool,
    writer: Mutex<()>,
}

impl RecordStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Mutex::new(()),
        }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()?).await
    }

    /// Single-connection in-memory database; the connection is never
    /// recycled because doing so would drop the data.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert(&self, record: &UploadRecord) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        write_record(&self.pool, record).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<UploadRecord>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM uploads WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Applies `mutate` to the stored record inside one transaction and
    /// returns the written snapshot. `None` when the record is gone.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Option<UploadRecord>, StoreError>
    where
        F: FnOnce(&mut UploadRecord) + Send,
    {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {COLUMNS} FROM uploads WHERE id = ?1");
        let Some(row) = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        let mut record = record_from_row(&row)?;
        mutate(&mut record);
        write_record(&mut *tx, &record).await?;
        tx.commit().await?;
        Ok(Some(record))
    }

    pub async fn update_existing<F>(&self, id: &str, mutate: F) -> Result<UploadRecord, StoreError>
    where
        F: FnOnce(&mut UploadRecord) + Send,
    {
        self.update(id, mutate)
            .await?
            .ok_or_else(|| StoreError::RecordMissing(id.to_string()))
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _writer = self.writer.lock().await;
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes every matching record, in batches, and returns their ids.
    pub async fn delete_matching(&self, filter: &RecordFilter) -> Result<Vec<String>, StoreError> {
        let ids = self.list_ids(filter).await?;
        let _writer = self.writer.lock().await;
        for batch in ids.chunks(BATCH_SIZE) {
            let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM uploads WHERE id IN (");
            push_id_list(&mut query, batch);
            query.build().execute(&self.pool).await?;
        }
        Ok(ids)
    }

    /// Highest priority first, then oldest first.
    pub async fn list(&self, filter: &RecordFilter) -> Result<Vec<UploadRecord>, StoreError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM uploads"));
        filter.push_where(&mut query);
        query.push(" ORDER BY priority DESC, created_at ASC, id ASC");
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn list_ids(&self, filter: &RecordFilter) -> Result<Vec<String>, StoreError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT id FROM uploads");
        filter.push_where(&mut query);
        query.push(" ORDER BY created_at ASC, id ASC");
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(StoreError::from))
            .collect()
    }

    pub async fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM uploads");
        filter.push_where(&mut query);
        let row = query.build().fetch_one(&self.pool).await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    /// Clears the error and restores the retry budget of `ids`.
    pub async fn clear_errors_for_retry(&self, ids: &[String]) -> Result<u64, StoreError> {
        let _writer = self.writer.lock().await;
        let mut updated = 0;
        for batch in ids.chunks(BATCH_SIZE) {
            let mut query = QueryBuilder::<Sqlite>::new("UPDATE uploads SET error = NULL, retry_budget = ");
            query.push_bind(i64::from(DEFAULT_RETRY_BUDGET));
            query.push(" WHERE uploaded_at IS NULL AND id IN (");
            push_id_list(&mut query, batch);
            updated += query.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(updated)
    }

    /// Pending records of `owner` whose error is one of `kinds`.
    pub async fn ids_with_errors(
        &self,
        owner: ExecutionContext,
        kinds: &[UploadErrorKind],
    ) -> Result<Vec<String>, StoreError> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id FROM uploads WHERE uploaded_at IS NULL AND owner = ",
        );
        query.push_bind(owner.as_str());
        query.push(" AND error IN (");
        let mut list = query.separated(", ");
        for kind in kinds {
            list.push_bind(kind.as_str());
        }
        list.push_unseparated(") ORDER BY created_at ASC");
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(StoreError::from))
            .collect()
    }

    /// Session tokens do not survive a restart.
    pub async fn clear_session_tokens(&self, owner: ExecutionContext) -> Result<u64, StoreError> {
        let _writer = self.writer.lock().await;
        let result = sqlx::query(
            "UPDATE uploads SET session_token = NULL, progress = NULL WHERE owner = ?1 AND uploaded_at IS NULL",
        )
        .bind(owner.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn push_id_list(query: &mut QueryBuilder<'_, Sqlite>, ids: &[String]) {
    let mut list = query.separated(", ");
    for id in ids {
        list.push_bind(id.clone());
    }
    list.push_unseparated(")");
}

async fn write_record<'e, E>(executor: E, record: &UploadRecord) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO uploads (
            id, source_kind, source_value, parent_directory_id, drive_id, user_id, name, size,
            conflict, priority, lane, retry_budget, error, uploaded_at, session_token, progress,
            owner, remove_source, remote_file_id, last_modified_at, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
        ON CONFLICT(id) DO UPDATE SET
            source_kind = excluded.source_kind,
            source_value = excluded.source_value,
            parent_directory_id = excluded.parent_directory_id,
            drive_id = excluded.drive_id,
            user_id = excluded.user_id,
            name = excluded.name,
            size = excluded.size,
            conflict = excluded.conflict,
            priority = excluded.priority,
            lane = excluded.lane,
            retry_budget = excluded.retry_budget,
            error = excluded.error,
            uploaded_at = excluded.uploaded_at,
            session_token = excluded.session_token,
            progress = excluded.progress,
            owner = excluded.owner,
            remove_source = excluded.remove_source,
            remote_file_id = excluded.remote_file_id,
            last_modified_at = excluded.last_modified_at",
    )
    .bind(&record.id)
    .bind(record.source.kind_str())
    .bind(record.source.value())
    .bind(record.destination.parent_directory_id)
    .bind(record.destination.drive_id)
    .bind(record.destination.user_id)
    .bind(&record.name)
    .bind(i64::try_from(record.size).unwrap_or(i64::MAX))
    .bind(record.conflict.as_str())
    .bind(record.priority)
    .bind(record.lane.as_str())
    .bind(i64::from(record.retry_budget))
    .bind(record.error.map(|kind| kind.as_str()))
    .bind(record.uploaded_at)
    .bind(&record.session_token)
    .bind(record.progress)
    .bind(record.owner.as_str())
    .bind(record.remove_source_after_upload)
    .bind(record.remote_file_id)
    .bind(record.last_modified_at)
    .bind(record.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<UploadRecord, StoreError> {
    let source_kind: String = row.try_get("source_kind")?;
    let source_value: String = row.try_get("source_value")?;
    let source = UploadSource::parse(&source_kind, source_value)
        .ok_or_else(|| invalid("source_kind", source_kind))?;

    let conflict: String = row.try_get("conflict")?;
    let lane: String = row.try_get("lane")?;
    let owner: String = row.try_get("owner")?;
    let error: Option<String> = row.try_get("error")?;
    let size: i64 = row.try_get("size")?;
    let retry_budget: i64 = row.try_get("retry_budget")?;

    Ok(UploadRecord {
        id: row.try_get("id")?,
        source,
        destination: Destination {
            parent_directory_id: row.try_get("parent_directory_id")?,
            drive_id: row.try_get("drive_id")?,
            user_id: row.try_get("user_id")?,
        },
        name: row.try_get("name")?,
        size: u64::try_from(size).unwrap_or_default(),
        conflict: ConflictOption::parse(&conflict).ok_or_else(|| invalid("conflict", conflict))?,
        priority: row.try_get("priority")?,
        lane: Lane::parse(&lane).ok_or_else(|| invalid("lane", lane))?,
        retry_budget: u32::try_from(retry_budget.max(0)).unwrap_or(u32::MAX),
        error: match error {
            Some(value) => {
                Some(UploadErrorKind::parse(&value).ok_or_else(|| invalid("error", value))?)
            }
            None => None,
        },
        uploaded_at: row.try_get("uploaded_at")?,
        session_token: row.try_get("session_token")?,
        progress: row.try_get("progress")?,
        owner: ExecutionContext::parse(&owner).ok_or_else(|| invalid("owner", owner))?,
        remove_source_after_upload: row.try_get("remove_source")?,
        remote_file_id: row.try_get("remote_file_id")?,
        last_modified_at: row.try_get("last_modified_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn invalid(column: &'static str, value: String) -> StoreError {
    StoreError::InvalidValue { column, value }
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("kdrive");
    path.push("uploads.db");
    Ok(path)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
