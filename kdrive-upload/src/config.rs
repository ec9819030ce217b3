use std::{env, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use kdrive_api::DriveClient;
use tracing::info;

use crate::backoff::Backoff;
use crate::chunk::{ChunkPolicy, ScratchStore};
use crate::keepalive::{DeadlineKeepAlive, KeepAlive, NoKeepAlive};
use crate::operation::DEFAULT_CHUNK_PARALLELISM;
use crate::parallelism::MEDIUM_PARALLELISM;
use crate::record::ExecutionContext;
use crate::service::{UploadService, UploadServiceBuilder};
use crate::store::RecordStore;
use crate::transfer::{HttpTransferExecutor, TransferConfig, TransferJournal};

const DEFAULT_API_URL: &str = "https://api.infomaniak.com";

#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    pub api_url: String,
    pub db_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub parallelism: usize,
    pub chunk_parallelism: usize,
    pub transfer_limit: usize,
    pub auto_retry: bool,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// `None` runs without a soft deadline.
    pub keep_alive: Option<Duration>,
    pub constrained: bool,
    pub context: ExecutionContext,
}

impl UploadConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = match lookup("KDRIVE_UPLOAD_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => dirs::data_dir()
                .context("no user data directory")?
                .join("kdrive")
                .join("uploads.db"),
        };
        let scratch_dir = match lookup("KDRIVE_UPLOAD_SCRATCH_DIR") {
            Some(path) => PathBuf::from(path),
            None => dirs::cache_dir()
                .context("no user cache directory")?
                .join("kdrive")
                .join("upload-chunks"),
        };
        let context = match lookup("KDRIVE_UPLOAD_CONTEXT") {
            Some(value) => ExecutionContext::parse(value.trim())
                .ok_or_else(|| anyhow!("unknown execution context: {value}"))?,
            None => ExecutionContext::App,
        };
        let keep_alive = read_u64(&lookup, "KDRIVE_UPLOAD_KEEPALIVE_SECS", 0);

        Ok(Self {
            api_url: lookup("KDRIVE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            db_path,
            scratch_dir,
            parallelism: read_limit(&lookup, "KDRIVE_UPLOAD_PARALLELISM", MEDIUM_PARALLELISM),
            chunk_parallelism: read_limit(
                &lookup,
                "KDRIVE_UPLOAD_CHUNK_PARALLELISM",
                DEFAULT_CHUNK_PARALLELISM,
            ),
            transfer_limit: read_limit(&lookup, "KDRIVE_UPLOAD_TRANSFER_LIMIT", 4),
            auto_retry: read_flag(&lookup, "KDRIVE_UPLOAD_AUTO_RETRY", true),
            retry_base: Duration::from_millis(read_u64(&lookup, "KDRIVE_UPLOAD_RETRY_BASE_MS", 250)),
            retry_max: Duration::from_millis(read_u64(
                &lookup,
                "KDRIVE_UPLOAD_RETRY_MAX_MS",
                10_000,
            )),
            keep_alive: (keep_alive > 0).then(|| Duration::from_secs(keep_alive)),
            constrained: read_flag(&lookup, "KDRIVE_UPLOAD_CONSTRAINED", false),
            context,
        })
    }

    pub fn policy(&self) -> ChunkPolicy {
        if self.constrained {
            ChunkPolicy::constrained()
        } else {
            ChunkPolicy::default()
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            upload_concurrency: self.transfer_limit,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.retry_base, self.retry_max.max(self.retry_base), true)
    }

    pub fn keep_alive(&self) -> Arc<dyn KeepAlive> {
        match self.keep_alive {
            Some(deadline) => Arc::new(DeadlineKeepAlive::new(deadline)),
            None => Arc::new(NoKeepAlive),
        }
    }

    /// Opens the record store and the HTTP stack and returns a configured
    /// builder together with the completion stream for `UploadService::start`.
    pub async fn builder(
        &self,
        token: &str,
    ) -> anyhow::Result<(UploadServiceBuilder, crate::transfer::CompletionReceiver)> {
        let store = RecordStore::open(&self.db_path)
            .await
            .with_context(|| format!("failed to open {}", self.db_path.display()))?;
        let client = DriveClient::with_base_url(&self.api_url, token)
            .with_context(|| format!("invalid API url {}", self.api_url))?;
        let journal = TransferJournal::new(store.pool().clone());
        let (transfers, completions) = HttpTransferExecutor::new(self.transfer_config(), journal);

        let builder = UploadService::builder(
            Arc::new(store),
            Arc::new(client),
            Arc::new(transfers),
            ScratchStore::new(self.scratch_dir.clone()),
        )
        .keep_alive(self.keep_alive())
        .policy(self.policy())
        .chunk_parallelism(self.chunk_parallelism)
        .parallelism(self.parallelism)
        .context(self.context)
        .auto_retry(self.auto_retry)
        .backoff(self.backoff());
        Ok((builder, completions))
    }

    /// Builds and starts a service, then recovers what a previous run left.
    pub async fn start_service(&self, token: &str) -> anyhow::Result<Arc<UploadService>> {
        let (builder, completions) = self.builder(token).await?;
        let service = builder.build();
        service.start(completions);
        let reconnected = service
            .reconnect_transfers()
            .await
            .context("failed to reconnect transfers")?;
        let admitted = service
            .rebuild_upload_queue()
            .await
            .context("failed to rebuild the upload queue")?;
        info!(
            context = self.context.as_str(),
            reconnected, admitted, "upload service started"
        );
        Ok(service)
    }
}

fn read_limit<F>(lookup: &F, name: &str, default: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_flag<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name).map(|v| v.trim().to_ascii_lowercase()) {
        Some(value) if matches!(value.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(value) if matches!(value.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
