use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::record::{ExecutionContext, UploadRecord};

/// Scoped permission to keep running. The expiration token fires when the
/// host wants the work to stop soon; dropping the lease releases it.
pub struct KeepAliveLease {
    expiration: CancellationToken,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl KeepAliveLease {
    pub fn new(expiration: CancellationToken, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            expiration,
            release: Some(Box::new(release)),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            expiration: CancellationToken::new(),
            release: None,
        }
    }

    pub fn expiration(&self) -> &CancellationToken {
        &self.expiration
    }

    pub fn is_expired(&self) -> bool {
        self.expiration.is_cancelled()
    }
}

impl Drop for KeepAliveLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

pub trait KeepAlive: Send + Sync {
    fn begin(&self, activity: &str) -> KeepAliveLease;
}

pub struct NoKeepAlive;

impl KeepAlive for NoKeepAlive {
    fn begin(&self, _activity: &str) -> KeepAliveLease {
        KeepAliveLease::unbounded()
    }
}

/// Expires every lease after a fixed soft deadline.
pub struct DeadlineKeepAlive {
    deadline: Duration,
}

impl DeadlineKeepAlive {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

impl KeepAlive for DeadlineKeepAlive {
    fn begin(&self, activity: &str) -> KeepAliveLease {
        let expiration = CancellationToken::new();
        let token = expiration.clone();
        let deadline = self.deadline;
        let activity = activity.to_string();
        let watchdog: JoinHandle<()> = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            debug!(activity = %activity, "keep-alive deadline reached");
            token.cancel();
        });
        KeepAliveLease::new(expiration, move || watchdog.abort())
    }
}

/// Leases expired on demand by the embedding host, e.g. from a platform
/// expiration callback.
#[derive(Clone, Default)]
pub struct HostKeepAlive {
    next_id: Arc<AtomicU64>,
    leases: Arc<Mutex<HashMap<String, Vec<(u64, CancellationToken)>>>>,
}

impl HostKeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expire(&self, activity: &str) -> usize {
        let tokens = self
            .leases
            .lock()
            .ok()
            .and_then(|mut leases| leases.remove(activity))
            .unwrap_or_default();
        for (_, token) in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    pub fn expire_all(&self) -> usize {
        let tokens: Vec<(u64, CancellationToken)> = self
            .leases
            .lock()
            .map(|mut leases| leases.drain().flat_map(|(_, tokens)| tokens).collect())
            .unwrap_or_default();
        for (_, token) in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    pub fn active(&self) -> usize {
        self.leases
            .lock()
            .map(|leases| leases.values().map(Vec::len).sum())
            .unwrap_or_default()
    }
}

impl KeepAlive for HostKeepAlive {
    fn begin(&self, activity: &str) -> KeepAliveLease {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let expiration = CancellationToken::new();
        if let Ok(mut leases) = self.leases.lock() {
            leases
                .entry(activity.to_string())
                .or_default()
                .push((id, expiration.clone()));
        }
        let leases = Arc::clone(&self.leases);
        let activity = activity.to_string();
        KeepAliveLease::new(expiration, move || {
            if let Ok(mut leases) = leases.lock() {
                if let Some(tokens) = leases.get_mut(&activity) {
                    tokens.retain(|(held, _)| *held != id);
                    if tokens.is_empty() {
                        leases.remove(&activity);
                    }
                }
            }
        })
    }
}

/// Moves an expiring upload to a longer-lived transport.
#[async_trait]
pub trait BackgroundHandoff: Send + Sync {
    /// Returns the context that now owns the record, or `None` if declined.
    async fn hand_off(&self, record: &UploadRecord) -> Option<ExecutionContext>;
}

pub struct NoHandoff;

#[async_trait]
impl BackgroundHandoff for NoHandoff {
    async fn hand_off(&self, _record: &UploadRecord) -> Option<ExecutionContext> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_lease_expires_after_deadline() {
        let keep_alive = DeadlineKeepAlive::new(Duration::from_secs(30));
        let lease = keep_alive.begin("upload");
        assert!(!lease.is_expired());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(lease.is_expired());
    }

    #[tokio::test]
    async fn host_leases_expire_on_demand_and_release_on_drop() {
        let host = HostKeepAlive::new();
        let first = host.begin("upload");
        let second = host.begin("upload");
        let other = host.begin("scan");
        assert_eq!(host.active(), 3);

        drop(second);
        assert_eq!(host.active(), 2);

        assert_eq!(host.expire("upload"), 1);
        assert!(first.is_expired());
        assert!(!other.is_expired());

        assert_eq!(host.expire_all(), 1);
        assert!(other.is_expired());
        assert_eq!(host.active(), 0);
    }

    #[tokio::test]
    async fn no_keep_alive_never_expires() {
        let lease = NoKeepAlive.begin("upload");
        assert!(!lease.is_expired());
        assert!(NoHandoff.hand_off(&crate::test_support::record("r", 1)).await.is_none());
    }
}
