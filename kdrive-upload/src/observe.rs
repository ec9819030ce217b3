use std::{
    collections::HashMap,
    sync::{Arc, RwLock, Weak},
};

use kdrive_api::RemoteFile;

use crate::record::UploadRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountScope {
    Folder { drive_id: i64, parent_directory_id: i64 },
    Drive { drive_id: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileUploaded {
    pub record: UploadRecord,
    pub remote_file: Option<RemoteFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountChanged {
    pub scope: CountScope,
    pub count: u64,
}

type FileCallback = Arc<dyn Fn(&FileUploaded) + Send + Sync>;
type CountCallback = Arc<dyn Fn(&CountChanged) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    files: HashMap<u64, (Option<String>, FileCallback)>,
    counts: HashMap<u64, (CountScope, CountCallback)>,
}

/// Publish/subscribe hub for upload events. Callbacks run on the publishing
/// task, outside the registry lock, so they may subscribe or unsubscribe.
#[derive(Clone, Default)]
pub struct ObserverHub {
    registry: Arc<RwLock<Registry>>,
}

/// Keeps a callback registered; dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<RwLock<Registry>>,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        // Callbacks may own subscriptions; drop them after the lock is released.
        let _removed = match registry.write() {
            Ok(mut registry) => (
                registry.files.remove(&self.id),
                registry.counts.remove(&self.id),
            ),
            Err(_) => return,
        };
    }
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// `record_id = None` observes every upload.
    pub fn observe_file_uploaded<F>(&self, record_id: Option<String>, callback: F) -> Subscription
    where
        F: Fn(&FileUploaded) + Send + Sync + 'static,
    {
        self.subscribe(|registry, id| {
            registry.files.insert(id, (record_id, Arc::new(callback)));
        })
    }

    pub fn observe_folder_count<F>(
        &self,
        drive_id: i64,
        parent_directory_id: i64,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&CountChanged) + Send + Sync + 'static,
    {
        let scope = CountScope::Folder {
            drive_id,
            parent_directory_id,
        };
        self.subscribe(|registry, id| {
            registry.counts.insert(id, (scope, Arc::new(callback)));
        })
    }

    pub fn observe_drive_count<F>(&self, drive_id: i64, callback: F) -> Subscription
    where
        F: Fn(&CountChanged) + Send + Sync + 'static,
    {
        let scope = CountScope::Drive { drive_id };
        self.subscribe(|registry, id| {
            registry.counts.insert(id, (scope, Arc::new(callback)));
        })
    }

    pub fn publish_file_uploaded(&self, event: &FileUploaded) {
        let callbacks: Vec<FileCallback> = match self.registry.read() {
            Ok(registry) => registry
                .files
                .values()
                .filter(|(filter, _)| {
                    filter
                        .as_deref()
                        .is_none_or(|record_id| record_id == event.record.id)
                })
                .map(|(_, callback)| Arc::clone(callback))
                .collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn publish_count(&self, event: &CountChanged) {
        let callbacks: Vec<CountCallback> = match self.registry.read() {
            Ok(registry) => registry
                .counts
                .values()
                .filter(|(scope, _)| *scope == event.scope)
                .map(|(_, callback)| Arc::clone(callback))
                .collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .read()
            .map(|registry| registry.files.len() + registry.counts.len())
            .unwrap_or_default()
    }

    fn subscribe(&self, insert: impl FnOnce(&mut Registry, u64)) -> Subscription {
        let mut id = 0;
        if let Ok(mut registry) = self.registry.write() {
            registry.next_id += 1;
            id = registry.next_id;
            insert(&mut registry, id);
        }
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }
}
