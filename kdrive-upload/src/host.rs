//! Collaborators supplied by the embedding application. Every trait has a
//! do-nothing implementation so the engine runs standalone.

use std::{io, path::Path, path::PathBuf};

use async_trait::async_trait;
use kdrive_api::RemoteFile;

use crate::record::{Destination, UploadRecord};

/// Turns a library asset handle into a readable file.
#[async_trait]
pub trait AssetResolver: Send + Sync {
    async fn materialize(&self, asset_id: &str, record_id: &str) -> io::Result<PathBuf>;
}

pub struct NoAssetResolver;

#[async_trait]
impl AssetResolver for NoAssetResolver {
    async fn materialize(&self, asset_id: &str, _record_id: &str) -> io::Result<PathBuf> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no resolver for asset {asset_id}"),
        ))
    }
}

pub trait StorageSpace: Send + Sync {
    fn has_room_for(&self, path: &Path, bytes: u64) -> bool;
}

pub struct UnboundedStorage;

impl StorageSpace for UnboundedStorage {
    fn has_room_for(&self, _path: &Path, _bytes: u64) -> bool {
        true
    }
}

/// Local metadata cache of the drive.
#[async_trait]
pub trait DriveFileCache: Send + Sync {
    async fn merge_uploaded(&self, record: &UploadRecord, file: &RemoteFile);
}

pub struct NoFileCache;

#[async_trait]
impl DriveFileCache for NoFileCache {
    async fn merge_uploaded(&self, _record: &UploadRecord, _file: &RemoteFile) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoneSummary {
    Single { name: String, destination: Destination },
    Many { count: usize },
}

/// User-facing notifications. Presentation is up to the host.
pub trait UploadNotifier: Send + Sync {
    fn upload_paused(&self) {}
    fn not_enough_space(&self) {}
    fn quota_exceeded(&self) {}
    fn uploads_failed(&self, _failed: usize, _total: usize) {}
    fn upload_done(&self, _summary: DoneSummary) {}
    fn producer_disabled(&self, _destination: Destination) {}
}

pub struct SilentNotifier;

impl UploadNotifier for SilentNotifier {}

/// Something that enqueues uploads on its own, e.g. a library scanner.
pub trait UploadProducer: Send + Sync {
    /// Drive and parent directory the producer uploads into.
    fn target(&self) -> Option<(i64, i64)>;
    fn disable(&self);
}
