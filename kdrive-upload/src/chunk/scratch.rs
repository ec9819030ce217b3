use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use super::{Chunk, ChunkError};

/// On-disk home of chunks between reading and transfer:
/// `<root>/<record id>/<chunk number>.part`.
#[derive(Debug, Clone)]
pub struct ScratchStore {
    root: PathBuf,
}

impl ScratchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_dir(&self, record_id: &str) -> PathBuf {
        self.root.join(sanitize(record_id))
    }

    pub fn chunk_path(&self, record_id: &str, number: u64) -> PathBuf {
        self.record_dir(record_id).join(format!("{number:05}.part"))
    }

    pub async fn store(&self, record_id: &str, chunk: &Chunk) -> Result<PathBuf, ChunkError> {
        let target = self.chunk_path(record_id, chunk.number);
        let dir = self.record_dir(record_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(ChunkError::Scratch)?;

        let partial = target.with_extension("part.partial");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(ChunkError::Scratch)?;
        file.write_all(&chunk.data)
            .await
            .map_err(ChunkError::Scratch)?;
        file.flush().await.map_err(ChunkError::Scratch)?;
        file.sync_all().await.map_err(ChunkError::Scratch)?;
        drop(file);

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(ChunkError::Scratch)?;
        Ok(target)
    }

    pub async fn remove(&self, path: &Path) -> Result<(), ChunkError> {
        ignore_missing(tokio::fs::remove_file(path).await).map_err(ChunkError::Scratch)
    }

    pub async fn remove_record(&self, record_id: &str) -> Result<(), ChunkError> {
        ignore_missing(tokio::fs::remove_dir_all(self.record_dir(record_id)).await)
            .map_err(ChunkError::Scratch)
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn sanitize(record_id: &str) -> String {
    record_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
