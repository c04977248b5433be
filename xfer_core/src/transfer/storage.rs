//! Flat directory of transferred files.
//!
//! Incoming files are written to a uniquely named staging file inside the
//! root and renamed onto their final name only once every byte has arrived.
//! Readers therefore see either the previous complete file or the new
//! complete file, and two uploads racing on one name cannot interleave.

use crate::error::{Result, TransferError};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::constants::STAGING_PREFIX;
use super::utils::{open_secure_file, sanitize_file_name};

#[derive(Debug, Clone)]
pub struct StorageDirectory {
    root: PathBuf,
}

impl StorageDirectory {
    /// Open a storage root, creating it if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(TransferError::Storage)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client-supplied name to a path inside the root
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf> {
        let name = sanitize_file_name(file_name)?;
        Ok(self.root.join(name))
    }

    /// Open a stored file for reading, with its length.
    ///
    /// `Ok(None)` when the name is valid but nothing is stored under it.
    pub async fn open_existing(&self, file_name: &str) -> Result<Option<(File, u64)>> {
        let path = self.resolve(file_name)?;
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TransferError::Storage(e)),
        };
        let metadata = file.metadata().await.map_err(TransferError::Storage)?;
        if !metadata.is_file() {
            return Ok(None);
        }
        Ok(Some((file, metadata.len())))
    }

    /// Start writing a file that becomes visible on `commit`
    pub async fn begin_write(&self, file_name: &str) -> Result<PendingFile> {
        let target = self.resolve(file_name)?;
        let staging = self
            .root
            .join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4().simple()));
        let file = open_secure_file(&staging)
            .await
            .map_err(TransferError::Storage)?;
        debug!("Staging {:?} for {:?}", staging, target);

        Ok(PendingFile {
            file,
            staging,
            target,
            written: 0,
        })
    }
}

/// A file being received; discarded unless committed
pub struct PendingFile {
    file: File,
    staging: PathBuf,
    target: PathBuf,
    written: u64,
}

impl PendingFile {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(TransferError::Storage)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush, sync and rename onto the target name
    pub async fn commit(mut self) -> Result<PathBuf> {
        let finished = async {
            self.file.flush().await?;
            self.file.sync_all().await?;
            tokio::fs::rename(&self.staging, &self.target).await
        }
        .await;

        match finished {
            Ok(()) => Ok(self.target),
            Err(e) => {
                remove_staging(&self.staging).await;
                Err(TransferError::Storage(e))
            }
        }
    }

    /// Remove the staged bytes
    pub async fn abort(self) {
        drop(self.file);
        remove_staging(&self.staging).await;
    }
}

async fn remove_staging(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to remove staging file {:?}: {}", path, e);
    }
}
