//! Object store capability.
//!
//! The pipelines talk to the bucket through four operations: list, upload,
//! download, delete. The shipped binding is a flat directory — typically a
//! remotely mounted bucket path — with skip-if-same-size resumable uploads.
//! Cloud SDK bindings plug in behind the same trait.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Result, SyncError};

/// One object visible in the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Flat object name.
    pub name: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time, when the backend reports one.
    pub mtime: Option<SystemTime>,
}

/// Capability over the transport bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List the objects currently in the bucket.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] on backend failure.
    async fn list(&self) -> Result<Vec<ObjectInfo>>;

    /// Upload a local file under `name`, resuming by skipping objects that
    /// are already present with the same size.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] on backend failure.
    async fn upload(&self, local: &Path, name: &str) -> Result<()>;

    /// Download the object `name` into `local`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] on backend failure.
    async fn download(&self, name: &str, local: &Path) -> Result<()>;

    /// Delete the object `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] on backend failure.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Directory-backed bucket binding.
pub struct DirBucket {
    root: PathBuf,
}

impl DirBucket {
    /// Bind to `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Io`] if the directory cannot be created.
    pub fn create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

fn transport_err(context: &str, err: &std::io::Error) -> SyncError {
    SyncError::Transport(format!("{context}: {err}"))
}

#[async_trait]
impl ObjectStore for DirBucket {
    async fn list(&self) -> Result<Vec<ObjectInfo>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| transport_err("list bucket", &e))?;
        let mut objects = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| transport_err("list bucket", &e))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| transport_err("stat object", &e))?;
            if !meta.is_file() {
                continue;
            }
            objects.push(ObjectInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                mtime: meta.modified().ok(),
            });
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn upload(&self, local: &Path, name: &str) -> Result<()> {
        let target = self.object_path(name);
        let local_size = fs::metadata(local)
            .await
            .map_err(|e| transport_err("stat upload source", &e))?
            .len();
        if let Ok(meta) = fs::metadata(&target).await {
            if meta.len() == local_size {
                debug!(object = name, size = local_size, "Object already present, skipping");
                return Ok(());
            }
        }
        // Stage under a temporary name so a partial upload is never listed.
        let staging = self.object_path(&format!(".{name}.partial"));
        fs::copy(local, &staging)
            .await
            .map_err(|e| transport_err("upload object", &e))?;
        fs::rename(&staging, &target)
            .await
            .map_err(|e| transport_err("commit object", &e))?;
        info!(object = name, size = local_size, "Uploaded object");
        Ok(())
    }

    async fn download(&self, name: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| transport_err("create download dir", &e))?;
        }
        let source = self.object_path(name);
        fs::copy(&source, local)
            .await
            .map_err(|e| transport_err("download object", &e))?;
        debug!(object = name, dest = %local.display(), "Downloaded object");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        fs::remove_file(self.object_path(name))
            .await
            .map_err(|e| transport_err("delete object", &e))?;
        debug!(object = name, "Deleted object");
        Ok(())
    }
}
