//! Single-slot on-disk copy of the last downloaded document.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Fixed path that every sync overwrites. Readers never observe a half-written file.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    path: PathBuf,
}

impl ArtifactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn staging_dir(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Write `bytes` to a hidden sibling, fsync it, then rename over the slot.
    pub async fn replace(&self, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let dir = self.staging_dir();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating artifact directory {}", dir.display()))?;

        let staged = dir.join(format!(".{}.partial", Uuid::new_v4()));
        if let Err(err) = write_synced(&staged, bytes).await {
            let _ = fs::remove_file(&staged).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&staged, &self.path).await {
            let _ = fs::remove_file(&staged).await;
            return Err(err).with_context(|| {
                format!("moving {} into {}", staged.display(), self.path.display())
            });
        }

        Ok(StoredArtifact {
            content_hash: Self::content_hash(bytes),
            path: self.path.clone(),
            byte_size: bytes.len(),
        })
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", path.display()))
}
