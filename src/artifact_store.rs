use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{fs, io::AsyncWriteExt, time::sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::ErrorArtifact;

const READ_ATTEMPTS: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Per-token files under the shared working directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create work dir at {}", self.root.display()))
    }

    pub fn input_path(&self, token: &str) -> PathBuf {
        self.root.join(format!("{token}.json"))
    }

    /// Where the external program is told to write; promoted to the result
    /// path by the completion handler.
    pub fn output_path(&self, token: &str) -> PathBuf {
        self.root.join(format!("{token}-output.json"))
    }

    pub fn result_path(&self, token: &str) -> PathBuf {
        self.root.join(format!("{token}-result.json"))
    }

    pub fn error_path(&self, token: &str) -> PathBuf {
        self.root.join(format!("{token}-error.json"))
    }

    pub async fn write_input<T: Serialize>(&self, token: &str, input: &T) -> Result<()> {
        let bytes = serde_json::to_vec(input).context("Failed to encode analysis input")?;
        atomic_write(&self.input_path(token), &bytes).await
    }

    pub async fn write_result(&self, token: &str, result: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(result).context("Failed to encode analysis result")?;
        atomic_write(&self.result_path(token), &bytes).await
    }

    pub async fn write_error(&self, token: &str, artifact: &ErrorArtifact) -> Result<()> {
        let bytes = serde_json::to_vec(artifact).context("Failed to encode error artifact")?;
        atomic_write(&self.error_path(token), &bytes).await
    }

    pub async fn read_result(&self, token: &str) -> Result<Option<serde_json::Value>> {
        read_json(&self.result_path(token)).await
    }

    pub async fn read_error(&self, token: &str) -> Result<Option<ErrorArtifact>> {
        read_json(&self.error_path(token)).await
    }

    pub async fn has_input(&self, token: &str) -> bool {
        file_exists(&self.input_path(token)).await
    }

    pub async fn results_available(&self, token: &str) -> bool {
        file_exists(&self.result_path(token)).await
    }

    /// Deletes regular files last modified before `now - retention`.
    pub async fn purge_older_than(&self, retention: Duration) -> Result<usize> {
        let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
            return Ok(0);
        };

        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to list {}", self.root.display()))?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if modified < cutoff {
                delete_file_if_exists(&entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Tokens are generated server-side; anything else never names a file.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 64
        && token
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
}

/// Writes to a sibling temp file and renames it into place, so readers of
/// `path` see either nothing or the complete contents.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no file name", path.display()))?;
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = write_and_sync(&temp_path, bytes).await;
    let result = match written {
        Ok(()) => fs::rename(&temp_path, path)
            .await
            .with_context(|| format!("Failed to move temp file into {}", path.display())),
        Err(err) => Err(err),
    };

    if result.is_err() {
        if let Err(err) = delete_file_if_exists(&temp_path).await {
            warn!("Failed to clean up temp file {}: {err:#}", temp_path.display());
        }
    }
    result
}

async fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("Failed to sync {}", path.display()))?;
    Ok(())
}

/// Reads a file, treating absence as `None` and retrying other failures a
/// few times before giving up.
pub async fn read_with_retry(path: &Path) -> Result<Option<Vec<u8>>> {
    let mut attempt = 1;
    loop {
        match fs::read(path).await {
            Ok(bytes) => return Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) if attempt < READ_ATTEMPTS => {
                debug!(
                    path = %path.display(),
                    attempt,
                    "Read attempt failed, retrying: {err}"
                );
                attempt += 1;
                sleep(READ_RETRY_DELAY).await;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        }
    }
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let Some(bytes) = read_with_retry(path).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    Ok(Some(value))
}

pub async fn file_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}
