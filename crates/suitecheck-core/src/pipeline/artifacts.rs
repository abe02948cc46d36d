//! Write-once artifact store shared by the jobs of one pipeline run.
//!
//! Layout: `<root>/<name>` plus `<root>/<name>.meta.json` holding the run id
//! and expiry. A name can be written once; a second upload under the same
//! name is an error. Uploads from a cancelled run are refused.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::concurrency::RunHandle;

const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMeta {
    pub name: String,
    pub run_id: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    retention_days: u32,
}

impl ArtifactStore {
    pub fn new(root: impl AsRef<Path>, retention_days: u32) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            retention_days,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> HarnessResult<PathBuf> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
            || name.ends_with(META_SUFFIX)
        {
            return Err(HarnessError::Artifact(format!("invalid artifact name '{}'", name)));
        }
        Ok(self.root.join(name))
    }

    /// Store `bytes` under `name` for the run behind `run`.
    pub async fn upload(&self, run: &RunHandle, name: &str, bytes: &[u8]) -> HarnessResult<ArtifactMeta> {
        if run.is_cancelled() {
            return Err(HarnessError::Cancelled(run.run_id.clone()));
        }
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.root).await?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(HarnessError::Artifact(format!("artifact '{}' already exists", name)));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(bytes).await?;
        file.flush().await?;

        let now = Utc::now();
        let meta = ArtifactMeta {
            name: name.to_string(),
            run_id: run.run_id.clone(),
            size: bytes.len() as u64,
            uploaded_at: now,
            expires_at: now + ChronoDuration::days(i64::from(self.retention_days)),
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| HarnessError::Artifact(format!("serialize metadata: {}", e)))?;
        fs::write(self.root.join(format!("{}{}", name, META_SUFFIX)), json).await?;

        tracing::info!("[ArtifactStore] Uploaded {} ({} bytes)", name, meta.size);
        Ok(meta)
    }

    pub async fn download(&self, name: &str) -> HarnessResult<Vec<u8>> {
        let path = self.path_for(name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HarnessError::Artifact(format!("artifact '{}' not found", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn meta(&self, name: &str) -> HarnessResult<ArtifactMeta> {
        self.path_for(name)?;
        let raw = fs::read(self.root.join(format!("{}{}", name, META_SUFFIX))).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| HarnessError::Artifact(format!("bad metadata for '{}': {}", name, e)))
    }

    /// Artifact names starting with `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> HarnessResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) && !name.ends_with(META_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Gzipped tarball of `dir`, rooted at `label/`.
pub async fn snapshot_dir(dir: &Path, label: &str) -> HarnessResult<Vec<u8>> {
    let dir = dir.to_path_buf();
    let label = label.to_string();
    tokio::task::spawn_blocking(move || snapshot_dir_sync(&dir, &label))
        .await
        .map_err(|e| HarnessError::Artifact(format!("snapshot task failed: {}", e)))?
}

fn snapshot_dir_sync(dir: &Path, label: &str) -> HarnessResult<Vec<u8>> {
    let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);
    if dir.is_dir() {
        builder
            .append_dir_all(label, dir)
            .map_err(|e| HarnessError::Artifact(format!("archive {}: {}", dir.display(), e)))?;
    }
    let gz = builder
        .into_inner()
        .map_err(|e| HarnessError::Artifact(format!("finish archive: {}", e)))?;
    gz.finish()
        .map_err(|e| HarnessError::Artifact(format!("compress archive: {}", e)))
}
