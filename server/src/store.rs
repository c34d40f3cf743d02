//! Artifact storage – one directory per session slug holding
//! `recording.json` and, optionally, screenshot files next to it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use rewind_common::protocol::RecordingInfo;
use rewind_common::recording::Recording;

const RECORDING_FILE: &str = "recording.json";

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

/// Result of persisting a freshly captured recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    /// `true` when an artifact with the same name was replaced.
    pub updated: bool,
    pub removed_screenshots: usize,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Store { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn recording_path(&self, name: &str) -> PathBuf {
        self.session_dir(name).join(RECORDING_FILE)
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.recording_path(name))
            .await
            .unwrap_or(false)
    }

    /// Persist a new capture under `name`.  An existing artifact is fully
    /// replaced, and screenshots taken of it are removed first.
    pub async fn save(&self, name: &str, recording: &Recording) -> Result<SaveOutcome> {
        let dir = self.session_dir(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Cannot create {}", dir.display()))?;

        let updated = self.exists(name).await;
        let removed_screenshots = if updated {
            info!("Updating {name}");
            purge_screenshots(&dir).await?
        } else {
            0
        };
        if removed_screenshots > 0 {
            info!("Removed {removed_screenshots} old screenshot(s)");
        }

        self.write(name, recording).await?;
        Ok(SaveOutcome {
            updated,
            removed_screenshots,
        })
    }

    /// Overwrite the artifact for `name` as-is.
    pub async fn write(&self, name: &str, recording: &Recording) -> Result<()> {
        let path = self.recording_path(name);
        let json = serde_json::to_vec_pretty(recording).context("Serialize recording")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Cannot write {}", path.display()))
    }

    pub async fn load(&self, name: &str) -> Result<Recording> {
        let path = self.recording_path(name);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("Cannot parse {}", path.display()))
    }

    /// Remove the whole session directory.  Returns `false` if there was
    /// nothing to remove.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        if !self.exists(name).await {
            return Ok(false);
        }
        let dir = self.session_dir(name);
        tokio::fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("Cannot remove {}", dir.display()))?;
        Ok(true)
    }

    /// Stored recordings, sorted by name.
    pub fn list(&self) -> Result<Vec<RecordingInfo>> {
        if !self.root.exists() {
            return Ok(vec![]);
        }

        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("Cannot list {}", self.root.display()))?;

        let mut recordings = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path().join(RECORDING_FILE);
            let Ok(meta) = path.metadata() else {
                continue;
            };
            let modified = meta
                .modified()
                .ok()
                .and_then(|m| m.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
                .and_then(|d| chrono::DateTime::from_timestamp(d.as_secs() as i64, 0))
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default();

            recordings.push(RecordingInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                size: meta.len(),
                modified,
            });
        }

        recordings.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(recordings)
    }
}

/// Delete `*.png` files in a session directory.
async fn purge_screenshots(dir: &Path) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Cannot list {}", dir.display()))?;

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("png") {
            continue;
        }
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("Cannot remove {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}
