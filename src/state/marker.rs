//! Marker files for VMware guest customization
//!
//! A marker file records that the one-time part of a customization has
//! completed for a given product marker id. Clones of the same template share
//! the marker id, so the marker keeps passwords and scripts from being applied
//! a second time after a clone or a reboot.

use crate::DatasourceError;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Prefix shared by all marker files
const MARKER_PREFIX: &str = ".markerfile";

/// Marker files in a single directory
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the marker file for `marker_id`
    pub fn marker_path(&self, marker_id: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.txt", MARKER_PREFIX, marker_id))
    }

    /// Whether the marker for `marker_id` exists. An empty id never has one.
    pub fn exists(&self, marker_id: &str) -> bool {
        if marker_id.is_empty() {
            return false;
        }
        self.marker_path(marker_id).exists()
    }

    /// Replace whatever marker is present with the one for `marker_id`
    pub async fn set(&self, marker_id: &str) -> Result<(), DatasourceError> {
        debug!("Handle marker creation");
        fs::create_dir_all(&self.dir).await?;

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(MARKER_PREFIX) {
                fs::remove_file(entry.path()).await?;
            }
        }

        let path = self.marker_path(marker_id);
        fs::write(&path, b"").await?;
        debug!("Created marker file {}", path.display());
        Ok(())
    }
}
