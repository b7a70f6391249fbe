use std::path::{Path, PathBuf};

use crate::alert::Alert;
use crate::error::ArchiveError;
use crate::paths::sanitize_stem;

/// Append-only store of every consumed alert, one JSON file per alert.
#[derive(Clone, Debug)]
pub struct AlertArchive {
    dir: PathBuf,
}

impl AlertArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, alert: &Alert) -> PathBuf {
        let stem = sanitize_stem(&alert.object_id);
        self.dir.join(format!("{stem}_{}.json", alert.candid))
    }

    /// Writes `alert` as pretty JSON and returns where it landed. A redelivered
    /// alert overwrites its earlier copy.
    pub fn store(&self, alert: &Alert) -> Result<PathBuf, ArchiveError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ArchiveError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(alert);
        let body = serde_json::to_vec_pretty(alert)?;
        std::fs::write(&path, body).map_err(|source| ArchiveError::Write {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(
            name = "archive.store",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            object_id = %alert.object_id,
            path = %path.display(),
            message = "Archived alert"
        );
        Ok(path)
    }
}
