use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::AlertSource;
use crate::alert::{Alert, ConsumedAlert};
use crate::error::SourceError;

/// Replays archived alert JSON files, one per poll, in file-name order.
///
/// The directory is listed once at construction; files added later are not
/// picked up.
#[derive(Debug)]
pub struct ReplaySource {
    topic: String,
    pending: VecDeque<PathBuf>,
}

impl ReplaySource {
    pub fn open(dir: &Path, topic: impl Into<String>) -> Result<Self, SourceError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        tracing::info!(
            name = "source.replay.open",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            dir = %dir.display(),
            alerts = files.len(),
            message = "Replaying archived alerts"
        );
        Ok(Self {
            topic: topic.into(),
            pending: files.into(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl AlertSource for ReplaySource {
    async fn poll(&mut self, _timeout: Duration) -> Result<Option<ConsumedAlert>, SourceError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        let raw = tokio::fs::read(&path).await?;
        let alert: Alert = serde_json::from_slice(&raw)
            .map_err(|e| SourceError::Decode(format!("{}: {e}", path.display())))?;
        let key = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Some(ConsumedAlert {
            topic: self.topic.clone(),
            key,
            alert,
        }))
    }
}
