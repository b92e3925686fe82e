//! Append-only JSONL feedback log.
//!
//! One [`FeedbackEvent`] per line, UTF-8, each line terminated by `\n`.
//! Every append is flushed and synced before it is acknowledged. Replay
//! skips blank lines and fails on the first malformed line, naming it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use cbam_intake_core::feedback::FeedbackLog;
use cbam_intake_core::models::FeedbackEvent;

pub struct JsonlFeedbackLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlFeedbackLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FeedbackLog for JsonlFeedbackLog {
    async fn append(&self, event: &FeedbackEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create directory {}", parent.display())
                })?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open feedback log {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<FeedbackEvent>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read feedback log {}", self.path.display())
                })
            }
        };

        let mut events = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: FeedbackEvent = serde_json::from_str(line).with_context(|| {
                format!(
                    "Malformed feedback log entry at {}:{}",
                    self.path.display(),
                    i + 1
                )
            })?;
            events.push(event);
        }
        Ok(events)
    }
}
