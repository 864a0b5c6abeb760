//! Sources of goal updates.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::GoalError;
use crate::CHANNEL_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceEventKind {
    Added,
    Modified,
    Deleted,
}

/// One change of the watched configuration object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub kind: SourceEventKind,
    pub data: BTreeMap<String, String>,
}

impl SourceEvent {
    pub fn new(kind: SourceEventKind, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            data: BTreeMap::from([(key.into(), value.into())]),
        }
    }

    pub fn deleted() -> Self {
        Self {
            kind: SourceEventKind::Deleted,
            data: BTreeMap::new(),
        }
    }
}

/// A watchable key/value configuration object.
///
/// Each `subscribe` opens a fresh stream. Events missed between streams are
/// not replayed.
#[async_trait]
pub trait GoalSource: Send + Sync {
    async fn subscribe(&self) -> Result<mpsc::Receiver<SourceEvent>, GoalError>;
}

// =============================================================================
// File source
// =============================================================================

/// Polls a YAML file; the whole file is the value of `key`.
///
/// An absent file means no goals. Creating it yields `Added`, changing its
/// content yields `Modified`, removing it yields `Deleted`.
#[derive(Debug, Clone)]
pub struct FileGoalSource {
    path: PathBuf,
    key: String,
    poll_interval: Duration,
}

impl FileGoalSource {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            poll_interval,
        }
    }
}

#[async_trait]
impl GoalSource for FileGoalSource {
    async fn subscribe(&self) -> Result<mpsc::Receiver<SourceEvent>, GoalError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
                return Err(GoalError::Source(format!(
                    "directory {} does not exist",
                    dir.display()
                )));
            }
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(poll_file(
            self.path.clone(),
            self.key.clone(),
            self.poll_interval,
            tx,
        ));
        Ok(rx)
    }
}

async fn poll_file(
    path: PathBuf,
    key: String,
    poll_interval: Duration,
    tx: mpsc::Sender<SourceEvent>,
) {
    let mut last: Option<String> = None;
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        ticker.tick().await;
        if tx.is_closed() {
            return;
        }

        let event = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                if last.as_deref() == Some(content.as_str()) {
                    continue;
                }
                let kind = if last.is_some() {
                    SourceEventKind::Modified
                } else {
                    SourceEventKind::Added
                };
                last = Some(content.clone());
                SourceEvent::new(kind, key.as_str(), content)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if last.take().is_none() {
                    continue;
                }
                SourceEvent::deleted()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read goal file");
                return;
            }
        };

        debug!(path = %path.display(), kind = ?event.kind, "Goal file changed");
        if tx.send(event).await.is_err() {
            return;
        }
    }
}
