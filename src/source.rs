//! Container Sources
//!
//! Contract of the local connector that feeds container declarations into
//! the reconciler, and a file-backed implementation that reads a YAML (or
//! JSON) list of containers and polls it for changes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::{ContainerEvent, EventKind, ParsedContainer};

#[async_trait]
pub trait ContainerSource: Send + Sync {
    fn name(&self) -> &str;

    /// Every running container with its parsed declarations
    async fn list_containers(&self) -> Result<Vec<ParsedContainer>>;

    async fn get_container(&self, id: &str) -> Result<Option<ParsedContainer>>;

    /// Push lifecycle events until the receiver goes away
    async fn watch(&self, events: mpsc::Sender<ContainerEvent>) -> Result<()>;
}

/// Containers declared in a file, re-read whenever its modification time
/// changes
pub struct FileSource {
    path: PathBuf,
    poll: Duration,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>, poll: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            poll,
        }
    }

    async fn modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .ok()
    }

    async fn read(&self) -> Result<BTreeMap<String, ParsedContainer>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Container file does not exist yet");
                return Ok(BTreeMap::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let containers: Vec<ParsedContainer> = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;

        let mut by_id = BTreeMap::new();
        for mut container in containers {
            if container.name.is_empty() {
                container.name = container.id.clone();
            }
            if by_id.contains_key(&container.id) {
                warn!(container = %container.id, "Container listed twice, keeping the first entry");
                continue;
            }
            by_id.insert(container.id.clone(), container);
        }
        Ok(by_id)
    }

    /// Events turning `before` into `after`
    fn diff(
        before: &BTreeMap<String, ParsedContainer>,
        after: &BTreeMap<String, ParsedContainer>,
    ) -> Vec<ContainerEvent> {
        let mut events = Vec::new();
        for (id, container) in after {
            match before.get(id) {
                None => events.push(ContainerEvent::new(EventKind::Start, id, &container.name)),
                Some(old) if old != container => {
                    events.push(ContainerEvent::new(EventKind::Update, id, &container.name))
                }
                Some(_) => {}
            }
        }
        for (id, container) in before {
            if !after.contains_key(id) {
                events.push(ContainerEvent::new(EventKind::Stop, id, &container.name));
            }
        }
        events
    }
}

#[async_trait]
impl ContainerSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn list_containers(&self) -> Result<Vec<ParsedContainer>> {
        Ok(self.read().await?.into_values().collect())
    }

    async fn get_container(&self, id: &str) -> Result<Option<ParsedContainer>> {
        Ok(self.read().await?.remove(id))
    }

    async fn watch(&self, events: mpsc::Sender<ContainerEvent>) -> Result<()> {
        let mut known = self.read().await.unwrap_or_default();
        let mut stamp = self.modified().await;
        let mut ticker = tokio::time::interval(self.poll);
        ticker.tick().await;

        info!(
            path = %self.path.display(),
            poll_secs = self.poll.as_secs(),
            "Watching container file"
        );

        loop {
            ticker.tick().await;

            let current = self.modified().await;
            if current == stamp {
                continue;
            }
            stamp = current;

            let latest = match self.read().await {
                Ok(latest) => latest,
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Ignoring unreadable container file");
                    continue;
                }
            };

            for event in Self::diff(&known, &latest) {
                debug!(kind = %event.kind, container = %event.container_name, "Container event");
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
            known = latest;
        }
    }
}
