//! Per-user activity journal.
//!
//! Entries are stored newest first under `<log_namespace>/<userId>` and each
//! log is capped; the oldest entries fall off the end. Logs are loaded lazily
//! the first time a user's journal is touched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::bottles::domain::{BottleId, BottleKind};
use crate::db::kv::{self, KvStore, StorageError};

/// Logs never keep fewer entries than this, whatever the configuration says.
pub const MIN_LOG_CAP: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Published,
    Retrieved,
    Commented,
    ReceivedComment,
    FirstRetrievedByOther,
    Hidden,
    Unhidden,
    CommentRemoved,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub kind: EventKind,
    /// The user who caused the event, not necessarily the log owner
    pub actor_id: String,
    pub bottle_id: BottleId,
    pub kind_label: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub unseen: bool,
}

impl ActivityEntry {
    pub fn new(kind: EventKind, actor_id: impl Into<String>, bottle_id: BottleId, bottle_kind: BottleKind) -> Self {
        Self {
            kind,
            actor_id: actor_id.into(),
            bottle_id,
            kind_label: bottle_kind.label().to_string(),
            timestamp: Utc::now(),
            unseen: true,
        }
    }

    pub fn describe(&self) -> String {
        let id = self.bottle_id;
        let label = &self.kind_label;
        let actor = &self.actor_id;
        match self.kind {
            EventKind::Published => format!("You threw bottle #{} ({})", id, label),
            EventKind::Retrieved => format!("You retrieved bottle #{} ({})", id, label),
            EventKind::Commented => format!("You commented on bottle #{} ({})", id, label),
            EventKind::ReceivedComment => {
                format!("User {} commented on your bottle #{} ({})", actor, id, label)
            }
            EventKind::FirstRetrievedByOther => {
                format!("User {} found your bottle #{} ({}) for the first time", actor, id, label)
            }
            EventKind::Hidden => format!("Your bottle #{} ({}) was hidden by {}", id, label, actor),
            EventKind::Unhidden => format!("Your bottle #{} ({}) was made visible again by {}", id, label, actor),
            EventKind::CommentRemoved => {
                format!("Your comment on bottle #{} ({}) was removed by {}", id, label, actor)
            }
            EventKind::Unknown => format!("Something happened to bottle #{}", id),
        }
    }
}

/// A log entry ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEvent {
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub unseen: bool,
}

pub struct ActivityLog {
    kv: Arc<dyn KvStore>,
    namespace: String,
    cap: usize,
    logs: Mutex<HashMap<String, Vec<ActivityEntry>>>,
}

impl ActivityLog {
    pub fn new(kv: Arc<dyn KvStore>, namespace: impl Into<String>, configured_cap: usize) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
            cap: configured_cap.max(MIN_LOG_CAP),
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Prepend an entry to `owner_id`'s log and persist it.
    pub async fn record(&self, owner_id: &str, entry: ActivityEntry) -> Result<(), StorageError> {
        let mut logs = self.logs.lock().await;
        let entries = self.entries_mut(&mut logs, owner_id).await?;

        entries.insert(0, entry);
        entries.truncate(self.cap);

        self.persist(owner_id, entries).await
    }

    /// Up to `limit` most recent events. Listing marks the whole log as seen.
    pub async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<RenderedEvent>, StorageError> {
        let mut logs = self.logs.lock().await;
        let entries = self.entries_mut(&mut logs, user_id).await?;

        let rendered: Vec<RenderedEvent> = entries
            .iter()
            .take(limit)
            .map(|entry| RenderedEvent {
                description: entry.describe(),
                timestamp: entry.timestamp,
                unseen: entry.unseen,
            })
            .collect();

        if rendered.iter().any(|event| event.unseen) {
            for entry in entries.iter_mut() {
                entry.unseen = false;
            }
            self.persist(user_id, entries).await?;
        }

        Ok(rendered)
    }

    pub async fn unseen_count(&self, user_id: &str) -> Result<usize, StorageError> {
        let mut logs = self.logs.lock().await;
        let entries = self.entries_mut(&mut logs, user_id).await?;
        Ok(entries.iter().filter(|entry| entry.unseen).count())
    }

    async fn entries_mut<'a>(
        &self,
        logs: &'a mut HashMap<String, Vec<ActivityEntry>>,
        user_id: &str,
    ) -> Result<&'a mut Vec<ActivityEntry>, StorageError> {
        if !logs.contains_key(user_id) {
            let loaded = self.load(user_id).await?;
            logs.insert(user_id.to_string(), loaded);
        }
        Ok(logs.entry(user_id.to_string()).or_default())
    }

    async fn load(&self, user_id: &str) -> Result<Vec<ActivityEntry>, StorageError> {
        let key = kv::record_key(&self.namespace, user_id);
        match kv::load_json::<Vec<ActivityEntry>>(self.kv.as_ref(), &key).await {
            Ok(entries) => Ok(entries.unwrap_or_default()),
            Err(StorageError::Serialization(e)) => {
                tracing::warn!("Discarding unreadable activity log {}: {}", key, e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, user_id: &str, entries: &[ActivityEntry]) -> Result<(), StorageError> {
        let key = kv::record_key(&self.namespace, user_id);
        kv::save_json(self.kv.as_ref(), &key, entries).await
    }
}
