//! Enrichment task model
//!
//! Tasks are persisted as ordinary documents. The stored status is one of
//! `todo`, `in_progress` or `done`; "stale" only ever exists as a value
//! derived from the stored status and the time since the last transition.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::document::Document;
use crate::error::EngineError;
use crate::identity::{TenantId, Timestamp};

/// Separator between the parts of a task key. Never valid in a tenant id.
const KEY_SEPARATOR: char = '\u{1f}';

/// Stored task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    /// Convert to the persisted string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        }
    }

    /// Parse from the persisted string representation.
    pub fn from_db_str(s: &str) -> Result<Self, TaskStatusParseError> {
        match s {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            _ => Err(TaskStatusParseError(s.to_string())),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid task status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid task status: {}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

/// Status as seen at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveStatus {
    Todo,
    InProgress,
    Stale,
    Done,
}

impl EffectiveStatus {
    /// Whether a worker may claim a task in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, EffectiveStatus::Todo | EffectiveStatus::Stale)
    }
}

/// Derive the effective status of a task.
///
/// An in-progress task whose last transition is strictly older than
/// `stale_after` is stale. Every other stored status maps to itself.
pub fn effective_status(
    status: TaskStatus,
    transitioned_at: Timestamp,
    now: Timestamp,
    stale_after: ChronoDuration,
) -> EffectiveStatus {
    match status {
        TaskStatus::Todo => EffectiveStatus::Todo,
        TaskStatus::Done => EffectiveStatus::Done,
        TaskStatus::InProgress if now - transitioned_at > stale_after => EffectiveStatus::Stale,
        TaskStatus::InProgress => EffectiveStatus::InProgress,
    }
}

/// Build the deduplication key for a document.
pub fn task_key(tenant: &TenantId, collection: &str, document_id: &str) -> String {
    format!(
        "{}{sep}{}{sep}{}",
        tenant.as_str(),
        collection,
        document_id,
        sep = KEY_SEPARATOR
    )
}

/// One unit of deferred per-document work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentTask {
    pub id: String,
    pub tenant: TenantId,
    pub collection: String,
    pub document_id: String,
    pub status: TaskStatus,
    pub enqueued_at: Timestamp,
    pub transitioned_at: Timestamp,
}

impl EnrichmentTask {
    pub fn key(&self) -> String {
        task_key(&self.tenant, &self.collection, &self.document_id)
    }

    pub fn effective_status(&self, now: Timestamp, stale_after: ChronoDuration) -> EffectiveStatus {
        effective_status(self.status, self.transitioned_at, now, stale_after)
    }

    /// Move to `status`, stamping the transition time.
    pub fn transition(&mut self, status: TaskStatus, now: Timestamp) {
        self.status = status;
        self.transitioned_at = now;
    }

    /// Encode as a queue document. The key is stored as its own field so it
    /// can carry a secondary index.
    pub fn to_document(&self) -> Result<Document, EngineError> {
        let mut fields = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(EngineError::Serialization {
                    reason: format!("task encoded as non-object: {}", other),
                })
            }
            Err(e) => {
                return Err(EngineError::Serialization {
                    reason: e.to_string(),
                })
            }
        };
        fields.remove("id");
        fields.insert("key".to_string(), Value::String(self.key()));
        Ok(Document {
            id: self.id.clone(),
            fields,
        })
    }

    /// Decode a queue document.
    pub fn from_document(doc: &Document) -> Result<Self, EngineError> {
        let mut fields = doc.fields.clone();
        fields.remove("key");
        fields.insert("id".to_string(), Value::String(doc.id.clone()));
        serde_json::from_value(Value::Object(fields)).map_err(|e| EngineError::Serialization {
            reason: format!("queue record {}: {}", doc.id, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task(status: TaskStatus) -> EnrichmentTask {
        let now = Utc::now();
        EnrichmentTask {
            id: "t1".to_string(),
            tenant: TenantId::new("acme"),
            collection: "articles".to_string(),
            document_id: "d1".to_string(),
            status,
            enqueued_at: now,
            transitioned_at: now,
        }
    }

    #[test]
    fn test_status_db_strings() {
        for status in [TaskStatus::Todo, TaskStatus::InProgress, TaskStatus::Done] {
            assert_eq!(TaskStatus::from_db_str(status.as_db_str()), Ok(status));
        }
        assert!(TaskStatus::from_db_str("stale").is_err());
    }

    #[test]
    fn test_stale_is_derived_only_for_in_progress() {
        let now = Utc::now();
        let old = now - ChronoDuration::minutes(30);
        let window = ChronoDuration::minutes(10);

        assert_eq!(
            effective_status(TaskStatus::InProgress, old, now, window),
            EffectiveStatus::Stale
        );
        assert_eq!(
            effective_status(TaskStatus::InProgress, now, now, window),
            EffectiveStatus::InProgress
        );
        assert_eq!(
            effective_status(TaskStatus::Todo, old, now, window),
            EffectiveStatus::Todo
        );
        assert_eq!(
            effective_status(TaskStatus::Done, old, now, window),
            EffectiveStatus::Done
        );
    }

    #[test]
    fn test_stale_boundary_is_exclusive() {
        let now = Utc::now();
        let window = ChronoDuration::minutes(10);
        assert_eq!(
            effective_status(TaskStatus::InProgress, now - window, now, window),
            EffectiveStatus::InProgress
        );
    }

    #[test]
    fn test_document_encoding_keeps_status_as_string() {
        let t = task(TaskStatus::InProgress);
        let doc = t.to_document().unwrap();
        assert_eq!(doc.id, "t1");
        assert_eq!(doc.get("status"), Some(&Value::String("in_progress".into())));
        assert_eq!(doc.get("key"), Some(&Value::String(t.key())));

        let back = EnrichmentTask::from_document(&doc).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_keys_differ_per_part() {
        let acme = TenantId::new("acme");
        assert_ne!(task_key(&acme, "ab", "c"), task_key(&acme, "a", "bc"));
        assert_ne!(
            task_key(&acme, "articles", "d1"),
            task_key(&TenantId::new("other"), "articles", "d1")
        );
    }
}
