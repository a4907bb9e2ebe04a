//! Conflict detection and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use offsync_common::OperationId;
use offsync_storage::DocumentRecord;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Discard the remote version and apply the local change.
    KeepLocal,
    /// Take the remote version and drop the local change.
    KeepRemote,
    /// Shallow-merge metadata (remote wins on collision), then apply the local change.
    Merge,
    /// Hold the operation until an operator decides.
    Manual,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictStrategy::KeepLocal => "keep_local",
            ConflictStrategy::KeepRemote => "keep_remote",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// A one-shot decision about a detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub target_id: String,
    pub local_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_version: Option<u64>,
    pub strategy: ConflictStrategy,
    pub decided_at: DateTime<Utc>,
}

/// A manual conflict awaiting an operator, together with the operation it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConflict {
    pub operation_id: OperationId,
    #[serde(flatten)]
    pub resolution: ConflictResolution,
}

/// What the executor should do with a record after resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionAction {
    /// Apply the pending change on top of this record.
    Continue(DocumentRecord),
    /// Store this record and consider the pending change superseded.
    Replace(DocumentRecord),
    /// Leave everything untouched and hold the operation.
    Defer,
}

/// Conflict detector and resolver.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    /// Default resolution strategy.
    default_strategy: ConflictStrategy,
    /// Timestamp skew tolerated before two versions count as diverged.
    tolerance: Duration,
}

impl ConflictResolver {
    /// Create a new conflict resolver.
    pub fn new(default_strategy: ConflictStrategy, tolerance: Duration) -> Self {
        Self {
            default_strategy,
            tolerance,
        }
    }

    /// Get the default resolution strategy.
    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default_strategy
    }

    /// Detect a conflict on a record about to be updated.
    ///
    /// A conflict exists when both the local and remote modification times
    /// are known and differ by more than the tolerance window.
    pub fn detect(&self, record: &DocumentRecord) -> Option<ConflictResolution> {
        self.detect_with(record, self.default_strategy)
    }

    /// Like [`detect`](Self::detect) but records the given strategy.
    pub fn detect_with(
        &self,
        record: &DocumentRecord,
        strategy: ConflictStrategy,
    ) -> Option<ConflictResolution> {
        let local = record.local_modified?;
        let remote = record.remote_modified?;

        let skew = (local - remote).abs().to_std().unwrap_or(Duration::MAX);
        if skew <= self.tolerance {
            return None;
        }

        Some(ConflictResolution {
            target_id: record.id.clone(),
            local_version: record.version,
            remote_version: record.remote.as_ref().map(|r| r.version),
            strategy,
            decided_at: Utc::now(),
        })
    }

    /// Apply a resolution strategy to the conflicted record.
    pub fn resolve(&self, record: &DocumentRecord, strategy: ConflictStrategy) -> ResolutionAction {
        match strategy {
            ConflictStrategy::KeepLocal => {
                let mut resolved = record.clone();
                resolved.remote = None;
                ResolutionAction::Continue(resolved)
            }
            ConflictStrategy::KeepRemote => {
                let mut resolved = record.clone();
                if let Some(remote) = record.remote.clone() {
                    resolved.version = remote.version.max(record.version);
                    resolved.content = remote.content;
                    resolved.metadata = remote.metadata;
                }
                resolved.mark_synced(Utc::now());
                ResolutionAction::Replace(resolved)
            }
            ConflictStrategy::Merge => {
                let mut resolved = record.clone();
                if let Some(remote) = record.remote.as_ref() {
                    for (key, value) in &remote.metadata {
                        resolved.metadata.insert(key.clone(), value.clone());
                    }
                    resolved.version = remote.version.max(record.version);
                }
                resolved.remote = None;
                ResolutionAction::Continue(resolved)
            }
            ConflictStrategy::Manual => ResolutionAction::Defer,
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictStrategy::Manual, Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_storage::RemoteVersion;
    use serde_json::{json, Map, Value};

    fn conflicted_record() -> DocumentRecord {
        let now = Utc::now();
        let mut local_meta = Map::new();
        local_meta.insert("title".to_string(), json!("local title"));
        local_meta.insert("pinned".to_string(), json!(true));

        let mut remote_meta = Map::new();
        remote_meta.insert("title".to_string(), json!("remote title"));
        remote_meta.insert("color".to_string(), json!("blue"));

        let mut record = DocumentRecord::new("doc-1", json!("local body")).with_metadata(local_meta);
        record.version = 3;
        record.local_modified = Some(now);
        record.remote_modified = Some(now - chrono::Duration::seconds(30));
        record.remote = Some(RemoteVersion {
            version: 5,
            content: json!("remote body"),
            metadata: remote_meta,
            modified: now - chrono::Duration::seconds(30),
        });
        record
    }

    #[test]
    fn test_no_conflict_without_both_timestamps() {
        let resolver = ConflictResolver::default();
        let mut record = DocumentRecord::new("doc-1", Value::Null);
        assert!(resolver.detect(&record).is_none());

        record.local_modified = Some(Utc::now());
        assert!(resolver.detect(&record).is_none());
    }

    #[test]
    fn test_no_conflict_within_tolerance() {
        let resolver = ConflictResolver::default();
        let now = Utc::now();
        let mut record = DocumentRecord::new("doc-1", Value::Null);
        record.local_modified = Some(now);
        record.remote_modified = Some(now - chrono::Duration::milliseconds(900));
        assert!(resolver.detect(&record).is_none());
    }

    #[test]
    fn test_conflict_detected_beyond_tolerance() {
        let resolver = ConflictResolver::default();
        let record = conflicted_record();

        let conflict = resolver.detect(&record).unwrap();
        assert_eq!(conflict.target_id, "doc-1");
        assert_eq!(conflict.local_version, 3);
        assert_eq!(conflict.remote_version, Some(5));
        assert_eq!(conflict.strategy, ConflictStrategy::Manual);
    }

    #[test]
    fn test_conflict_detected_when_remote_is_newer() {
        let resolver = ConflictResolver::default();
        let mut record = conflicted_record();
        std::mem::swap(&mut record.local_modified, &mut record.remote_modified);
        assert!(resolver.detect(&record).is_some());
    }

    #[test]
    fn test_keep_local_drops_remote() {
        let resolver = ConflictResolver::default();
        let record = conflicted_record();

        let ResolutionAction::Continue(resolved) =
            resolver.resolve(&record, ConflictStrategy::KeepLocal)
        else {
            panic!("expected Continue");
        };
        assert_eq!(resolved.content, json!("local body"));
        assert!(resolved.remote.is_none());
    }

    #[test]
    fn test_keep_remote_replaces_record() {
        let resolver = ConflictResolver::default();
        let record = conflicted_record();

        let ResolutionAction::Replace(resolved) =
            resolver.resolve(&record, ConflictStrategy::KeepRemote)
        else {
            panic!("expected Replace");
        };
        assert_eq!(resolved.content, json!("remote body"));
        assert_eq!(resolved.version, 5);
        assert!(resolved.metadata.get("pinned").is_none());
        assert!(resolver.detect(&resolved).is_none());
    }

    #[test]
    fn test_merge_prefers_remote_on_collision() {
        let resolver = ConflictResolver::default();
        let record = conflicted_record();

        let ResolutionAction::Continue(resolved) =
            resolver.resolve(&record, ConflictStrategy::Merge)
        else {
            panic!("expected Continue");
        };
        assert_eq!(resolved.metadata["title"], json!("remote title"));
        assert_eq!(resolved.metadata["pinned"], json!(true));
        assert_eq!(resolved.metadata["color"], json!("blue"));
        assert_eq!(resolved.content, json!("local body"));
    }

    #[test]
    fn test_manual_defers() {
        let resolver = ConflictResolver::default();
        assert_eq!(
            resolver.resolve(&conflicted_record(), ConflictStrategy::Manual),
            ResolutionAction::Defer
        );
    }

    #[test]
    fn test_pending_conflict_serialization_is_flat() {
        let resolver = ConflictResolver::default();
        let pending = PendingConflict {
            operation_id: OperationId::generate(),
            resolution: resolver.detect(&conflicted_record()).unwrap(),
        };

        let value = serde_json::to_value(&pending).unwrap();
        assert_eq!(value["targetId"], "doc-1");
        assert_eq!(value["strategy"], "manual");
        assert!(value["operationId"].is_string());

        let back: PendingConflict = serde_json::from_value(value).unwrap();
        assert_eq!(back, pending);
    }
}
