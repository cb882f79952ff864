use super::value::StateValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub schema_version: u32,
    pub platform: String,
    pub device_id: String,
}

/// Captured state for one artifact version. This is also the persisted
/// record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub identity_hash: String,
    pub structural_hash: String,
    pub timestamp: DateTime<Utc>,
    pub state: BTreeMap<String, StateValue>,
    pub metadata: SnapshotMetadata,
}

impl StateSnapshot {
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            identity_hash: self.identity_hash.clone(),
            structural_hash: self.structural_hash.clone(),
            key_count: self.state.len(),
            timestamp: self.timestamp,
        }
    }

    pub fn short_hash(&self) -> &str {
        &self.identity_hash[..12.min(self.identity_hash.len())]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreservationResult {
    pub success: bool,
    pub restored_keys: BTreeSet<String>,
    pub incompatible_keys: BTreeSet<String>,
    pub reason: String,
}

impl PreservationResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            restored_keys: BTreeSet::new(),
            incompatible_keys: BTreeSet::new(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub snapshot_count: usize,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub persistence_enabled: bool,
    /// Approximate: serialized size of the records in history
    pub storage_bytes: u64,
    pub compatibility_threshold: f64,
    pub persistence_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub identity_hash: String,
    pub structural_hash: String,
    pub key_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Read-only export of the snapshot service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDiagnostics {
    pub exported_at: DateTime<Utc>,
    pub last_snapshot: Option<SnapshotSummary>,
    pub history: Vec<SnapshotSummary>,
    pub last_restore: Option<PreservationResult>,
    pub stats: SnapshotStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_field_names() {
        let mut state = BTreeMap::new();
        state.insert("counter".to_string(), StateValue::Int(5));
        let snapshot = StateSnapshot {
            identity_hash: "a".repeat(64),
            structural_hash: "b".repeat(64),
            timestamp: "2024-05-01T10:00:00Z".parse().unwrap(),
            state,
            metadata: SnapshotMetadata {
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                platform: "linux".to_string(),
                device_id: "dev".to_string(),
            },
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["identityHash"], json!("a".repeat(64)));
        assert_eq!(value["timestamp"], json!("2024-05-01T10:00:00Z"));
        assert_eq!(value["state"]["counter"], json!(5));
        assert_eq!(value["metadata"]["schemaVersion"], json!(1));
        assert_eq!(snapshot.summary().key_count, 1);
        assert_eq!(snapshot.short_hash(), "aaaaaaaaaaaa");
    }
}
