use super::artifact::SourceArtifact;
use super::errors::StorageError;
use super::hashing::{identity_hash, structural_hash};
use super::snapshot::{
    PreservationResult, SnapshotDiagnostics, SnapshotMetadata, SnapshotStats, StateSnapshot,
    SNAPSHOT_SCHEMA_VERSION,
};
use super::store::{PersistOp, PersistenceWorker};
use super::value::{StateStore, StateValue};
use crate::messages::DeviceInfo;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub persistence_enabled: bool,
    pub cross_artifact_enabled: bool,
    /// Minimum compatibility score for a snapshot to be restored
    pub compatibility_threshold: f64,
    pub max_history: usize,
    pub max_age_days: u32,
    /// Defaults to the platform data directory
    pub directory: Option<PathBuf>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persistence_enabled: true,
            cross_artifact_enabled: false,
            compatibility_threshold: 0.8,
            max_history: 20,
            max_age_days: 7,
            directory: None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    snapshot: StateSnapshot,
    size_bytes: u64,
}

/// Captures, matches and restores consumer state across updates
pub struct StateSnapshotService {
    config: SnapshotConfig,
    device: DeviceInfo,
    history: VecDeque<Entry>,
    persistence: Option<PersistenceWorker>,
    last_restore: Option<PreservationResult>,
    persistence_failures: u64,
}

impl StateSnapshotService {
    pub fn new(config: SnapshotConfig, device: DeviceInfo) -> Self {
        Self {
            config,
            device,
            history: VecDeque::new(),
            persistence: None,
            last_restore: None,
            persistence_failures: 0,
        }
    }

    /// Persist through `worker` when persistence is enabled
    pub fn with_persistence(mut self, worker: PersistenceWorker) -> Self {
        if self.config.persistence_enabled {
            self.persistence = Some(worker);
        }
        self
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &StateSnapshot> {
        self.history.iter().map(|e| &e.snapshot)
    }

    /// Seed history with records loaded from disk, dropping expired ones
    pub fn load_history(&mut self, mut snapshots: Vec<StateSnapshot>, now: DateTime<Utc>) {
        snapshots.sort_by_key(|s| s.timestamp);
        let cutoff = now - chrono::Duration::days(self.config.max_age_days as i64);
        let total = snapshots.len();
        for snapshot in snapshots.into_iter().filter(|s| s.timestamp >= cutoff) {
            self.push(snapshot);
        }
        if total > self.history.len() {
            self.persist(PersistOp::Prune {
                max_count: self.config.max_history,
                max_age_days: self.config.max_age_days,
            });
        }
        info!(count = self.history.len(), "Snapshot history restored from disk");
    }

    fn push(&mut self, snapshot: StateSnapshot) {
        let size_bytes = serde_json::to_vec(&snapshot)
            .map(|b| b.len() as u64)
            .unwrap_or(0);
        self.history.push_back(Entry {
            snapshot,
            size_bytes,
        });
        while self.history.len() > self.config.max_history {
            if let Some(evicted) = self.history.pop_front() {
                debug!(hash = evicted.snapshot.short_hash(), "Evicted oldest snapshot");
            }
        }
    }

    fn persist(&mut self, op: PersistOp) {
        if let Some(worker) = &self.persistence {
            if let Err(e) = worker.submit(op) {
                self.note_persistence_failure(&e);
            }
        }
    }

    /// Capture `live_state` under `source`. When preservation is disabled the
    /// snapshot is returned but neither recorded nor persisted.
    pub fn create_snapshot(
        &mut self,
        source: &SourceArtifact,
        live_state: &BTreeMap<String, StateValue>,
    ) -> StateSnapshot {
        let mut state = BTreeMap::new();
        for (key, value) in live_state {
            if value.is_persistable() {
                state.insert(key.clone(), value.clone());
            } else {
                debug!(key = %key, kind = value.type_name(), "Skipping value that cannot be stored");
            }
        }
        let snapshot = StateSnapshot {
            identity_hash: identity_hash(&source.descriptor),
            structural_hash: structural_hash(&source.root),
            timestamp: Utc::now(),
            state,
            metadata: SnapshotMetadata {
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                platform: self.device.platform.clone(),
                device_id: self.device.device_id.clone(),
            },
        };

        if !self.config.enabled {
            return snapshot;
        }

        debug!(
            source = %source.descriptor.name,
            hash = snapshot.short_hash(),
            keys = snapshot.state.len(),
            "Created state snapshot"
        );
        self.push(snapshot.clone());
        self.persist(PersistOp::Write(Box::new(snapshot.clone())));
        self.persist(PersistOp::Prune {
            max_count: self.config.max_history,
            max_age_days: self.config.max_age_days,
        });
        snapshot
    }

    /// Binary compatibility: identical hash pair scores 1.0, anything else 0.0
    pub fn compatibility(
        snapshot: &StateSnapshot,
        identity_hash: &str,
        structural_hash: &str,
    ) -> f64 {
        if snapshot.identity_hash == identity_hash && snapshot.structural_hash == structural_hash {
            1.0
        } else {
            0.0
        }
    }

    /// Restore the newest compatible snapshot into `store`
    pub fn restore_state(
        &mut self,
        source: &SourceArtifact,
        store: &dyn StateStore,
    ) -> PreservationResult {
        if !self.config.enabled {
            return PreservationResult::failed("state preservation is disabled");
        }

        let identity = identity_hash(&source.descriptor);
        let structure = structural_hash(&source.root);
        let threshold = self.config.compatibility_threshold;

        let Some(candidate) = self
            .history
            .iter()
            .rev()
            .map(|e| &e.snapshot)
            .find(|s| Self::compatibility(s, &identity, &structure) >= threshold)
        else {
            let result = PreservationResult::failed(format!(
                "no compatible snapshot for {}",
                source.descriptor.name
            ));
            self.last_restore = Some(result.clone());
            return result;
        };

        let mut restored_keys = BTreeSet::new();
        let mut incompatible_keys = BTreeSet::new();
        for (key, value) in &candidate.state {
            let target = store.expected_type(key);
            match value
                .convert_to(target)
                .and_then(|converted| store.assign(key, converted))
            {
                Ok(()) => {
                    restored_keys.insert(key.clone());
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "State key not restored");
                    incompatible_keys.insert(key.clone());
                }
            }
        }

        let result = PreservationResult {
            success: true,
            reason: format!(
                "restored {} of {} keys from snapshot {}",
                restored_keys.len(),
                candidate.state.len(),
                candidate.short_hash()
            ),
            restored_keys,
            incompatible_keys,
        };
        info!(
            source = %source.descriptor.name,
            restored = result.restored_keys.len(),
            incompatible = result.incompatible_keys.len(),
            "State restored"
        );
        self.last_restore = Some(result.clone());
        result
    }

    /// Whether state should carry over from `old` to `new`
    pub fn should_preserve_state(&self, old: Option<&SourceArtifact>, new: &SourceArtifact) -> bool {
        let Some(old) = old else {
            return false;
        };
        if !self.config.enabled {
            return false;
        }

        if identity_hash(&old.descriptor) == identity_hash(&new.descriptor) {
            let score = if structural_hash(&old.root) == structural_hash(&new.root) {
                1.0
            } else {
                0.0
            };
            score >= self.config.compatibility_threshold
        } else {
            self.config.cross_artifact_enabled
        }
    }

    /// Drop history and every persisted record. Returns the in-memory count dropped.
    pub fn clear_all(&mut self) -> usize {
        let dropped = self.history.len();
        self.history.clear();
        self.last_restore = None;
        self.persist(PersistOp::Clear);
        info!(dropped, "Cleared snapshot history");
        dropped
    }

    /// Drop in-memory snapshots older than the configured max age
    pub fn prune_expired_at(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::days(self.config.max_age_days as i64);
        let before = self.history.len();
        self.history.retain(|e| e.snapshot.timestamp >= cutoff);
        let removed = before - self.history.len();
        if removed > 0 {
            self.persist(PersistOp::Prune {
                max_count: self.config.max_history,
                max_age_days: self.config.max_age_days,
            });
        }
        removed
    }

    /// Resolves once every persistence operation queued so far has run
    pub fn flush_persistence(&mut self, done: oneshot::Sender<()>) {
        match &self.persistence {
            Some(_) => self.persist(PersistOp::Flush(done)),
            None => {
                let _ = done.send(());
            }
        }
    }

    pub fn note_persistence_failure(&mut self, error: &StorageError) {
        self.persistence_failures += 1;
        warn!(
            error = %error,
            failures = self.persistence_failures,
            "Snapshot persistence failure"
        );
    }

    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            snapshot_count: self.history.len(),
            last_snapshot_at: self.history.back().map(|e| e.snapshot.timestamp),
            enabled: self.config.enabled,
            persistence_enabled: self.persistence.is_some(),
            storage_bytes: self.history.iter().map(|e| e.size_bytes).sum(),
            compatibility_threshold: self.config.compatibility_threshold,
            persistence_failures: self.persistence_failures,
        }
    }

    pub fn export_diagnostics(&self) -> SnapshotDiagnostics {
        SnapshotDiagnostics {
            exported_at: Utc::now(),
            last_snapshot: self.history.back().map(|e| e.snapshot.summary()),
            history: self.history.iter().map(|e| e.snapshot.summary()).collect(),
            last_restore: self.last_restore.clone(),
            stats: self.stats(),
        }
    }

    /// Close the persistence queue, waiting for queued writes
    pub async fn shutdown(&mut self) {
        if let Some(worker) = self.persistence.take() {
            worker.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::artifact::{LayoutNode, SourceDescriptor};
    use crate::state::store::SnapshotStore;
    use crate::state::value::{MemoryStateStore, ValueType};
    use serde_json::json;
    use tempfile::TempDir;

    fn device() -> DeviceInfo {
        DeviceInfo {
            device_id: "dev-1".to_string(),
            platform: "linux".to_string(),
            model: None,
            os_version: None,
        }
    }

    fn artifact(revision: &str, key: &str) -> SourceArtifact {
        SourceArtifact::new(
            SourceDescriptor::new("Counter.view", revision),
            LayoutNode::new("column").with_child(
                LayoutNode::new("text")
                    .with_state_keys([key, "name"])
                    .with_content(json!("Count")),
            ),
        )
    }

    fn live(counter: i64) -> BTreeMap<String, StateValue> {
        let mut state = BTreeMap::new();
        state.insert("counter".to_string(), StateValue::Int(counter));
        state.insert("name".to_string(), StateValue::from("a"));
        state
    }

    fn service(config: SnapshotConfig) -> StateSnapshotService {
        StateSnapshotService::new(config, device())
    }

    #[test]
    fn test_same_artifact_restores_every_key() {
        let mut service = service(SnapshotConfig::default());
        let source = artifact("r1", "counter");
        let snapshot = service.create_snapshot(&source, &live(5));
        assert_eq!(snapshot.metadata.device_id, "dev-1");

        let store = MemoryStateStore::new();
        let result = service.restore_state(&source, &store);

        assert!(result.success);
        assert_eq!(
            result.restored_keys,
            ["counter", "name"].iter().map(|s| s.to_string()).collect()
        );
        assert!(result.incompatible_keys.is_empty());
        assert_eq!(store.get("counter"), Some(StateValue::Int(5)));
    }

    #[test]
    fn test_snapshot_drops_values_json_cannot_hold() {
        let mut service = service(SnapshotConfig::default());
        let source = artifact("r1", "counter");
        let mut state = live(2);
        state.insert("ratio".to_string(), StateValue::Float(f64::NAN));
        let mut marker = BTreeMap::new();
        marker.insert("$bytes".to_string(), StateValue::from("AQID"));
        state.insert("blob".to_string(), StateValue::Map(marker));

        let snapshot = service.create_snapshot(&source, &state);
        assert_eq!(snapshot.state, live(2));

        let reread: StateSnapshot =
            serde_json::from_str(&serde_json::to_string(&snapshot).unwrap()).unwrap();
        assert_eq!(reread.state, snapshot.state);
    }

    #[test]
    fn test_restore_without_candidate_fails() {
        let mut service = service(SnapshotConfig::default());
        service.create_snapshot(&artifact("r1", "counter"), &live(1));

        let result = service.restore_state(&artifact("r2", "counter"), &MemoryStateStore::new());
        assert!(!result.success);
        assert!(result.restored_keys.is_empty());
    }

    #[test]
    fn test_restore_picks_newest_compatible_snapshot() {
        let mut service = service(SnapshotConfig::default());
        let source = artifact("r1", "counter");
        service.create_snapshot(&source, &live(1));
        service.create_snapshot(&artifact("r9", "counter"), &live(2));
        service.create_snapshot(&source, &live(3));

        let store = MemoryStateStore::new();
        service.restore_state(&source, &store);
        assert_eq!(store.get("counter"), Some(StateValue::Int(3)));
    }

    #[test]
    fn test_failed_conversions_land_in_incompatible_keys() {
        let mut service = service(SnapshotConfig::default());
        let source = artifact("r1", "counter");
        service.create_snapshot(&source, &live(5));

        let store = MemoryStateStore::new();
        store.declare("counter", ValueType::String);
        store.declare("name", ValueType::Int);
        let result = service.restore_state(&source, &store);

        assert!(result.success);
        assert!(result.restored_keys.contains("counter"));
        assert!(result.incompatible_keys.contains("name"));
        assert_eq!(store.get("counter"), Some(StateValue::from("5")));
    }

    #[test]
    fn test_should_preserve_rules() {
        let service_default = service(SnapshotConfig::default());
        let a = artifact("r1", "counter");
        assert!(!service_default.should_preserve_state(None, &a));
        assert!(service_default.should_preserve_state(Some(&a), &a));

        let mut reshaped = a.clone();
        reshaped.root.children[0].state_keys = vec!["count".to_string()];
        assert!(!service_default.should_preserve_state(Some(&a), &reshaped));

        let mut relabeled = a.clone();
        relabeled.root.children[0].content = json!("Total");
        assert!(service_default.should_preserve_state(Some(&a), &relabeled));

        let other = artifact("r2", "counter");
        assert!(!service_default.should_preserve_state(Some(&a), &other));

        let cross = service(SnapshotConfig {
            cross_artifact_enabled: true,
            ..SnapshotConfig::default()
        });
        assert!(cross.should_preserve_state(Some(&a), &other));
    }

    #[test]
    fn test_history_is_capped_fifo() {
        let mut service = service(SnapshotConfig {
            max_history: 3,
            ..SnapshotConfig::default()
        });
        let source = artifact("r1", "counter");
        for i in 0..5 {
            service.create_snapshot(&source, &live(i));
        }
        assert_eq!(service.len(), 3);
        let counters: Vec<StateValue> = service
            .snapshots()
            .map(|s| s.state["counter"].clone())
            .collect();
        assert_eq!(
            counters,
            vec![StateValue::Int(2), StateValue::Int(3), StateValue::Int(4)]
        );
    }

    #[test]
    fn test_disabled_service_records_nothing() {
        let mut service = service(SnapshotConfig {
            enabled: false,
            ..SnapshotConfig::default()
        });
        let source = artifact("r1", "counter");
        let snapshot = service.create_snapshot(&source, &live(1));
        assert_eq!(snapshot.state.len(), 2);
        assert!(service.is_empty());
        assert!(!service.restore_state(&source, &MemoryStateStore::new()).success);
        assert!(!service.should_preserve_state(Some(&source), &source));
        assert!(!service.stats().enabled);
    }

    #[test]
    fn test_stats_and_diagnostics() {
        let mut service = service(SnapshotConfig::default());
        let empty = service.stats();
        assert_eq!(empty.snapshot_count, 0);
        assert!(empty.last_snapshot_at.is_none());
        assert_eq!(empty.compatibility_threshold, 0.8);

        let source = artifact("r1", "counter");
        service.create_snapshot(&source, &live(1));
        service.restore_state(&source, &MemoryStateStore::new());

        let stats = service.stats();
        assert_eq!(stats.snapshot_count, 1);
        assert!(stats.storage_bytes > 0);

        let diagnostics = service.export_diagnostics();
        assert_eq!(diagnostics.history.len(), 1);
        assert_eq!(diagnostics.last_snapshot.unwrap().key_count, 2);
        assert!(diagnostics.last_restore.unwrap().success);

        assert_eq!(service.clear_all(), 1);
        assert!(service.is_empty());
    }

    #[test]
    fn test_load_history_drops_expired_records() {
        let mut service = service(SnapshotConfig::default());
        let source = artifact("r1", "counter");
        let fresh = service.create_snapshot(&source, &live(1));
        service.clear_all();

        let mut stale = fresh.clone();
        stale.timestamp = Utc::now() - chrono::Duration::days(30);
        service.load_history(vec![fresh, stale], Utc::now());
        assert_eq!(service.len(), 1);

        assert_eq!(
            service.prune_expired_at(Utc::now() + chrono::Duration::days(8)),
            1
        );
        assert!(service.is_empty());
    }

    #[tokio::test]
    async fn test_snapshots_are_persisted_and_cleared() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let worker = PersistenceWorker::spawn(store.clone(), |_| {});
        let mut service = service(SnapshotConfig::default()).with_persistence(worker);

        let source = artifact("r1", "counter");
        let snapshot = service.create_snapshot(&source, &live(5));

        let (done_tx, done_rx) = oneshot::channel();
        service.flush_persistence(done_tx);
        done_rx.await.unwrap();
        assert_eq!(store.load_all().unwrap(), vec![snapshot]);

        service.clear_all();
        service.shutdown().await;
        assert!(store.load_all().unwrap().is_empty());
    }
}
