//! State snapshot service: captures consumer state before an update is
//! applied and restores it afterwards when the new artifact is compatible.
//!
//! Snapshots live in a bounded in-memory history and are optionally
//! persisted as one JSON file per record under the platform data directory.

pub mod artifact;
pub mod errors;
pub mod hashing;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod value;

pub use artifact::{LayoutNode, SourceArtifact, SourceDescriptor};
pub use errors::StorageError;
pub use hashing::{identity_hash, structural_hash};
pub use service::{SnapshotConfig, StateSnapshotService};
pub use snapshot::{
    PreservationResult, SnapshotDiagnostics, SnapshotMetadata, SnapshotStats, SnapshotSummary,
    StateSnapshot, SNAPSHOT_SCHEMA_VERSION,
};
pub use store::{default_snapshot_dir, PersistOp, PersistenceWorker, SnapshotStore};
pub use value::{ConversionError, MemoryStateStore, StateStore, StateValue, ValueType};
