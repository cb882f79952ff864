use super::errors::{Result, StorageError};
use super::snapshot::StateSnapshot;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const FILE_PREFIX: &str = "snapshot-";
const FILE_SUFFIX: &str = ".json";

/// Snapshot directory for the current platform
pub fn default_snapshot_dir() -> Result<PathBuf> {
    if let Ok(custom_data_dir) = std::env::var("LIVELINK_DATA_DIR") {
        return Ok(PathBuf::from(custom_data_dir).join("snapshots"));
    }

    let project_dirs = ProjectDirs::from("dev", "livelink", "livelink").ok_or_else(|| {
        StorageError::data_dir_error("Failed to determine application data directory")
    })?;
    Ok(project_dirs.data_dir().join("snapshots"))
}

/// One JSON file per snapshot, named by identity hash, a random tag and
/// creation time
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

struct StoredFile {
    path: PathBuf,
    micros: i64,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fresh name for each call: snapshots of one source taken within the
    /// same microsecond must not replace each other
    pub fn file_name(snapshot: &StateSnapshot) -> String {
        let hash = &snapshot.identity_hash[..16.min(snapshot.identity_hash.len())];
        let tag: u32 = rand::random();
        format!(
            "{}{}-{:08x}-{}{}",
            FILE_PREFIX,
            hash,
            tag,
            snapshot.timestamp.timestamp_micros(),
            FILE_SUFFIX
        )
    }

    /// Write atomically: temp file, fsync, rename into place
    pub fn write(&self, snapshot: &StateSnapshot) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let name = Self::file_name(snapshot);
        let final_path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!(".{}.tmp", name));

        let bytes = serde_json::to_vec_pretty(snapshot)?;
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        debug!(path = %final_path.display(), bytes = bytes.len(), "Persisted snapshot");
        Ok(final_path)
    }

    fn list(&self) -> Result<Vec<StoredFile>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            else {
                continue;
            };
            let Some(micros) = stem.rsplit('-').next().and_then(|t| t.parse::<i64>().ok()) else {
                continue;
            };
            files.push(StoredFile { path, micros });
        }
        files.sort_by_key(|f| f.micros);
        Ok(files)
    }

    /// Every readable record, oldest first. Damaged files are skipped.
    pub fn load_all(&self) -> Result<Vec<StateSnapshot>> {
        let mut snapshots = Vec::new();
        for file in self.list()? {
            match fs::read(&file.path)
                .map_err(StorageError::from)
                .and_then(|bytes| serde_json::from_slice::<StateSnapshot>(&bytes).map_err(Into::into))
            {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(path = %file.path.display(), error = %e, "Skipping unreadable snapshot"),
            }
        }
        snapshots.sort_by_key(|s| s.timestamp);
        info!(count = snapshots.len(), dir = %self.dir.display(), "Loaded persisted snapshots");
        Ok(snapshots)
    }

    /// Delete records older than `max_age`, then the oldest beyond `max_count`
    pub fn prune(
        &self,
        max_count: usize,
        max_age: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let files = self.list()?;
        let cutoff = max_age.map(|age| (now - age).timestamp_micros());

        let (expired, kept): (Vec<_>, Vec<_>) = files
            .into_iter()
            .partition(|f| cutoff.map(|c| f.micros < c).unwrap_or(false));
        let overflow = kept.len().saturating_sub(max_count);

        let mut removed = 0;
        for file in expired.iter().chain(kept.iter().take(overflow)) {
            match fs::remove_file(&file.path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed > 0 {
            debug!(removed, "Pruned persisted snapshots");
        }
        Ok(removed)
    }

    /// Remove every record and leftover temp file
    pub fn clear(&self) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_ours = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(FILE_PREFIX) || n.starts_with(&format!(".{}", FILE_PREFIX)))
                .unwrap_or(false);
            if is_ours && path.is_file() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        info!(removed, "Cleared persisted snapshots");
        Ok(removed)
    }

    /// Bytes used on disk by stored records
    pub fn storage_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for file in self.list()? {
            total += fs::metadata(&file.path)?.len();
        }
        Ok(total)
    }
}

/// Work for the persistence task, executed strictly in submission order
#[derive(Debug)]
pub enum PersistOp {
    Write(Box<StateSnapshot>),
    Prune { max_count: usize, max_age_days: u32 },
    Clear,
    /// Completes once everything queued before it is done
    Flush(oneshot::Sender<()>),
}

/// Runs blocking file I/O off the client worker
pub struct PersistenceWorker {
    tx: mpsc::UnboundedSender<PersistOp>,
    handle: JoinHandle<()>,
}

impl PersistenceWorker {
    pub fn spawn<F>(store: SnapshotStore, on_error: F) -> Self
    where
        F: Fn(StorageError) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
        let handle = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                if let PersistOp::Flush(done) = op {
                    let _ = done.send(());
                    continue;
                }
                let store = store.clone();
                let outcome = tokio::task::spawn_blocking(move || run_op(&store, op)).await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, "Snapshot persistence failed");
                        on_error(e);
                    }
                    Err(e) => {
                        warn!(error = %e, "Snapshot persistence task panicked");
                        on_error(StorageError::Io(std::io::Error::other(e.to_string())));
                    }
                }
            }
            debug!("Persistence queue closed");
        });
        Self { tx, handle }
    }

    pub fn submit(&self, op: PersistOp) -> Result<()> {
        self.tx.send(op).map_err(|_| StorageError::QueueClosed)
    }

    /// Wait until every previously submitted operation has run
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(PersistOp::Flush(done_tx))?;
        done_rx.await.map_err(|_| StorageError::QueueClosed)
    }

    /// Close the queue and wait for queued work to finish
    pub async fn shutdown(self) {
        let Self { tx, handle } = self;
        drop(tx);
        if let Err(e) = handle.await {
            warn!(error = %e, "Persistence task ended abnormally");
        }
    }
}

fn run_op(store: &SnapshotStore, op: PersistOp) -> Result<()> {
    match op {
        PersistOp::Write(snapshot) => store.write(&snapshot).map(|_| ()),
        PersistOp::Prune {
            max_count,
            max_age_days,
        } => store
            .prune(
                max_count,
                Some(chrono::Duration::days(max_age_days as i64)),
                Utc::now(),
            )
            .map(|_| ()),
        PersistOp::Clear => store.clear().map(|_| ()),
        PersistOp::Flush(done) => {
            let _ = done.send(());
            Ok(())
        }
    }
}
