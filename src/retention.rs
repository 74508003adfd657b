//! Artifact retention bookkeeping.
//!
//! Every media file the backend produces is registered here with its creation
//! time. Serving a file marks it accessed, and a sweep deletes anything older
//! than [`RETENTION_WINDOW_MS`]. The store is strictly best-effort: no
//! operation returns an error to its caller, because losing a record only
//! delays disk cleanup while failing a download would hurt the user.
//!
//! Each operation is a read-modify-write of the whole mapping, serialized by
//! an in-process mutex. Separate processes sharing one downloads directory are
//! not coordinated and can still overwrite each other's updates.

use std::{
    fmt, io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::storage::{ArtifactRecord, RecordStorage, RetentionMap, StorageError};

/// Age at which an artifact becomes eligible for deletion: 24 hours.
pub const RETENTION_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Source of the current time, swappable so tests can fast-forward.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records that had reached the retention window.
    pub expired: usize,
    /// Expired records whose file is now gone; these were dropped.
    pub deleted: usize,
    /// Expired records kept because the file could not be removed.
    pub failed: usize,
    /// True when the mapping could not be read and nothing was done.
    pub aborted: bool,
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.aborted {
            return write!(f, "sweep aborted");
        }
        write!(
            f,
            "{} expired, {} deleted, {} kept for retry",
            self.expired, self.deleted, self.failed
        )
    }
}

pub struct RetentionStore {
    storage: Arc<dyn RecordStorage>,
    clock: Arc<dyn Clock>,
    artifacts_dir: PathBuf,
    guard: Mutex<()>,
}

impl fmt::Debug for RetentionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionStore")
            .field("artifacts_dir", &self.artifacts_dir)
            .finish_non_exhaustive()
    }
}

impl RetentionStore {
    pub fn new(
        storage: Arc<dyn RecordStorage>,
        clock: Arc<dyn Clock>,
        artifacts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            storage,
            clock,
            artifacts_dir: artifacts_dir.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Starts tracking `filename`, which the caller has already written into
    /// the artifacts directory. Re-registering a name resets its age.
    pub fn register(&self, filename: &str) {
        if !is_artifact_key(filename) {
            warn!(filename, "refusing to track artifact outside the artifacts directory");
            return;
        }

        let _guard = self.guard.lock();
        let mut map = match self.storage.load() {
            Ok(map) => map,
            Err(err) => {
                warn!(error = %err, "discarding unreadable artifact records");
                RetentionMap::new()
            }
        };

        map.insert(
            filename.to_owned(),
            ArtifactRecord::new(self.clock.now_millis()),
        );

        match self.storage.save(&map) {
            Ok(()) => debug!(filename, "registered artifact"),
            Err(err) => warn!(filename, error = %err, "failed to persist artifact registration"),
        }
    }

    /// Flags `filename` as served. Unknown names are ignored so artifacts
    /// created outside the download flow never cause errors.
    pub fn mark_accessed(&self, filename: &str) {
        let _guard = self.guard.lock();
        let mut map = match self.storage.load() {
            Ok(map) => map,
            Err(err) => {
                warn!(filename, error = %err, "cannot read artifact records; access not recorded");
                return;
            }
        };

        let Some(record) = map.get_mut(filename) else {
            debug!(filename, "access for untracked artifact ignored");
            return;
        };
        if record.accessed {
            return;
        }
        record.accessed = true;

        if let Err(err) = self.storage.save(&map) {
            warn!(filename, error = %err, "failed to persist artifact access");
        }
    }

    /// Deletes the artifact right away (post-serve cleanup). The record is
    /// dropped only once the file is gone; otherwise it stays for the sweep.
    /// Returns whether the file no longer exists.
    pub fn discard(&self, filename: &str) -> bool {
        if !is_artifact_key(filename) {
            warn!(filename, "refusing to delete artifact outside the artifacts directory");
            return false;
        }

        let _guard = self.guard.lock();
        if let Err(err) = remove_artifact(&self.artifacts_dir.join(filename)) {
            warn!(filename, error = %err, "failed to delete served artifact; leaving it for the sweep");
            return false;
        }

        let mut map = match self.storage.load() {
            Ok(map) => map,
            Err(err) => {
                warn!(filename, error = %err, "artifact deleted but records are unreadable");
                return true;
            }
        };
        if map.remove(filename).is_some()
            && let Err(err) = self.storage.save(&map)
        {
            warn!(filename, error = %err, "failed to drop record of deleted artifact");
        }
        debug!(filename, "discarded served artifact");
        true
    }

    /// Deletes every artifact whose age has reached the retention window and
    /// rewrites the mapping with the survivors.
    pub fn sweep(&self) -> SweepReport {
        let _guard = self.guard.lock();
        let map = match self.storage.load() {
            Ok(map) => map,
            Err(err) => {
                warn!(error = %err, "skipping sweep; artifact records are unreadable");
                return SweepReport {
                    aborted: true,
                    ..SweepReport::default()
                };
            }
        };

        let now = self.clock.now_millis();
        let mut report = SweepReport::default();
        let mut survivors = RetentionMap::new();

        for (filename, record) in map {
            if !is_expired(&record, now) {
                survivors.insert(filename, record);
                continue;
            }

            report.expired += 1;
            let outcome = if is_artifact_key(&filename) {
                remove_artifact(&self.artifacts_dir.join(&filename))
            } else {
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "record key escapes the artifacts directory",
                ))
            };

            match outcome {
                Ok(()) => {
                    info!(filename = %filename, "deleted expired artifact");
                    report.deleted += 1;
                }
                Err(err) => {
                    warn!(filename = %filename, error = %err, "failed to delete expired artifact");
                    report.failed += 1;
                    survivors.insert(filename, record);
                }
            }
        }

        if let Err(err) = self.storage.save(&survivors) {
            warn!(error = %err, "failed to persist swept artifact records");
        }
        report
    }

    /// Snapshot of the persisted mapping.
    pub fn records(&self) -> Result<RetentionMap, StorageError> {
        let _guard = self.guard.lock();
        self.storage.load()
    }
}

fn is_expired(record: &ArtifactRecord, now_millis: i64) -> bool {
    now_millis.saturating_sub(record.created_at) >= RETENTION_WINDOW_MS
}

/// An already-missing file counts as deleted.
fn remove_artifact(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// True when `name` is a relative path made only of normal components
/// (`a.mp4`, `sub/a.mp4`), so joining it onto the artifacts directory can
/// never escape it.
pub fn is_artifact_key(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// True when `name` is exactly one normal path component.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}
