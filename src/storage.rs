//! Persistence backends for artifact records.
//!
//! The retention store only ever needs two things from storage: read the
//! whole mapping and replace the whole mapping. Keeping that behind
//! [`RecordStorage`] lets production use a JSON file (or SQLite for shared
//! deployments) while tests swap in [`MemoryStorage`].

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the JSON mapping inside the downloads directory.
pub const JSON_STORE_FILE: &str = ".metadata.json";
/// File name of the SQLite database inside the downloads directory.
pub const SQLITE_STORE_FILE: &str = ".metadata.db";

/// Bookkeeping for one artifact. The filename is the map key, so it is not
/// repeated here; the serialized shape is exactly `{createdAt, accessed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactRecord {
    /// Milliseconds since the Unix epoch at registration time.
    pub created_at: i64,
    pub accessed: bool,
}

impl ArtifactRecord {
    pub fn new(created_at: i64) -> Self {
        Self {
            created_at,
            accessed: false,
        }
    }
}

/// Filename -> record. Ordered so the persisted JSON is stable across saves.
pub type RetentionMap = BTreeMap<String, ArtifactRecord>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("record mapping at {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("record database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("record storage unavailable: {0}")]
    Unavailable(String),
}

/// Whole-mapping persistence used by the retention store.
pub trait RecordStorage: Send + Sync {
    /// Returns the persisted mapping. Absent storage is an empty mapping, not
    /// an error.
    fn load(&self) -> Result<RetentionMap, StorageError>;

    /// Replaces the persisted mapping with `map`.
    fn save(&self, map: &RetentionMap) -> Result<(), StorageError>;
}

/// Parses the JSON mapping format. Exposed so callers can validate a file
/// without going through a store.
pub fn parse_mapping(raw: &str) -> Result<RetentionMap, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Serializes a mapping with two-space indentation.
pub fn render_mapping(map: &RetentionMap) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(map)
}

/// The default backend: one pretty-printed JSON object next to the artifacts.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Uses the conventional `.metadata.json` location inside `downloads_dir`.
    pub fn in_dir(downloads_dir: &Path) -> Self {
        Self::new(downloads_dir.join(JSON_STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl RecordStorage for JsonFileStorage {
    fn load(&self) -> Result<RetentionMap, StorageError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(RetentionMap::new()),
            Err(err) => return Err(self.io_error(err)),
        };

        parse_mapping(&raw).map_err(|source| StorageError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, map: &RetentionMap) -> Result<(), StorageError> {
        let payload = render_mapping(map).map_err(|source| StorageError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, payload.as_bytes()).map_err(|err| self.io_error(err))
    }
}

/// Writes to a uniquely named sibling temp file, then renames it over `path`.
/// Concurrent writers (including other processes) never share a temp file.
fn write_atomic(path: &Path, payload: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".metadata.")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(payload)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// SQLite-backed storage for deployments where several processes share one
/// downloads directory. Connections are opened per call, so the struct stays
/// `Sync` and never holds a lock between requests.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    db_path: PathBuf,
}

impl SqliteStorage {
    /// Opens (and if necessary creates) the database and its schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let storage = Self {
            db_path: path.as_ref().to_path_buf(),
        };
        if let Some(parent) = storage.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        storage.with_connection(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS artifacts (
                    filename TEXT PRIMARY KEY,
                    created_at INTEGER NOT NULL,
                    accessed INTEGER NOT NULL DEFAULT 0
                );
                "#,
            )?;
            Ok(())
        })?;
        Ok(storage)
    }

    /// Uses the conventional `.metadata.db` location inside `downloads_dir`.
    pub fn in_dir(downloads_dir: &Path) -> Result<Self, StorageError> {
        Self::open(downloads_dir.join(SQLITE_STORE_FILE))
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError>,
    {
        let mut conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        f(&mut conn)
    }
}

impl RecordStorage for SqliteStorage {
    fn load(&self) -> Result<RetentionMap, StorageError> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT filename, created_at, accessed FROM artifacts")?;
            let mut rows = stmt.query([])?;
            let mut map = RetentionMap::new();
            while let Some(row) = rows.next()? {
                let filename: String = row.get(0)?;
                let record = ArtifactRecord {
                    created_at: row.get(1)?,
                    accessed: row.get::<_, i64>(2)? != 0,
                };
                map.insert(filename, record);
            }
            Ok(map)
        })
    }

    /// Replaces every row in one transaction so readers never observe a
    /// half-written mapping.
    fn save(&self, map: &RetentionMap) -> Result<(), StorageError> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM artifacts", [])?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO artifacts (filename, created_at, accessed) VALUES (?1, ?2, ?3)",
                )?;
                for (filename, record) in map {
                    insert.execute(params![filename, record.created_at, record.accessed as i64])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }
}

/// In-memory storage for tests. Can be flipped into a corrupt or read-only
/// mode to exercise the degraded paths of the retention store.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    map: RetentionMap,
    corrupt: bool,
    fail_saves: bool,
    saves: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(map: RetentionMap) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                map,
                ..MemoryState::default()
            }),
        }
    }

    /// Makes subsequent loads fail as if the backing data were unparsable.
    /// The next successful save clears the flag.
    pub fn set_corrupt(&self, corrupt: bool) {
        self.state.lock().corrupt = corrupt;
    }

    /// Makes subsequent saves fail without touching the stored mapping.
    pub fn set_fail_saves(&self, fail: bool) {
        self.state.lock().fail_saves = fail;
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.state.lock().saves
    }

    /// Current contents, ignoring the corrupt flag.
    pub fn snapshot(&self) -> RetentionMap {
        self.state.lock().map.clone()
    }
}

impl RecordStorage for MemoryStorage {
    fn load(&self) -> Result<RetentionMap, StorageError> {
        let state = self.state.lock();
        if state.corrupt {
            return Err(StorageError::Unavailable("simulated corrupt mapping".into()));
        }
        Ok(state.map.clone())
    }

    fn save(&self, map: &RetentionMap) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.fail_saves {
            return Err(StorageError::Unavailable("simulated write failure".into()));
        }
        state.map = map.clone();
        state.corrupt = false;
        state.saves += 1;
        Ok(())
    }
}
