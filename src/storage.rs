//! Projection store trait and built-in backends.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::record::Record;

/// Key-addressed persistence for projection rows.
///
/// Implementations must make [`put`](ProjectionStore::put) atomic with
/// respect to concurrent [`get`](ProjectionStore::get) and `put` on the same
/// key: a reader sees either the old row or the new one, never a mix. The
/// projector already guarantees a single writer per key, so backends do not
/// need to serialize writers themselves.
///
/// Methods are blocking. The projector calls them from actor threads or
/// through `spawn_blocking`.
pub trait ProjectionStore: Send + Sync + 'static {
    /// Read the row for `id` in `R::TABLE`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the row cannot be read or decoded.
    fn get<R: Record>(&self, id: u64) -> Result<Option<R>, StoreError>;

    /// Insert or replace the row keyed by `record.id()`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the row cannot be encoded or written.
    fn put<R: Record>(&self, record: &R) -> Result<(), StoreError>;

    /// Every row in `R::TABLE`, ordered by id.
    ///
    /// Returns an empty vector when the table has no rows. Rows written
    /// while the listing is in progress may or may not be included.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the table cannot be read.
    fn list_all<R: Record>(&self) -> Result<Vec<R>, StoreError>;
}

/// Volatile store backed by per-table ordered maps.
///
/// Rows are held as `serde_json::Value` so one map can carry every record
/// kind.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<&'static str, BTreeMap<u64, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProjectionStore for MemoryStore {
    fn get<R: Record>(&self, id: u64) -> Result<Option<R>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        tables
            .get(R::TABLE)
            .and_then(|rows| rows.get(&id))
            .map(|row| R::deserialize(row))
            .transpose()
            .map_err(StoreError::from)
    }

    fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let row = serde_json::to_value(record)?;
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        tables.entry(R::TABLE).or_default().insert(record.id(), row);
        Ok(())
    }

    fn list_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        let Some(rows) = tables.get(R::TABLE) else {
            return Ok(Vec::new());
        };
        rows.values()
            .map(|row| R::deserialize(row).map_err(StoreError::from))
            .collect()
    }
}

/// Durable store keeping one JSON file per row.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     tables/
///         service/
///             11.json
///         exchange/
///             1.json
/// ```
///
/// Writes go to `<id>.json.tmp` and are renamed over `<id>.json`, so a crash
/// mid-write never leaves a partially written row behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the tables directory cannot be created.
    pub fn open(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let store = Self {
            base_dir: base_dir.into(),
        };
        fs::create_dir_all(store.tables_dir())?;
        Ok(store)
    }

    /// Returns the root directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/tables`
    pub fn tables_dir(&self) -> PathBuf {
        self.base_dir.join("tables")
    }

    /// `<base_dir>/tables/<table>`
    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.tables_dir().join(table)
    }

    /// `<base_dir>/tables/<table>/<id>.json`
    pub fn row_path(&self, table: &str, id: u64) -> PathBuf {
        self.table_dir(table).join(format!("{id}.json"))
    }
}

fn decode_row<R: Record>(path: &Path, bytes: &[u8]) -> Result<R, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Corrupt {
        path: path.to_owned(),
        source,
    })
}

impl ProjectionStore for FileStore {
    fn get<R: Record>(&self, id: u64) -> Result<Option<R>, StoreError> {
        let path = self.row_path(R::TABLE, id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode_row(&path, &bytes).map(Some)
    }

    fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        fs::create_dir_all(self.table_dir(R::TABLE))?;
        let path = self.row_path(R::TABLE, record.id());
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp_path, &json)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn list_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let entries = match fs::read_dir(self.table_dir(R::TABLE)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut rows = Vec::new();
        for entry in entries {
            let path = entry?.path();
            // `<id>.json.tmp` has extension `tmp` and is skipped here.
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                // Only possible if something other than the projector removed the row.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            rows.push(decode_row::<R>(&path, &bytes)?);
        }

        rows.sort_by_key(|row| row.id());
        Ok(rows)
    }
}
