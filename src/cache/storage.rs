//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CachedSnapshot, RequestKey, ResponseSnapshot};

/// Trait for cache storage backends.
///
/// A backend holds named cache generations, each mapping request keys to
/// response snapshots. Every call is atomic per key.
pub trait CacheStore: Send + Sync {
  /// Create the generation if it does not exist yet.
  fn open(&self, generation: &str) -> Result<()>;

  /// Store one entry, replacing any previous snapshot for the key.
  fn put(&self, generation: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()>;

  /// Store the offline manifest and mark the generation installed, in one
  /// transaction: either every entry lands and the mark is set, or nothing does.
  fn install_manifest(
    &self,
    generation: &str,
    entries: &[(RequestKey, ResponseSnapshot)],
  ) -> Result<()>;

  /// Whether the generation finished an install.
  fn is_installed(&self, generation: &str) -> Result<bool>;

  /// Generation currently in control, if any has been activated.
  fn active_generation(&self) -> Result<Option<String>>;

  /// Hand control to an installed generation.
  fn set_active(&self, generation: &str) -> Result<()>;

  /// Look up a key in a single generation.
  fn match_in(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedSnapshot>>;

  /// Look up a key across all generations, oldest generation first.
  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedSnapshot>>;

  /// Drop a generation and its entries. Returns whether it existed.
  /// Dropping the active generation leaves no generation in control.
  fn delete(&self, generation: &str) -> Result<bool>;

  /// Generation names in creation order.
  fn generations(&self) -> Result<Vec<String>>;

  /// Number of entries held by a generation.
  fn entry_count(&self, generation: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A throwaway database that lives as long as the storage value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-cache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cache generation, id gives creation order
CREATE TABLE IF NOT EXISTS cache_generations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    -- Set once the manifest landed; NULL while opened but not installed
    installed_at TEXT
);

-- Single row naming the generation in control
CREATE TABLE IF NOT EXISTS active_generation (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    name TEXT NOT NULL,
    activated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request hash
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    request_description TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_hash),
    FOREIGN KEY (generation) REFERENCES cache_generations(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_hash ON cache_entries(request_hash);
"#;

fn ensure_generation(conn: &Connection, generation: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to open cache generation {}: {}", generation, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  generation: &str,
  key: &RequestKey,
  snapshot: &ResponseSnapshot,
) -> Result<()> {
  let headers = serde_json::to_string(&snapshot.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (generation, request_hash, request_description, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        key.digest(),
        key.description(),
        snapshot.status,
        headers,
        snapshot.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key.description(), e))?;

  Ok(())
}

type EntryRow = (String, u16, String, Vec<u8>, String);

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_cached((generation, status, headers, body, cached_at): EntryRow) -> Result<CachedSnapshot> {
  let headers: Vec<(String, String)> =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to parse cached headers: {}", e))?;

  Ok(CachedSnapshot {
    snapshot: ResponseSnapshot {
      status,
      headers,
      body,
    },
    generation,
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl CacheStore for SqliteStorage {
  fn open(&self, generation: &str) -> Result<()> {
    let conn = self.conn()?;
    ensure_generation(&conn, generation)
  }

  fn put(&self, generation: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_generation(&tx, generation)?;
    insert_entry(&tx, generation, key, snapshot)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn install_manifest(
    &self,
    generation: &str,
    entries: &[(RequestKey, ResponseSnapshot)],
  ) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_generation(&tx, generation)?;
    for (key, snapshot) in entries {
      insert_entry(&tx, generation, key, snapshot)?;
    }

    tx.execute(
      "UPDATE cache_generations SET installed_at = datetime('now') WHERE name = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to mark {} installed: {}", generation, e))?;

    // Dropping an uncommitted transaction rolls it back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn is_installed(&self, generation: &str) -> Result<bool> {
    let conn = self.conn()?;

    let installed_at: Option<Option<String>> = conn
      .query_row(
        "SELECT installed_at FROM cache_generations WHERE name = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read install state of {}: {}", generation, e))?;

    Ok(installed_at.flatten().is_some())
  }

  fn active_generation(&self) -> Result<Option<String>> {
    let conn = self.conn()?;

    conn
      .query_row("SELECT name FROM active_generation WHERE id = 1", [], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read active generation: {}", e))
  }

  fn set_active(&self, generation: &str) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO active_generation (id, name, activated_at)
         VALUES (1, ?, datetime('now'))",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to activate {}: {}", generation, e))?;

    Ok(())
  }

  fn match_in(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedSnapshot>> {
    let conn = self.conn()?;

    let row = conn
      .query_row(
        "SELECT generation, status, headers, body, cached_at FROM cache_entries
         WHERE generation = ? AND request_hash = ?",
        params![generation, key.digest()],
        entry_from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.description(), e))?;

    row.map(into_cached).transpose()
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedSnapshot>> {
    let conn = self.conn()?;

    let row = conn
      .query_row(
        "SELECT e.generation, e.status, e.headers, e.body, e.cached_at
         FROM cache_entries e
         INNER JOIN cache_generations g ON g.name = e.generation
         WHERE e.request_hash = ?
         ORDER BY g.id
         LIMIT 1",
        params![key.digest()],
        entry_from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.description(), e))?;

    row.map(into_cached).transpose()
  }

  fn delete(&self, generation: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", generation, e))?;

    tx.execute(
      "DELETE FROM active_generation WHERE name = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to clear active generation {}: {}", generation, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_generations WHERE name = ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to delete cache generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache generation: {}", e))?;

    Ok(names)
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    let conn = self.conn()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", generation, e))?;

    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
