//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::entry::{CacheEntry, CacheKey, CacheValue};
use crate::portal::types::{Resource, ResourceKind};

/// Trait for persistent cache backends.
///
/// Only server-confirmed entries are ever handed to a backend; optimistic
/// values live in memory until their mutation settles.
pub trait CacheStorage: Send + Sync {
  /// Load a previously stored entry.
  fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Store an entry, replacing any previous one.
  fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()>;

  /// Flag an entry as stale without touching its value.
  fn mark_stale(&self, key: &CacheKey) -> Result<()>;

  /// Forget an entry.
  fn remove(&self, key: &CacheKey) -> Result<()>;

  /// Flag every stored entry of one kind as stale.
  fn mark_kind_stale(&self, kind: ResourceKind) -> Result<()>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn load(&self, _key: &CacheKey) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn store(&self, _key: &CacheKey, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn mark_stale(&self, _key: &CacheKey) -> Result<()> {
    Ok(())
  }

  fn remove(&self, _key: &CacheKey) -> Result<()> {
    Ok(())
  }

  fn mark_kind_stale(&self, _kind: ResourceKind) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
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

    Ok(data_dir.join("docdesk").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Entity cache (stores serialized JSON of the tagged resource)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    stale INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (entity_type, entity_key)
);

-- List query tracking
CREATE TABLE IF NOT EXISTS query_cache (
    entity_type TEXT NOT NULL,
    query_hash TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    stale INTEGER NOT NULL DEFAULT 0,
    result_count INTEGER NOT NULL,
    PRIMARY KEY (entity_type, query_hash)
);

-- Query to entity mapping (preserves order)
CREATE TABLE IF NOT EXISTS query_results (
    entity_type TEXT NOT NULL,
    query_hash TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (entity_type, query_hash, entity_key)
);

CREATE INDEX IF NOT EXISTS idx_query_results_hash ON query_results(entity_type, query_hash);
"#;

fn upsert_entity(
  conn: &Connection,
  resource: &Resource,
  cached_at: &str,
  stale: bool,
) -> Result<()> {
  let data =
    serde_json::to_vec(resource).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entity_cache (entity_type, entity_key, data, cached_at, stale)
       VALUES (?, ?, ?, ?, ?)",
      params![resource.kind().as_str(), resource.id(), data, cached_at, stale],
    )
    .map_err(|e| eyre!("Failed to store entity: {}", e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;

    match key {
      CacheKey::Entity { kind, id } => {
        let row: Option<(Vec<u8>, String, bool)> = conn
          .query_row(
            "SELECT data, cached_at, stale FROM entity_cache
             WHERE entity_type = ? AND entity_key = ?",
            params![kind.as_str(), id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
          )
          .optional()
          .map_err(|e| eyre!("Failed to load entity {}: {}", key, e))?;

        let Some((data, cached_at, stale)) = row else {
          return Ok(None);
        };

        let resource: Resource = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize entity: {}", e))?;

        Ok(Some(CacheEntry {
          value: CacheValue::Entity(resource),
          cached_at: parse_datetime(&cached_at)?,
          stale,
        }))
      }
      CacheKey::List { kind, query } => {
        let info: Option<(String, bool)> = conn
          .query_row(
            "SELECT cached_at, stale FROM query_cache
             WHERE entity_type = ? AND query_hash = ?",
            params![kind.as_str(), query],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .optional()
          .map_err(|e| eyre!("Failed to load query {}: {}", key, e))?;

        let Some((cached_at, stale)) = info else {
          return Ok(None);
        };

        // Get entities in order
        let mut stmt = conn
          .prepare(
            "SELECT ec.data FROM entity_cache ec
             INNER JOIN query_results qr
               ON ec.entity_type = qr.entity_type AND ec.entity_key = qr.entity_key
             WHERE qr.entity_type = ? AND qr.query_hash = ?
             ORDER BY qr.position",
          )
          .map_err(|e| eyre!("Failed to prepare entity query: {}", e))?;

        let rows: Vec<Vec<u8>> = stmt
          .query_map(params![kind.as_str(), query], |row| row.get(0))
          .map_err(|e| eyre!("Failed to query entities: {}", e))?
          .collect::<rusqlite::Result<_>>()
          .map_err(|e| eyre!("Failed to read entities: {}", e))?;

        let items = rows
          .iter()
          .map(|data| serde_json::from_slice::<Resource>(data))
          .collect::<serde_json::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to deserialize entity: {}", e))?;

        Ok(Some(CacheEntry {
          value: CacheValue::List(items),
          cached_at: parse_datetime(&cached_at)?,
          stale,
        }))
      }
    }
  }

  fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    let mut conn = self.conn()?;
    let cached_at = entry.cached_at.to_rfc3339();

    match (key, &entry.value) {
      (CacheKey::Entity { .. }, CacheValue::Entity(resource)) => {
        upsert_entity(&conn, resource, &cached_at, entry.stale)
      }
      (CacheKey::List { kind, query }, CacheValue::List(items)) => {
        let tx = conn
          .transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

        // Delete existing query results
        tx.execute(
          "DELETE FROM query_results WHERE entity_type = ? AND query_hash = ?",
          params![kind.as_str(), query],
        )
        .map_err(|e| eyre!("Failed to delete old query results: {}", e))?;

        tx.execute(
          "INSERT OR REPLACE INTO query_cache (entity_type, query_hash, cached_at, stale, result_count)
           VALUES (?, ?, ?, ?, ?)",
          params![kind.as_str(), query, cached_at, entry.stale, items.len()],
        )
        .map_err(|e| eyre!("Failed to update query cache: {}", e))?;

        for (position, item) in items.iter().enumerate() {
          upsert_entity(&tx, item, &cached_at, entry.stale)?;

          tx.execute(
            "INSERT OR REPLACE INTO query_results (entity_type, query_hash, entity_key, position)
             VALUES (?, ?, ?, ?)",
            params![kind.as_str(), query, item.id(), position],
          )
          .map_err(|e| eyre!("Failed to store query result: {}", e))?;
        }

        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

        Ok(())
      }
      _ => Err(eyre!("Value shape does not match cache key {}", key)),
    }
  }

  fn mark_stale(&self, key: &CacheKey) -> Result<()> {
    let conn = self.conn()?;

    let result = match key {
      CacheKey::Entity { kind, id } => conn.execute(
        "UPDATE entity_cache SET stale = 1 WHERE entity_type = ? AND entity_key = ?",
        params![kind.as_str(), id],
      ),
      CacheKey::List { kind, query } => conn.execute(
        "UPDATE query_cache SET stale = 1 WHERE entity_type = ? AND query_hash = ?",
        params![kind.as_str(), query],
      ),
    };

    result.map_err(|e| eyre!("Failed to mark {} stale: {}", key, e))?;
    Ok(())
  }

  fn remove(&self, key: &CacheKey) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    match key {
      CacheKey::Entity { kind, id } => {
        // Dropping the mapping rows keeps stored lists from resurrecting it
        tx.execute(
          "DELETE FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
          params![kind.as_str(), id],
        )
        .map_err(|e| eyre!("Failed to remove entity: {}", e))?;
        tx.execute(
          "DELETE FROM query_results WHERE entity_type = ? AND entity_key = ?",
          params![kind.as_str(), id],
        )
        .map_err(|e| eyre!("Failed to remove query results: {}", e))?;
      }
      CacheKey::List { kind, query } => {
        tx.execute(
          "DELETE FROM query_results WHERE entity_type = ? AND query_hash = ?",
          params![kind.as_str(), query],
        )
        .map_err(|e| eyre!("Failed to remove query results: {}", e))?;
        tx.execute(
          "DELETE FROM query_cache WHERE entity_type = ? AND query_hash = ?",
          params![kind.as_str(), query],
        )
        .map_err(|e| eyre!("Failed to remove query: {}", e))?;
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn mark_kind_stale(&self, kind: ResourceKind) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "UPDATE entity_cache SET stale = 1 WHERE entity_type = ?",
        params![kind.as_str()],
      )
      .map_err(|e| eyre!("Failed to mark {} entities stale: {}", kind, e))?;
    conn
      .execute(
        "UPDATE query_cache SET stale = 1 WHERE entity_type = ?",
        params![kind.as_str()],
      )
      .map_err(|e| eyre!("Failed to mark {} queries stale: {}", kind, e))?;

    Ok(())
  }
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
