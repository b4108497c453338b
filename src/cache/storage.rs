//! Cache storage trait and its SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{Request, Response};

/// A stored response together with where and when it was cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  /// The cached response
  pub response: Response,
  /// Generation the response was found in
  pub cache_name: String,
  /// When the response was cached
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A store holds any number of named collections (cache generations), each
/// mapping a request key to a response. Implementations are responsible for
/// their own consistency: a single call is atomic with respect to other calls.
pub trait CacheStorage: Send + Sync {
  /// Open a collection, creating it if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Insert entries into a collection in one atomic write, creating the
  /// collection if needed. Existing entries for the same key are replaced.
  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Match a request against a single collection.
  fn match_in(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Match a request against every collection, oldest collection first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>>;

  /// Collection names in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a collection. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Number of entries in a collection, or None if it does not exist.
  fn entry_count(&self, name: &str) -> Result<Option<usize>>;
}

/// Key a request is stored under. Fragments never reach the server, so they
/// are not part of the key.
fn request_url_key(request: &Request) -> String {
  let mut url = request.url.clone();
  url.set_fragment(None);
  url.to_string()
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the store at a specific path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
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

    Ok(data_dir.join("salus").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cache generation; id preserves creation order
CREATE TABLE IF NOT EXISTS caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Request -> response entries
CREATE TABLE IF NOT EXISTS entries (
    cache_id INTEGER NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_id, method, url),
    FOREIGN KEY (cache_id) REFERENCES caches(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_request ON entries(method, url);
"#;

/// Raw entry columns as read from SQLite.
type EntryRow = (String, String, u16, String, Vec<u8>, String);

fn ensure_cache(conn: &Connection, name: &str) -> Result<i64> {
  conn
    .execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create cache {}: {}", name, e))?;

  conn
    .query_row(
      "SELECT id FROM caches WHERE name = ?",
      params![name],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))
}

fn entry_from_row(row: EntryRow) -> Result<CachedResponse> {
  let (cache_name, response_url, status, headers, body, cached_at) = row;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

  Ok(CachedResponse {
    response: Response {
      url: response_url,
      status,
      headers,
      body,
    },
    cache_name,
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    ensure_cache(&conn, name)?;
    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Rolled back on drop unless committed
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let cache_id = ensure_cache(&tx, name)?;

    for (request, response) in entries {
      if !request.is_cacheable() {
        return Err(eyre!(
          "Cannot cache {} request for {}",
          request.method,
          request.url
        ));
      }

      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO entries
           (cache_id, method, url, response_url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          cache_id,
          request.method,
          request_url_key(request),
          response.url,
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", request.url, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_in(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_cacheable() {
      return Ok(None);
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT c.name, e.response_url, e.status, e.headers, e.body, e.cached_at
         FROM entries e INNER JOIN caches c ON c.id = e.cache_id
         WHERE c.name = ? AND e.method = ? AND e.url = ?",
        params![name, request.method, request_url_key(request)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {} in {}: {}", request.url, name, e))?;

    row.map(entry_from_row).transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_cacheable() {
      return Ok(None);
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT c.name, e.response_url, e.status, e.headers, e.body, e.cached_at
         FROM entries e INNER JOIN caches c ON c.id = e.cache_id
         WHERE e.method = ? AND e.url = ?
         ORDER BY c.id
         LIMIT 1",
        params![request.method, request_url_key(request)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {}: {}", request.url, e))?;

    row.map(entry_from_row).transpose()
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM entries WHERE cache_id IN (SELECT id FROM caches WHERE name = ?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn entry_count(&self, name: &str) -> Result<Option<usize>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let cache_id: Option<i64> = conn
      .query_row(
        "SELECT id FROM caches WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))?;

    let Some(cache_id) = cache_id else {
      return Ok(None);
    };

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE cache_id = ?",
        params![cache_id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", name, e))?;

    Ok(Some(count as usize))
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// A named collection held by [`MemoryStorage`].
struct MemoryCache {
  name: String,
  entries: Vec<(String, String, CachedResponse)>,
}

impl MemoryCache {
  fn find(&self, request: &Request) -> Option<&CachedResponse> {
    let key = request_url_key(request);
    self
      .entries
      .iter()
      .find(|(method, url, _)| *method == request.method && *url == key)
      .map(|(_, _, cached)| cached)
  }
}

/// Storage implementation that keeps everything in process memory.
/// Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
  caches: Mutex<Vec<MemoryCache>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, name: &str) -> Result<()> {
    let mut caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if !caches.iter().any(|c| c.name == name) {
      caches.push(MemoryCache {
        name: name.to_string(),
        entries: Vec::new(),
      });
    }

    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()> {
    if let Some((request, _)) = entries.iter().find(|(r, _)| !r.is_cacheable()) {
      return Err(eyre!(
        "Cannot cache {} request for {}",
        request.method,
        request.url
      ));
    }

    self.open(name)?;

    let mut caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let cache = caches
      .iter_mut()
      .find(|c| c.name == name)
      .ok_or_else(|| eyre!("Cache {} vanished during write", name))?;

    let cached_at = Utc::now();
    for (request, response) in entries {
      let key = request_url_key(request);
      cache
        .entries
        .retain(|(method, url, _)| !(*method == request.method && *url == key));
      cache.entries.push((
        request.method.clone(),
        key,
        CachedResponse {
          response: response.clone(),
          cache_name: name.to_string(),
          cached_at,
        },
      ));
    }

    Ok(())
  }

  fn match_in(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_cacheable() {
      return Ok(None);
    }

    let caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      caches
        .iter()
        .find(|c| c.name == name)
        .and_then(|c| c.find(request))
        .cloned(),
    )
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_cacheable() {
      return Ok(None);
    }

    let caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(caches.iter().find_map(|c| c.find(request)).cloned())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(caches.iter().map(|c| c.name.clone()).collect())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let before = caches.len();
    caches.retain(|c| c.name != name);
    Ok(caches.len() != before)
  }

  fn entry_count(&self, name: &str) -> Result<Option<usize>> {
    let caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      caches
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.entries.len()),
    )
  }
}
