//! SQLite-backed cache store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{CacheHandle, CacheStore};
use crate::net::{Method, Request, Response};

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cache generation; rowid gives creation order
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by generation and request URL hash
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    kind TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_request ON entries(request_key);
"#;

/// SQLite-based cache store implementation.
#[derive(Clone)]
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
  /// Open (or create) the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::from_connection(conn)
  }

  /// Default directory holding the per-variant databases.
  pub fn default_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-agent"))
  }

  /// Every generation with its creation time, oldest first.
  pub fn generations(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
    let conn = lock(&self.conn)?;

    let mut stmt = conn
      .prepare("SELECT name, created_at FROM generations ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<(String, String)>>>()
      .map_err(|e| eyre!("Failed to read generation: {}", e))?;

    rows
      .into_iter()
      .map(|(name, created_at)| Ok((name, parse_datetime(&created_at)?)))
      .collect()
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
  conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
}

/// Stable, fixed-length storage key for a request.
fn request_key(request: &Request) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.cache_url().as_bytes());
  hex::encode(hasher.finalize())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

fn row_to_response(row: (u16, String, String, Vec<u8>)) -> Result<Response> {
  let (status, kind, headers, body) = row;
  let kind = kind.parse()?;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize stored headers: {}", e))?;

  Ok(Response::new(status, kind, body).with_headers(headers))
}

fn ensure_storable(request: &Request) -> Result<()> {
  if request.method != Method::Get {
    return Err(eyre!(
      "Cannot store {} {}: only GET requests are cacheable",
      request.method,
      request.url
    ));
  }
  Ok(())
}

fn generation_exists(conn: &Connection, name: &str) -> Result<bool> {
  conn
    .query_row(
      "SELECT 1 FROM generations WHERE name = ?",
      params![name],
      |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| eyre!("Failed to look up generation {}: {}", name, e))
}

fn insert_entry(
  conn: &Connection,
  generation: &str,
  request: &Request,
  response: Response,
) -> Result<()> {
  let key = request_key(request);
  let (status, kind, headers, body) = response.into_parts();
  let headers =
    serde_json::to_string(&headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (generation, request_key, url, status, kind, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        key,
        request.cache_url(),
        status,
        kind.as_str(),
        headers,
        &body[..]
      ],
    )
    .map_err(|e| eyre!("Failed to store response for {}: {}", request.url, e))?;

  Ok(())
}

#[async_trait]
impl CacheStore for SqliteStore {
  type Handle = SqliteGeneration;

  async fn open(&self, name: &str) -> Result<SqliteGeneration> {
    let conn = lock(&self.conn)?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to create generation {}: {}", name, e))?;

    Ok(SqliteGeneration {
      conn: Arc::clone(&self.conn),
      name: name.to_string(),
    })
  }

  async fn match_request(&self, request: &Request) -> Result<Option<Response>> {
    if request.method != Method::Get {
      return Ok(None);
    }

    let conn = lock(&self.conn)?;
    let row = conn
      .query_row(
        "SELECT e.status, e.kind, e.headers, e.body FROM entries e
         INNER JOIN generations g ON g.name = e.generation
         WHERE e.request_key = ?
         ORDER BY g.rowid
         LIMIT 1",
        params![request_key(request)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", request.url, e))?;

    row.map(row_to_response).transpose()
  }

  async fn keys(&self) -> Result<Vec<String>> {
    let conn = lock(&self.conn)?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation name: {}", e))?;

    Ok(names)
  }

  async fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = lock(&self.conn)?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE generation = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }
}

/// Handle to a single generation inside a [`SqliteStore`].
#[derive(Clone)]
pub struct SqliteGeneration {
  conn: Arc<Mutex<Connection>>,
  name: String,
}

#[async_trait]
impl CacheHandle for SqliteGeneration {
  fn name(&self) -> &str {
    &self.name
  }

  async fn put(&self, request: &Request, response: Response) -> Result<()> {
    ensure_storable(request)?;

    let conn = lock(&self.conn)?;
    // A handle may outlive its generation if it was reconciled away meanwhile
    if !generation_exists(&conn, &self.name)? {
      return Err(eyre!("Generation {} no longer exists", self.name));
    }

    insert_entry(&conn, &self.name, request, response)
  }

  async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<()> {
    for (request, _) in &entries {
      ensure_storable(request)?;
    }

    let mut conn = lock(&self.conn)?;
    if !generation_exists(&conn, &self.name)? {
      return Err(eyre!("Generation {} no longer exists", self.name));
    }

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (request, response) in entries {
      insert_entry(&tx, &self.name, &request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  async fn keys(&self) -> Result<Vec<String>> {
    let conn = lock(&self.conn)?;

    let mut stmt = conn
      .prepare("SELECT url FROM entries WHERE generation = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![self.name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", self.name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry URL: {}", e))?;

    Ok(urls)
  }
}
