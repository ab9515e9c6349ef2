use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;

const APP_DIR: &str = "scout_link";
const DB_FILE: &str = "scout.sqlite";
const BUSY_TIMEOUT_MS: u64 = 2_000;

/// One SQLite connection shared by the stores of a process.
pub type SharedConnection = Arc<Mutex<Connection>>;

pub fn app_cache_dir() -> Option<PathBuf> {
    if let Ok(base) = std::env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(APP_DIR));
    }
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(APP_DIR))
}

pub fn default_db_path() -> Option<PathBuf> {
    app_cache_dir().map(|dir| dir.join(DB_FILE))
}

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn shared(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

pub(crate) fn lock(conn: &SharedConnection) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS observations (
            observation_id INTEGER PRIMARY KEY AUTOINCREMENT,
            player_name TEXT NOT NULL,
            team TEXT NOT NULL,
            position TEXT NULL,
            rating REAL NOT NULL,
            potential REAL NULL,
            notes TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            linkage_state TEXT NOT NULL,
            name_key TEXT NULL,
            team_key TEXT NULL,
            confidence REAL NULL,
            strategy TEXT NULL,
            processed_at TEXT NULL,
            linkage_error TEXT NULL,
            claimed_at INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_observations_state ON observations(linkage_state);

        CREATE TABLE IF NOT EXISTS observed_players (
            player_id INTEGER PRIMARY KEY AUTOINCREMENT,
            name_key TEXT NOT NULL,
            team_key TEXT NOT NULL,
            display_name TEXT NOT NULL,
            team TEXT NOT NULL,
            position TEXT NULL,
            sightings INTEGER NOT NULL,
            avg_rating REAL NOT NULL,
            best_rating REAL NOT NULL,
            worst_rating REAL NOT NULL,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            confidence REAL NOT NULL,
            strategy TEXT NOT NULL,
            catalog_name TEXT NULL,
            catalog_team TEXT NULL,
            UNIQUE(name_key, team_key)
        );
        CREATE INDEX IF NOT EXISTS idx_observed_players_catalog ON observed_players(catalog_name);

        CREATE TABLE IF NOT EXISTS match_audit (
            audit_id INTEGER PRIMARY KEY AUTOINCREMENT,
            recorded_at TEXT NOT NULL,
            query_name TEXT NOT NULL,
            query_team TEXT NULL,
            candidate_name TEXT NULL,
            candidate_team TEXT NULL,
            confidence REAL NULL,
            strategy TEXT NULL,
            catalog_rows INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn decode_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
        })
}

pub(crate) fn decode_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| decode_ts(idx, &raw)).transpose()
}
