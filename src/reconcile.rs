use std::fmt;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{self, SharedConnection, decode_ts, encode_ts};
use crate::error::{Error, Result};
use crate::matching::{MANUAL_CONFIDENCE, MatchOutcome, Strategy};
use crate::normalize::normalize;

pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;
const CONFLICT_BACKOFF_MS: u64 = 15;

/// Identity of an observed player: normalized name and team.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerKey {
    pub name: String,
    pub team: String,
}

impl PlayerKey {
    pub fn derive(name: &str, team: &str) -> Self {
        Self {
            name: normalize(name),
            team: normalize(team),
        }
    }
}

impl fmt::Display for PlayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.team)
    }
}

/// What a single sighting contributes to the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub position: Option<String>,
    pub rating: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingStats {
    pub average: f64,
    pub best: f64,
    pub worst: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRef {
    pub name: String,
    pub team: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedPlayerRecord {
    pub key: PlayerKey,
    pub name: String,
    pub team: String,
    pub position: Option<String>,
    pub sightings: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub ratings: RatingStats,
    pub confidence: f64,
    pub strategy: Strategy,
    pub catalog_ref: Option<CatalogRef>,
}

struct UpsertRow<'a> {
    key: PlayerKey,
    name: &'a str,
    team: &'a str,
    position: Option<&'a str>,
    rating: f64,
    confidence: f64,
    strategy: Strategy,
    catalog_ref: Option<(&'a str, &'a str)>,
}

// Column references in DO UPDATE read the row as it was before this statement,
// so every aggregate below is computed from the previous sighting count.
// A manual sighting never downgrades a record already linked to the catalog.
const UPSERT_SQL: &str = r#"
    INSERT INTO observed_players (
        name_key, team_key, display_name, team, position, sightings,
        avg_rating, best_rating, worst_rating, first_seen, last_seen,
        confidence, strategy, catalog_name, catalog_team
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, 1,
        ?6, ?6, ?6, ?7, ?7,
        ?8, ?9, ?10, ?11
    )
    ON CONFLICT(name_key, team_key) DO UPDATE SET
        sightings = sightings + 1,
        avg_rating = (avg_rating * sightings + excluded.avg_rating) / (sightings + 1),
        best_rating = MAX(best_rating, excluded.best_rating),
        worst_rating = MIN(worst_rating, excluded.worst_rating),
        last_seen = excluded.last_seen,
        position = COALESCE(excluded.position, position),
        display_name = CASE
            WHEN catalog_name IS NULL AND excluded.catalog_name IS NOT NULL THEN excluded.display_name
            ELSE display_name END,
        team = CASE
            WHEN catalog_name IS NULL AND excluded.catalog_name IS NOT NULL THEN excluded.team
            ELSE team END,
        confidence = CASE
            WHEN catalog_name IS NOT NULL AND excluded.catalog_name IS NULL THEN confidence
            ELSE excluded.confidence END,
        strategy = CASE
            WHEN catalog_name IS NOT NULL AND excluded.catalog_name IS NULL THEN strategy
            ELSE excluded.strategy END,
        catalog_name = COALESCE(excluded.catalog_name, catalog_name),
        catalog_team = COALESCE(excluded.catalog_team, catalog_team)
"#;

const SELECT_COLUMNS: &str = "name_key, team_key, display_name, team, position, sightings, \
    avg_rating, best_rating, worst_rating, first_seen, last_seen, confidence, strategy, \
    catalog_name, catalog_team";

/// Registry of observed players, one row per normalized (name, team).
pub struct ReconciliationStore {
    conn: SharedConnection,
    max_attempts: u32,
}

impl ReconciliationStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self {
            conn,
            max_attempts: DEFAULT_CONFLICT_RETRIES + 1,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.max_attempts = retries.saturating_add(1);
        self
    }

    /// Merge a catalog match into the registry, keyed by the candidate's
    /// normalized name and team.
    pub fn upsert_from_match(&self, outcome: &MatchOutcome, sighting: &Sighting) -> Result<PlayerKey> {
        self.upsert_from_match_then(outcome, sighting, |_| Ok(()))
    }

    /// Like `upsert_from_match`, and runs `then` in the same transaction. The
    /// upsert is rolled back when `then` fails.
    pub fn upsert_from_match_then(
        &self,
        outcome: &MatchOutcome,
        sighting: &Sighting,
        then: impl Fn(&Connection) -> Result<()>,
    ) -> Result<PlayerKey> {
        let candidate = &outcome.candidate;
        let position = candidate
            .position
            .as_deref()
            .or(sighting.position.as_deref());
        let row = UpsertRow {
            key: PlayerKey::derive(&candidate.name, &candidate.team),
            name: &candidate.name,
            team: &candidate.team,
            position,
            rating: sighting.rating,
            confidence: outcome.confidence,
            strategy: outcome.strategy,
            catalog_ref: Some((&candidate.name, &candidate.team)),
        };
        self.upsert(row, then)
    }

    /// Merge a sighting that matched nothing in the catalog, keyed by the
    /// observer's own spelling.
    pub fn upsert_manual(
        &self,
        name: &str,
        team: &str,
        position: Option<&str>,
        rating: f64,
    ) -> Result<PlayerKey> {
        self.upsert_manual_then(name, team, position, rating, |_| Ok(()))
    }

    pub fn upsert_manual_then(
        &self,
        name: &str,
        team: &str,
        position: Option<&str>,
        rating: f64,
        then: impl Fn(&Connection) -> Result<()>,
    ) -> Result<PlayerKey> {
        let row = UpsertRow {
            key: PlayerKey::derive(name, team),
            name: name.trim(),
            team: team.trim(),
            position,
            rating,
            confidence: MANUAL_CONFIDENCE,
            strategy: Strategy::ManualUnresolved,
            catalog_ref: None,
        };
        self.upsert(row, then)
    }

    /// Lookup by raw name and team; both are normalized first.
    pub fn get_by_key(&self, name: &str, team: &str) -> Result<Option<ObservedPlayerRecord>> {
        let key = PlayerKey::derive(name, team);
        let conn = db::lock(&self.conn);
        let sql = format!("SELECT {SELECT_COLUMNS} FROM observed_players WHERE name_key = ?1 AND team_key = ?2");
        let record = conn
            .query_row(&sql, params![key.name, key.team], decode_record)
            .optional()?;
        Ok(record)
    }

    pub fn list_all(&self) -> Result<Vec<ObservedPlayerRecord>> {
        self.query_list(&format!(
            "SELECT {SELECT_COLUMNS} FROM observed_players ORDER BY player_id ASC"
        ))
    }

    /// Records that carry a back-reference into the catalog.
    pub fn list_resolved_against_catalog(&self) -> Result<Vec<ObservedPlayerRecord>> {
        self.query_list(&format!(
            "SELECT {SELECT_COLUMNS} FROM observed_players WHERE catalog_name IS NOT NULL ORDER BY player_id ASC"
        ))
    }

    pub fn count(&self) -> Result<usize> {
        let conn = db::lock(&self.conn);
        let n = conn.query_row("SELECT COUNT(*) FROM observed_players", [], |row| row.get::<_, i64>(0))?;
        Ok(n.max(0) as usize)
    }

    fn query_list(&self, sql: &str) -> Result<Vec<ObservedPlayerRecord>> {
        let conn = db::lock(&self.conn);
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], decode_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn upsert(&self, row: UpsertRow<'_>, then: impl Fn(&Connection) -> Result<()>) -> Result<PlayerKey> {
        if !row.rating.is_finite() {
            return Err(Error::InvalidRating(row.rating));
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_upsert(&row, &then) {
                Ok(()) => return Ok(row.key),
                Err(Error::Persistence(err)) if is_write_conflict(&err) => {
                    if attempt >= self.max_attempts {
                        return Err(Error::ReconciliationConflict {
                            key: row.key.to_string(),
                            attempts: attempt,
                        });
                    }
                    debug!(key = %row.key, attempt, "upsert collided with another writer; retrying");
                    thread::sleep(Duration::from_millis(CONFLICT_BACKOFF_MS * u64::from(attempt)));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_upsert(&self, row: &UpsertRow<'_>, then: &impl Fn(&Connection) -> Result<()>) -> Result<()> {
        let mut conn = db::lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = encode_ts(Utc::now());
        tx.execute(
            UPSERT_SQL,
            params![
                row.key.name,
                row.key.team,
                row.name,
                row.team,
                row.position,
                row.rating,
                now,
                row.confidence,
                row.strategy.as_str(),
                row.catalog_ref.map(|(name, _)| name),
                row.catalog_ref.map(|(_, team)| team),
            ],
        )?;
        then(&tx)?;
        tx.commit()?;
        Ok(())
    }
}

fn is_write_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn decode_record(row: &Row<'_>) -> rusqlite::Result<ObservedPlayerRecord> {
    let first_seen: String = row.get(9)?;
    let last_seen: String = row.get(10)?;
    let strategy_raw: String = row.get(12)?;
    let strategy = Strategy::parse(&strategy_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            12,
            rusqlite::types::Type::Text,
            format!("unknown strategy {strategy_raw:?}").into(),
        )
    })?;
    let catalog_name: Option<String> = row.get(13)?;
    let catalog_team: Option<String> = row.get(14)?;

    Ok(ObservedPlayerRecord {
        key: PlayerKey {
            name: row.get(0)?,
            team: row.get(1)?,
        },
        name: row.get(2)?,
        team: row.get(3)?,
        position: row.get(4)?,
        sightings: row.get::<_, i64>(5)?.clamp(0, i64::from(u32::MAX)) as u32,
        ratings: RatingStats {
            average: row.get(6)?,
            best: row.get(7)?,
            worst: row.get(8)?,
        },
        first_seen: decode_ts(9, &first_seen)?,
        last_seen: decode_ts(10, &last_seen)?,
        confidence: row.get(11)?,
        strategy,
        catalog_ref: catalog_name.map(|name| CatalogRef {
            name,
            team: catalog_team.unwrap_or_default(),
        }),
    })
}
