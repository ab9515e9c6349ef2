use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Params, Row, params};
use serde::{Deserialize, Serialize};

use crate::db::{self, SharedConnection, decode_opt_ts, decode_ts, encode_ts};
use crate::error::{Error, Result};
use crate::matching::{ERROR_CONFIDENCE, MANUAL_CONFIDENCE, Strategy};
use crate::reconcile::PlayerKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkageState {
    Unresolved,
    InProgress,
    Resolved,
    ResolvedManual,
    Error,
}

impl LinkageState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkageState::Unresolved => "unresolved",
            LinkageState::InProgress => "in-progress",
            LinkageState::Resolved => "resolved",
            LinkageState::ResolvedManual => "resolved-manual",
            LinkageState::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unresolved" => Some(LinkageState::Unresolved),
            "in-progress" => Some(LinkageState::InProgress),
            "resolved" => Some(LinkageState::Resolved),
            "resolved-manual" => Some(LinkageState::ResolvedManual),
            "error" => Some(LinkageState::Error),
            _ => None,
        }
    }

    /// Unresolved and errored observations are picked up by reprocessing.
    /// In-progress rows belong to whoever holds the claim.
    pub fn is_pending(self) -> bool {
        matches!(self, LinkageState::Unresolved | LinkageState::Error)
    }
}

impl fmt::Display for LinkageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one processing attempt, written back onto the observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linkage {
    pub state: LinkageState,
    pub player_key: Option<PlayerKey>,
    pub confidence: Option<f64>,
    pub strategy: Option<Strategy>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Linkage {
    pub fn unresolved() -> Self {
        Self {
            state: LinkageState::Unresolved,
            player_key: None,
            confidence: None,
            strategy: None,
            processed_at: None,
            error: None,
        }
    }

    pub fn in_progress() -> Self {
        Self {
            state: LinkageState::InProgress,
            ..Self::unresolved()
        }
    }

    pub fn resolved(player_key: PlayerKey, confidence: f64, strategy: Strategy) -> Self {
        Self {
            state: LinkageState::Resolved,
            player_key: Some(player_key),
            confidence: Some(confidence),
            strategy: Some(strategy),
            processed_at: Some(Utc::now()),
            error: None,
        }
    }

    pub fn manual(player_key: PlayerKey) -> Self {
        Self {
            state: LinkageState::ResolvedManual,
            player_key: Some(player_key),
            confidence: Some(MANUAL_CONFIDENCE),
            strategy: Some(Strategy::ManualUnresolved),
            processed_at: Some(Utc::now()),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: LinkageState::Error,
            player_key: None,
            confidence: Some(ERROR_CONFIDENCE),
            strategy: None,
            processed_at: Some(Utc::now()),
            error: Some(message.into()),
        }
    }
}

/// One scout-authored sighting. Only `linkage` changes after submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoutingObservation {
    pub id: Option<i64>,
    pub player_name: String,
    pub team: String,
    pub position: Option<String>,
    pub rating: f64,
    pub potential: Option<f64>,
    pub notes: String,
    pub submitted_at: Option<DateTime<Utc>>,
    pub linkage: Linkage,
}

impl ScoutingObservation {
    pub fn new(player_name: impl Into<String>, team: impl Into<String>, rating: f64) -> Self {
        Self {
            id: None,
            player_name: player_name.into(),
            team: team.into(),
            position: None,
            rating,
            potential: None,
            notes: String::new(),
            submitted_at: None,
            linkage: Linkage::unresolved(),
        }
    }

    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    pub fn with_potential(mut self, potential: f64) -> Self {
        self.potential = Some(potential);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

const SELECT_COLUMNS: &str = "observation_id, player_name, team, position, rating, potential, notes, \
    submitted_at, linkage_state, name_key, team_key, confidence, strategy, processed_at, linkage_error";

const INSERT_SQL: &str = "INSERT INTO observations(player_name, team, position, rating, potential, notes, submitted_at, linkage_state, claimed_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(600);

/// Exclusive right to link one observation. Only the holder can write its
/// linkage; a newer claim on the same row invalidates older ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub observation_id: i64,
    token: i64,
}

pub struct ObservationStore {
    conn: SharedConnection,
    claim_lease: Duration,
}

impl ObservationStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self {
            conn,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// How long a claim holds before another worker may take the row over.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Persist a new observation as unresolved, for a later sweep to link.
    pub fn insert(&self, observation: &ScoutingObservation) -> Result<ScoutingObservation> {
        self.insert_row(observation, LinkageState::Unresolved, None)
    }

    /// Persist a new observation already claimed by the caller.
    pub fn insert_claimed(&self, observation: &ScoutingObservation) -> Result<(ScoutingObservation, Claim)> {
        let token = Utc::now().timestamp_millis();
        let stored = self.insert_row(observation, LinkageState::InProgress, Some(token))?;
        let observation_id = stored.id.ok_or(Error::NotPersisted)?;
        Ok((stored, Claim { observation_id, token }))
    }

    fn insert_row(
        &self,
        observation: &ScoutingObservation,
        state: LinkageState,
        claimed_at: Option<i64>,
    ) -> Result<ScoutingObservation> {
        let submitted_at = Utc::now();
        let conn = db::lock(&self.conn);
        conn.execute(
            INSERT_SQL,
            params![
                observation.player_name,
                observation.team,
                observation.position,
                observation.rating,
                observation.potential,
                observation.notes,
                encode_ts(submitted_at),
                state.as_str(),
                claimed_at,
            ],
        )?;
        let id = conn.last_insert_rowid();

        let mut stored = observation.clone();
        stored.id = Some(id);
        stored.submitted_at = Some(submitted_at);
        stored.linkage = match state {
            LinkageState::InProgress => Linkage::in_progress(),
            _ => Linkage::unresolved(),
        };
        Ok(stored)
    }

    pub fn get(&self, id: i64) -> Result<Option<ScoutingObservation>> {
        let conn = db::lock(&self.conn);
        let sql = format!("SELECT {SELECT_COLUMNS} FROM observations WHERE observation_id = ?1");
        let obs = conn.query_row(&sql, params![id], decode_observation).optional()?;
        Ok(obs)
    }

    /// Take a pending observation for linking. `None` when it is already
    /// linked or another worker holds a live claim on it.
    pub fn claim(&self, id: i64) -> Result<Option<Claim>> {
        let now = Utc::now().timestamp_millis();
        let conn = db::lock(&self.conn);
        let token = conn
            .query_row(
                "UPDATE observations
                 SET linkage_state = 'in-progress', claimed_at = MAX(?1, COALESCE(claimed_at, 0) + 1)
                 WHERE observation_id = ?2
                   AND (linkage_state IN ('unresolved', 'error')
                        OR (linkage_state = 'in-progress' AND COALESCE(claimed_at, 0) <= ?3))
                 RETURNING claimed_at",
                params![now, id, self.lease_cutoff(now)],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(token.map(|token| Claim {
            observation_id: id,
            token,
        }))
    }

    /// Write the outcome of a claimed observation and release the claim.
    pub fn finish(&self, claim: Claim, linkage: &Linkage) -> Result<()> {
        let conn = db::lock(&self.conn);
        finish_in(&conn, claim, linkage)
    }

    /// Observations waiting for a usable linkage, oldest first. Includes rows
    /// whose claim outlived the lease.
    pub fn list_pending(&self) -> Result<Vec<ScoutingObservation>> {
        let cutoff = self.lease_cutoff(Utc::now().timestamp_millis());
        self.query_list(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM observations
                 WHERE linkage_state IN ('unresolved', 'error')
                    OR (linkage_state = 'in-progress' AND COALESCE(claimed_at, 0) <= ?1)
                 ORDER BY observation_id ASC"
            ),
            params![cutoff],
        )
    }

    pub fn list_all(&self) -> Result<Vec<ScoutingObservation>> {
        self.query_list(
            &format!("SELECT {SELECT_COLUMNS} FROM observations ORDER BY observation_id ASC"),
            [],
        )
    }

    fn lease_cutoff(&self, now_ms: i64) -> i64 {
        let lease_ms = i64::try_from(self.claim_lease.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(lease_ms)
    }

    fn query_list(&self, sql: &str, params: impl Params) -> Result<Vec<ScoutingObservation>> {
        let conn = db::lock(&self.conn);
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, decode_observation)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Write the linkage of a claimed observation on `conn`, which may be an open
/// transaction. Fails with `ClaimLost` when the claim is no longer current.
pub(crate) fn finish_in(conn: &Connection, claim: Claim, linkage: &Linkage) -> Result<()> {
    let changed = conn.execute(
        "UPDATE observations
         SET linkage_state = ?1, name_key = ?2, team_key = ?3, confidence = ?4,
             strategy = ?5, processed_at = ?6, linkage_error = ?7, claimed_at = NULL
         WHERE observation_id = ?8 AND linkage_state = 'in-progress' AND claimed_at = ?9",
        params![
            linkage.state.as_str(),
            linkage.player_key.as_ref().map(|k| k.name.as_str()),
            linkage.player_key.as_ref().map(|k| k.team.as_str()),
            linkage.confidence,
            linkage.strategy.map(|s| s.as_str()),
            linkage.processed_at.map(encode_ts),
            linkage.error,
            claim.observation_id,
            claim.token,
        ],
    )?;
    if changed == 0 {
        return Err(Error::ClaimLost(claim.observation_id));
    }
    Ok(())
}

fn decode_observation(row: &Row<'_>) -> rusqlite::Result<ScoutingObservation> {
    let submitted_at: String = row.get(7)?;
    let state_raw: String = row.get(8)?;
    let state = LinkageState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown linkage state {state_raw:?}").into(),
        )
    })?;
    let name_key: Option<String> = row.get(9)?;
    let team_key: Option<String> = row.get(10)?;
    let strategy: Option<String> = row.get(12)?;

    Ok(ScoutingObservation {
        id: Some(row.get(0)?),
        player_name: row.get(1)?,
        team: row.get(2)?,
        position: row.get(3)?,
        rating: row.get(4)?,
        potential: row.get(5)?,
        notes: row.get(6)?,
        submitted_at: Some(decode_ts(7, &submitted_at)?),
        linkage: Linkage {
            state,
            player_key: name_key.map(|name| PlayerKey {
                name,
                team: team_key.unwrap_or_default(),
            }),
            confidence: row.get(11)?,
            strategy: strategy.as_deref().and_then(Strategy::parse),
            processed_at: decode_opt_ts(13, row.get(13)?)?,
            error: row.get(14)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ObservationStore {
        ObservationStore::new(db::shared(db::open_in_memory().expect("db should open")))
    }

    #[test]
    fn insert_assigns_id_and_starts_unresolved() {
        let store = store();
        let obs = ScoutingObservation::new("Florian Wirtz", "Leverkusen", 8.0)
            .with_position("AM")
            .with_potential(9.0)
            .with_notes("Pressed well, quick turns");
        let stored = store.insert(&obs).expect("insert should succeed");
        let id = stored.id.expect("id assigned");

        let loaded = store.get(id).expect("read").expect("row exists");
        assert_eq!(loaded, stored);
        assert_eq!(loaded.linkage.state, LinkageState::Unresolved);
        assert_eq!(loaded.notes, "Pressed well, quick turns");
        assert!(store.get(id + 100).expect("read").is_none());
    }

    #[test]
    fn linkage_rewrites_only_linkage_fields() {
        let store = store();
        let stored = store
            .insert(&ScoutingObservation::new("Phil Foden", "Man City", 7.0))
            .expect("insert");
        let id = stored.id.expect("id");

        let claim = store.claim(id).expect("claim").expect("unresolved row is claimable");
        store.finish(claim, &Linkage::failed("boom")).expect("write error");
        assert_eq!(store.list_pending().expect("pending").len(), 1);

        let claim = store.claim(id).expect("claim").expect("errored row is claimable");
        let key = PlayerKey::derive("Phil Foden", "Manchester City");
        let linkage = Linkage::resolved(key.clone(), 90.0, Strategy::Exact);
        store.finish(claim, &linkage).expect("write resolved");

        let loaded = store.get(id).expect("read").expect("row");
        assert_eq!(loaded.player_name, "Phil Foden");
        assert_eq!(loaded.linkage.state, LinkageState::Resolved);
        assert_eq!(loaded.linkage.player_key, Some(key));
        assert_eq!(loaded.linkage.confidence, Some(90.0));
        assert_eq!(loaded.linkage.strategy, Some(Strategy::Exact));
        assert!(loaded.linkage.error.is_none());
        assert!(store.list_pending().expect("pending").is_empty());
        assert!(store.claim(id).expect("claim").is_none());
        assert_eq!(store.list_all().expect("all").len(), 1);
    }

    #[test]
    fn a_row_has_one_claim_holder() {
        let store = store();
        let (stored, claim) = store
            .insert_claimed(&ScoutingObservation::new("Pedri", "Barcelona", 8.0))
            .expect("insert");
        let id = stored.id.expect("id");
        assert_eq!(stored.linkage.state, LinkageState::InProgress);
        assert_eq!(claim.observation_id, id);

        assert!(store.list_pending().expect("pending").is_empty());
        assert!(store.claim(id).expect("claim").is_none());

        store.finish(claim, &Linkage::failed("boom")).expect("holder may finish");
        assert!(matches!(
            store.finish(claim, &Linkage::failed("again")),
            Err(Error::ClaimLost(lost)) if lost == id
        ));
    }

    #[test]
    fn expired_claim_can_be_taken_over() {
        let store = store().with_claim_lease(Duration::ZERO);
        let (stored, stale) = store
            .insert_claimed(&ScoutingObservation::new("Pedri", "Barcelona", 8.0))
            .expect("insert");
        let id = stored.id.expect("id");

        assert_eq!(store.list_pending().expect("pending").len(), 1);
        let fresh = store.claim(id).expect("claim").expect("expired claim is reclaimable");
        assert_ne!(fresh, stale);

        assert!(matches!(
            store.finish(stale, &Linkage::failed("late")),
            Err(Error::ClaimLost(_))
        ));
        store.finish(fresh, &Linkage::failed("boom")).expect("new holder may finish");
        let loaded = store.get(id).expect("read").expect("row");
        assert_eq!(loaded.linkage.error.as_deref(), Some("boom"));
    }

    #[test]
    fn pending_states() {
        assert!(LinkageState::Unresolved.is_pending());
        assert!(LinkageState::Error.is_pending());
        assert!(!LinkageState::Resolved.is_pending());
        assert!(!LinkageState::ResolvedManual.is_pending());
        assert!(!LinkageState::InProgress.is_pending());
        assert_eq!(LinkageState::parse("in-progress"), Some(LinkageState::InProgress));
        assert_eq!(LinkageState::parse("resolved-manual"), Some(LinkageState::ResolvedManual));
    }
}
