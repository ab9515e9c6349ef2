use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::matching::{Resolution, Resolver};
use crate::observations::{Claim, Linkage, ObservationStore, ScoutingObservation, finish_in};
use crate::reconcile::{PlayerKey, ReconciliationStore, Sighting};

/// Records scouting observations and links them to observed players.
///
/// The observation row is written before any matching happens. Everything
/// after that point is recovered locally: a failure is stored on the
/// observation as an `error` linkage for the reprocessing job to retry.
///
/// Both stores must live in the same database; the linkage is written inside
/// the registry's upsert transaction.
pub struct ObservationIntake {
    observations: ObservationStore,
    players: Arc<ReconciliationStore>,
    resolver: Arc<dyn Resolver>,
    min_confidence: f64,
}

impl ObservationIntake {
    pub fn new(
        observations: ObservationStore,
        players: Arc<ReconciliationStore>,
        resolver: Arc<dyn Resolver>,
        min_confidence: f64,
    ) -> Self {
        Self {
            observations,
            players,
            resolver,
            min_confidence,
        }
    }

    pub fn observations(&self) -> &ObservationStore {
        &self.observations
    }

    pub fn players(&self) -> &ReconciliationStore {
        &self.players
    }

    /// Save the observation, then try to link it.
    ///
    /// The row is written already claimed, so a concurrent sweep leaves it
    /// alone. Only a failure to save the observation itself is returned as an
    /// error.
    pub fn submit(&self, observation: ScoutingObservation) -> Result<ScoutingObservation> {
        let (mut stored, claim) = self.observations.insert_claimed(&observation)?;
        stored.linkage = match self.link_claimed(&stored, claim) {
            Ok(linkage) => linkage,
            Err(err) => {
                warn!(
                    observation = claim.observation_id,
                    player = %stored.player_name,
                    error = %err,
                    "observation saved but linking failed"
                );
                self.observations
                    .get(claim.observation_id)
                    .ok()
                    .flatten()
                    .map(|row| row.linkage)
                    .unwrap_or_else(|| Linkage::failed(err.to_string()))
            }
        };
        Ok(stored)
    }

    /// Claim an already-persisted observation, run matching and
    /// reconciliation, and write the resulting linkage back onto it.
    ///
    /// Returns `Ok(None)` without doing anything when the observation is
    /// already linked or another worker holds it. A matching or reconciliation
    /// failure is written as an `error` linkage and also returned, so batch
    /// callers can count it.
    pub fn process(&self, observation: &ScoutingObservation) -> Result<Option<Linkage>> {
        let id = observation.id.ok_or(Error::NotPersisted)?;
        let Some(claim) = self.observations.claim(id)? else {
            debug!(observation = id, "observation already linked or claimed; skipping");
            return Ok(None);
        };
        self.link_claimed(observation, claim).map(Some)
    }

    fn link_claimed(&self, observation: &ScoutingObservation, claim: Claim) -> Result<Linkage> {
        match self.link(observation, claim) {
            Ok(linkage) => Ok(linkage),
            // Someone else owns the row now; their outcome stands.
            Err(err @ Error::ClaimLost(_)) => Err(err),
            Err(err) => {
                if let Err(write_err) = self.observations.finish(claim, &Linkage::failed(err.to_string())) {
                    warn!(
                        observation = claim.observation_id,
                        error = %write_err,
                        "could not record linking failure; row is retried once the claim expires"
                    );
                }
                Err(err)
            }
        }
    }

    // The registry upsert and the linkage write share one transaction, so an
    // observation is counted exactly once or not at all.
    fn link(&self, observation: &ScoutingObservation, claim: Claim) -> Result<Linkage> {
        let team = Some(observation.team.as_str()).filter(|t| !t.trim().is_empty());
        let resolution = self.resolve_guarded(&observation.player_name, team)?;

        match resolution {
            Resolution::Found(outcome) => {
                let candidate = &outcome.candidate;
                let linkage = Linkage::resolved(
                    PlayerKey::derive(&candidate.name, &candidate.team),
                    outcome.confidence,
                    outcome.strategy,
                );
                let sighting = Sighting {
                    position: observation.position.clone(),
                    rating: observation.rating,
                };
                self.players.upsert_from_match_then(&outcome, &sighting, |conn| {
                    finish_in(conn, claim, &linkage)
                })?;
                Ok(linkage)
            }
            Resolution::NotFound => {
                let linkage = Linkage::manual(PlayerKey::derive(&observation.player_name, &observation.team));
                let key = self.players.upsert_manual_then(
                    &observation.player_name,
                    &observation.team,
                    observation.position.as_deref(),
                    observation.rating,
                    |conn| finish_in(conn, claim, &linkage),
                )?;
                info!(player = %observation.player_name, key = %key, "no catalog match; recorded manually");
                Ok(linkage)
            }
        }
    }

    // A panicking resolver must not take the caller down with it.
    fn resolve_guarded(&self, name: &str, team: Option<&str>) -> Result<Resolution> {
        let resolver = &self.resolver;
        let min_confidence = self.min_confidence;
        panic::catch_unwind(AssertUnwindSafe(|| resolver.resolve(name, team, min_confidence)))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "resolver panicked".to_string());
                Err(Error::Matching(message))
            })
    }
}
