use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::audit::{DiagnosticsSink, MatchAuditEntry, Suggestion};
use crate::catalog::{CanonicalPlayerRecord, CatalogHandle, CatalogSnapshot};
use crate::error::Result;
use crate::normalize::{normalize, normalize_opt, teams_overlap};
use crate::similarity::token_similarity;

pub const EXACT_CONFIDENCE: f64 = 100.0;
pub const EXACT_TEAM_MISMATCH_CONFIDENCE: f64 = 90.0;
pub const MANUAL_CONFIDENCE: f64 = 0.0;
pub const ERROR_CONFIDENCE: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Exact,
    Fuzzy,
    Partial,
    ManualUnresolved,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Exact => "exact",
            Strategy::Fuzzy => "fuzzy",
            Strategy::Partial => "partial",
            Strategy::ManualUnresolved => "manual-unresolved",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "exact" => Some(Strategy::Exact),
            "fuzzy" => Some(Strategy::Fuzzy),
            "partial" => Some(Strategy::Partial),
            "manual-unresolved" => Some(Strategy::ManualUnresolved),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    pub min_confidence: f64,
    // Added to a fuzzy score when the teams overlap; result capped at 100.
    pub team_bonus: f64,
    pub partial_cap: f64,
    pub partial_min_token_len: usize,
    pub suggestion_limit: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            min_confidence: 70.0,
            team_bonus: 10.0,
            partial_cap: 80.0,
            partial_min_token_len: 3,
            suggestion_limit: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub candidate: CanonicalPlayerRecord,
    pub confidence: f64,
    pub strategy: Strategy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(MatchOutcome),
    NotFound,
}

impl Resolution {
    pub fn found(&self) -> Option<&MatchOutcome> {
        match self {
            Resolution::Found(outcome) => Some(outcome),
            Resolution::NotFound => None,
        }
    }
}

/// Anything that can turn a free-text sighting into a catalog identity.
pub trait Resolver: Send + Sync {
    fn resolve(&self, name: &str, team: Option<&str>, min_confidence: f64) -> Result<Resolution>;
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    confidence: f64,
}

/// Ordered exact → fuzzy → partial lookup against the catalog snapshot.
///
/// A strategy only runs when every earlier one produced no candidate, so an
/// exact hit at 90 beats a fuzzy hit that would have scored 100. Among the
/// candidates of one strategy the highest confidence wins, and equal scores go
/// to the entry that appears first in the catalog.
pub struct MatchingCascade {
    catalog: Arc<CatalogHandle>,
    sink: Arc<dyn DiagnosticsSink>,
    config: MatchConfig,
}

impl MatchingCascade {
    pub fn new(catalog: Arc<CatalogHandle>, sink: Arc<dyn DiagnosticsSink>, config: MatchConfig) -> Self {
        Self {
            catalog,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn resolve(&self, name: &str, team: Option<&str>, min_confidence: f64) -> Resolution {
        let snapshot = match self.catalog.require_snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, query = %name, "catalog unavailable; lookup treated as not found");
                let empty = self.catalog.current();
                self.audit(&empty, name, team, None);
                return Resolution::NotFound;
            }
        };

        let name_norm = normalize(name);
        let team_norm = normalize_opt(team);

        let hit = if name_norm.is_empty() {
            None
        } else {
            self.exact(&snapshot, &name_norm, &team_norm)
                .map(|c| (c, Strategy::Exact))
                .or_else(|| {
                    self.fuzzy(&snapshot, &name_norm, &team_norm, min_confidence)
                        .map(|c| (c, Strategy::Fuzzy))
                })
                .or_else(|| {
                    self.partial(&snapshot, &name_norm, min_confidence)
                        .map(|c| (c, Strategy::Partial))
                })
        };

        let resolution = match hit {
            Some((candidate, strategy)) => Resolution::Found(MatchOutcome {
                candidate: snapshot.entries()[candidate.index].record.clone(),
                confidence: candidate.confidence,
                strategy,
            }),
            None => Resolution::NotFound,
        };
        self.audit(&snapshot, name, team, resolution.found());

        if resolution == Resolution::NotFound && !name_norm.is_empty() {
            let suggestions = suggest_in(&snapshot, &name_norm, self.config.suggestion_limit);
            self.sink.record_suggestions(name, &suggestions);
        }
        resolution
    }

    /// Closest catalog names by fuzzy score, best first.
    pub fn suggest(&self, name: &str, limit: usize) -> Vec<Suggestion> {
        let snapshot = self.catalog.snapshot();
        suggest_in(&snapshot, &normalize(name), limit)
    }

    fn exact(&self, snapshot: &CatalogSnapshot, name_norm: &str, team_norm: &str) -> Option<Candidate> {
        let candidates = snapshot.lookup_exact(name_norm).map(|(index, entry)| {
            // A team-less catalog row is confirmed by a team-less query.
            let same_team = teams_overlap(team_norm, &entry.team_norm)
                || (team_norm.is_empty() && entry.team_norm.is_empty());
            let confidence = if same_team {
                EXACT_CONFIDENCE
            } else {
                EXACT_TEAM_MISMATCH_CONFIDENCE
            };
            (index, confidence)
        });
        best_of(candidates)
    }

    fn fuzzy(
        &self,
        snapshot: &CatalogSnapshot,
        name_norm: &str,
        team_norm: &str,
        min_confidence: f64,
    ) -> Option<Candidate> {
        let scores: Vec<f64> = snapshot
            .entries()
            .par_iter()
            .map(|entry| token_similarity(name_norm, &entry.name_norm))
            .collect();

        let candidates = snapshot
            .entries()
            .iter()
            .zip(scores)
            .enumerate()
            .filter(|(_, (_, score))| *score >= min_confidence)
            .map(|(index, (entry, score))| {
                let confidence = if teams_overlap(team_norm, &entry.team_norm) {
                    (score + self.config.team_bonus).min(100.0)
                } else {
                    score
                };
                (index, confidence)
            });
        best_of(candidates)
    }

    fn partial(&self, snapshot: &CatalogSnapshot, name_norm: &str, min_confidence: f64) -> Option<Candidate> {
        let tokens: Vec<&str> = name_norm
            .split_whitespace()
            .filter(|t| t.chars().count() >= self.config.partial_min_token_len)
            .collect();
        if tokens.is_empty() {
            return None;
        }
        let cap = self.config.partial_cap;

        let candidates = snapshot.entries().iter().enumerate().filter_map(|(index, entry)| {
            let matches = tokens
                .iter()
                .filter(|t| entry.name_norm.contains(**t))
                .count();
            if matches == 0 {
                return None;
            }
            let raw = matches as f64 / tokens.len() as f64 * cap;
            let confidence = round1(raw.min(cap));
            (confidence >= min_confidence).then_some((index, confidence))
        });
        best_of(candidates)
    }

    fn audit(
        &self,
        snapshot: &CatalogSnapshot,
        name: &str,
        team: Option<&str>,
        outcome: Option<&MatchOutcome>,
    ) {
        let entry = MatchAuditEntry {
            recorded_at: Utc::now(),
            query_name: name.to_string(),
            query_team: team.map(str::to_string),
            candidate_name: outcome.map(|o| o.candidate.name.clone()),
            candidate_team: outcome.map(|o| o.candidate.team.clone()),
            confidence: outcome.map(|o| o.confidence),
            strategy: outcome.map(|o| o.strategy),
            catalog_rows: snapshot.len(),
        };
        self.sink.record_attempt(&entry);
    }
}

impl Resolver for MatchingCascade {
    fn resolve(&self, name: &str, team: Option<&str>, min_confidence: f64) -> Result<Resolution> {
        Ok(MatchingCascade::resolve(self, name, team, min_confidence))
    }
}

// Strictly-greater comparison keeps the first-encountered entry on ties.
fn best_of(candidates: impl Iterator<Item = (usize, f64)>) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;
    for (index, confidence) in candidates {
        if best.is_none_or(|b| confidence > b.confidence) {
            best = Some(Candidate { index, confidence });
        }
    }
    best
}

fn suggest_in(snapshot: &CatalogSnapshot, name_norm: &str, limit: usize) -> Vec<Suggestion> {
    if name_norm.is_empty() || limit == 0 {
        return Vec::new();
    }
    let mut scored: Vec<(usize, f64)> = snapshot
        .entries()
        .par_iter()
        .enumerate()
        .map(|(idx, entry)| (idx, token_similarity(name_norm, &entry.name_norm)))
        .filter(|(_, score)| *score > 0.0)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored
        .into_iter()
        .take(limit)
        .map(|(idx, score)| {
            let record = &snapshot.entries()[idx].record;
            Suggestion {
                name: record.name.clone(),
                team: record.team.clone(),
                score,
            }
        })
        .collect()
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
