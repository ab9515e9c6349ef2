use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::{self, SharedConnection, decode_ts, encode_ts};
use crate::error::Result;
use crate::matching::Strategy;

/// One cascade attempt, found or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchAuditEntry {
    pub recorded_at: DateTime<Utc>,
    pub query_name: String,
    pub query_team: Option<String>,
    pub candidate_name: Option<String>,
    pub candidate_team: Option<String>,
    pub confidence: Option<f64>,
    pub strategy: Option<Strategy>,
    pub catalog_rows: usize,
}

impl MatchAuditEntry {
    pub fn is_hit(&self) -> bool {
        self.candidate_name.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub name: String,
    pub team: String,
    pub score: f64,
}

/// Receives diagnostics from the matching cascade. Implementations must
/// tolerate concurrent calls; no ordering is promised between entries.
pub trait DiagnosticsSink: Send + Sync {
    fn record_attempt(&self, entry: &MatchAuditEntry);

    fn record_suggestions(&self, _query: &str, _suggestions: &[Suggestion]) {}
}

/// Writes entries as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record_attempt(&self, entry: &MatchAuditEntry) {
        match (&entry.candidate_name, entry.strategy) {
            (Some(candidate), Some(strategy)) => debug!(
                query = %entry.query_name,
                candidate = %candidate,
                confidence = entry.confidence.unwrap_or_default(),
                strategy = strategy.as_str(),
                "match resolved"
            ),
            _ => info!(
                query = %entry.query_name,
                team = entry.query_team.as_deref().unwrap_or(""),
                catalog_rows = entry.catalog_rows,
                "no catalog match"
            ),
        }
    }

    fn record_suggestions(&self, query: &str, suggestions: &[Suggestion]) {
        if suggestions.is_empty() {
            return;
        }
        let names = suggestions
            .iter()
            .map(|s| format!("{} ({}, {:.1})", s.name, s.team, s.score))
            .collect::<Vec<_>>()
            .join("; ");
        info!(query = %query, suggestions = %names, "did you mean");
    }
}

/// Keeps everything in memory. Handy for tools and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<MatchAuditEntry>>,
    suggestions: Mutex<Vec<(String, Vec<Suggestion>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<MatchAuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recent suggestion list recorded for `query`.
    pub fn suggestions_for(&self, query: &str) -> Option<Vec<Suggestion>> {
        self.suggestions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(q, _)| q == query)
            .map(|(_, s)| s.clone())
    }
}

impl DiagnosticsSink for MemorySink {
    fn record_attempt(&self, entry: &MatchAuditEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
    }

    fn record_suggestions(&self, query: &str, suggestions: &[Suggestion]) {
        self.suggestions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((query.to_string(), suggestions.to_vec()));
    }
}

/// Appends entries to the `match_audit` table.
pub struct SqliteAuditSink {
    conn: SharedConnection,
}

impl SqliteAuditSink {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub fn append(&self, entry: &MatchAuditEntry) -> Result<()> {
        let conn = db::lock(&self.conn);
        conn.execute(
            "INSERT INTO match_audit(recorded_at, query_name, query_team, candidate_name, candidate_team, confidence, strategy, catalog_rows)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                encode_ts(entry.recorded_at),
                entry.query_name,
                entry.query_team,
                entry.candidate_name,
                entry.candidate_team,
                entry.confidence,
                entry.strategy.map(|s| s.as_str()),
                entry.catalog_rows as i64,
            ],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<MatchAuditEntry>> {
        let conn = db::lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT recorded_at, query_name, query_team, candidate_name, candidate_team, confidence, strategy, catalog_rows
             FROM match_audit
             ORDER BY audit_id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let recorded_at: String = row.get(0)?;
            let strategy: Option<String> = row.get(6)?;
            Ok(MatchAuditEntry {
                recorded_at: decode_ts(0, &recorded_at)?,
                query_name: row.get(1)?,
                query_team: row.get(2)?,
                candidate_name: row.get(3)?,
                candidate_team: row.get(4)?,
                confidence: row.get(5)?,
                strategy: strategy.as_deref().and_then(Strategy::parse),
                catalog_rows: row.get::<_, i64>(7)?.max(0) as usize,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl DiagnosticsSink for SqliteAuditSink {
    fn record_attempt(&self, entry: &MatchAuditEntry) {
        if let Err(err) = self.append(entry) {
            warn!(error = %err, query = %entry.query_name, "failed to persist match audit entry");
        }
    }
}

/// Forwards to every inner sink.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn DiagnosticsSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn DiagnosticsSink>>) -> Self {
        Self { sinks }
    }
}

impl DiagnosticsSink for FanoutSink {
    fn record_attempt(&self, entry: &MatchAuditEntry) {
        for sink in &self.sinks {
            sink.record_attempt(entry);
        }
    }

    fn record_suggestions(&self, query: &str, suggestions: &[Suggestion]) {
        for sink in &self.sinks {
            sink.record_suggestions(query, suggestions);
        }
    }
}
