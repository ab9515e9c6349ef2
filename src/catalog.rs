use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::normalize::normalize;

/// One row of the reference player dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPlayerRecord {
    pub name: String,
    pub team: String,
    pub position: Option<String>,
    pub age: Option<u32>,
    #[serde(default)]
    pub attributes: PerformanceAttributes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAttributes {
    pub appearances: Option<u32>,
    pub minutes: Option<u32>,
    pub goals: Option<u32>,
    pub assists: Option<u32>,
    pub xg: Option<f64>,
    pub xa: Option<f64>,
    pub rating: Option<f64>,
}

impl CanonicalPlayerRecord {
    pub fn new(name: impl Into<String>, team: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            team: team.into(),
            position: None,
            age: None,
            attributes: PerformanceAttributes::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub record: CanonicalPlayerRecord,
    pub name_norm: String,
    pub team_norm: String,
}

/// Immutable, indexed view of the catalog at one point in time.
#[derive(Debug)]
pub struct CatalogSnapshot {
    entries: Vec<CatalogEntry>,
    by_name: HashMap<String, Vec<usize>>,
    loaded_at: DateTime<Utc>,
}

impl CatalogSnapshot {
    pub fn new(records: Vec<CanonicalPlayerRecord>) -> Self {
        let mut entries = Vec::with_capacity(records.len());
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for record in records {
            let name_norm = normalize(&record.name);
            let team_norm = normalize(&record.team);
            by_name.entry(name_norm.clone()).or_default().push(entries.len());
            entries.push(CatalogEntry {
                record,
                name_norm,
                team_norm,
            });
        }
        Self {
            entries,
            by_name,
            loaded_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in upstream order.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Entries whose normalized name equals `name_norm`, with their position,
    /// in upstream order.
    pub fn lookup_exact<'a>(
        &'a self,
        name_norm: &'a str,
    ) -> impl Iterator<Item = (usize, &'a CatalogEntry)> + 'a {
        self.by_name
            .get(name_norm)
            .into_iter()
            .flatten()
            .map(move |idx| (*idx, &self.entries[*idx]))
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        now - self.loaded_at >= ttl
    }
}

/// Where catalog rows come from. Format and transport are the source's concern.
pub trait CatalogSource: Send + Sync {
    fn describe(&self) -> String;
    fn load(&self) -> anyhow::Result<Vec<CanonicalPlayerRecord>>;
}

pub struct StaticSource {
    records: Vec<CanonicalPlayerRecord>,
}

impl StaticSource {
    pub fn new(records: Vec<CanonicalPlayerRecord>) -> Self {
        Self { records }
    }
}

impl CatalogSource for StaticSource {
    fn describe(&self) -> String {
        format!("static ({} rows)", self.records.len())
    }

    fn load(&self) -> anyhow::Result<Vec<CanonicalPlayerRecord>> {
        Ok(self.records.clone())
    }
}

/// JSON array of objects, one per player, with upstream column names.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CatalogSource for JsonFileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> anyhow::Result<Vec<CanonicalPlayerRecord>> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read catalog {}", self.path.display()))?;
        let parsed = parse_catalog_json(&raw)
            .with_context(|| format!("parse catalog {}", self.path.display()))?;
        if parsed.skipped > 0 {
            warn!(
                path = %self.path.display(),
                skipped = parsed.skipped,
                "catalog rows without a player name were skipped"
            );
        }
        Ok(parsed.records)
    }
}

#[derive(Debug, Clone)]
pub struct ParsedCatalog {
    pub records: Vec<CanonicalPlayerRecord>,
    pub skipped: usize,
}

pub fn parse_catalog_json(raw: &str) -> anyhow::Result<ParsedCatalog> {
    let value = serde_json::from_str::<Value>(raw.trim()).context("invalid catalog json")?;
    let rows = match value {
        Value::Null => return Ok(ParsedCatalog { records: Vec::new(), skipped: 0 }),
        Value::Array(rows) => rows,
        _ => return Err(anyhow!("catalog json must be an array of objects")),
    };

    let objects: Vec<&Map<String, Value>> = rows.iter().filter_map(|v| v.as_object()).collect();
    let columns = ColumnMap::from_rows(&objects);
    let mut records = Vec::with_capacity(objects.len());
    let mut skipped = rows.len() - objects.len();
    for row in objects {
        match columns.map_row(row) {
            Some(record) => records.push(record),
            None => skipped += 1,
        }
    }
    Ok(ParsedCatalog { records, skipped })
}

/// Upstream header spelling for each field, resolved once per load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnMap {
    pub name: Option<String>,
    pub team: Option<String>,
    pub position: Option<String>,
    pub age: Option<String>,
    pub appearances: Option<String>,
    pub minutes: Option<String>,
    pub goals: Option<String>,
    pub assists: Option<String>,
    pub xg: Option<String>,
    pub xa: Option<String>,
    pub rating: Option<String>,
}

const NAME_ALIASES: &[&str] = &["name", "player", "player_name", "playername", "full_name"];
const TEAM_ALIASES: &[&str] = &["team", "squad", "club", "team_name"];
const POSITION_ALIASES: &[&str] = &["position", "pos"];
const AGE_ALIASES: &[&str] = &["age"];
const APPEARANCES_ALIASES: &[&str] = &["appearances", "mp", "apps", "matches_played"];
const MINUTES_ALIASES: &[&str] = &["minutes", "min", "mins"];
const GOALS_ALIASES: &[&str] = &["goals", "gls"];
const ASSISTS_ALIASES: &[&str] = &["assists", "ast"];
const XG_ALIASES: &[&str] = &["xg", "expected_goals"];
const XA_ALIASES: &[&str] = &["xa", "xag", "expected_assists"];
const RATING_ALIASES: &[&str] = &["rating", "avg_rating"];

impl ColumnMap {
    pub fn from_rows(rows: &[&Map<String, Value>]) -> Self {
        let mut keys: Vec<&str> = Vec::new();
        for row in rows {
            for key in row.keys() {
                if !keys.contains(&key.as_str()) {
                    keys.push(key.as_str());
                }
            }
        }
        Self::from_keys(&keys)
    }

    pub fn from_keys(keys: &[&str]) -> Self {
        let pick = |aliases: &[&str]| {
            aliases.iter().find_map(|alias| {
                keys.iter()
                    .find(|k| k.trim().eq_ignore_ascii_case(alias))
                    .map(|k| k.to_string())
            })
        };
        Self {
            name: pick(NAME_ALIASES),
            team: pick(TEAM_ALIASES),
            position: pick(POSITION_ALIASES),
            age: pick(AGE_ALIASES),
            appearances: pick(APPEARANCES_ALIASES),
            minutes: pick(MINUTES_ALIASES),
            goals: pick(GOALS_ALIASES),
            assists: pick(ASSISTS_ALIASES),
            xg: pick(XG_ALIASES),
            xa: pick(XA_ALIASES),
            rating: pick(RATING_ALIASES),
        }
    }

    pub fn map_row(&self, row: &Map<String, Value>) -> Option<CanonicalPlayerRecord> {
        let field = |col: &Option<String>| col.as_deref().and_then(|c| row.get(c));
        let name = field(&self.name).and_then(as_text)?;
        if name.trim().is_empty() {
            return None;
        }
        Some(CanonicalPlayerRecord {
            name,
            team: field(&self.team).and_then(as_text).unwrap_or_default(),
            position: field(&self.position).and_then(as_text),
            age: field(&self.age).and_then(as_leading_u32),
            attributes: PerformanceAttributes {
                appearances: field(&self.appearances).and_then(as_leading_u32),
                minutes: field(&self.minutes).and_then(as_leading_u32),
                goals: field(&self.goals).and_then(as_leading_u32),
                assists: field(&self.assists).and_then(as_leading_u32),
                xg: field(&self.xg).and_then(as_f64_any),
                xa: field(&self.xa).and_then(as_f64_any),
                rating: field(&self.rating).and_then(as_f64_any),
            },
        })
    }
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_f64_any(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    v.as_str()?.trim().replace(',', "").parse::<f64>().ok()
}

// Accepts plain numbers, "1,234" and FBref-style ages such as "25-123".
fn as_leading_u32(v: &Value) -> Option<u32> {
    if let Some(n) = v.as_u64() {
        return u32::try_from(n).ok();
    }
    if let Some(n) = v.as_f64() {
        return (n >= 0.0 && n <= u32::MAX as f64).then_some(n as u32);
    }
    let raw = v.as_str()?.trim().replace(',', "");
    let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u32>().ok()
}

/// Holder for the current snapshot. Readers clone the `Arc` and keep using it
/// even if a refresh swaps in a new one mid-query.
pub struct CatalogHandle {
    current: RwLock<Arc<CatalogSnapshot>>,
    source: Option<Arc<dyn CatalogSource>>,
    ttl: Duration,
    refreshing: Mutex<()>,
    // Set by the first successful load, even when the source had no rows.
    loaded: AtomicBool,
}

impl CatalogHandle {
    pub fn from_records(records: Vec<CanonicalPlayerRecord>) -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot::new(records))),
            source: None,
            ttl: Duration::MAX,
            refreshing: Mutex::new(()),
            loaded: AtomicBool::new(true),
        }
    }

    /// Handle with no data yet; the first `snapshot()` call loads from `source`.
    pub fn lazy(source: Arc<dyn CatalogSource>, ttl: Duration) -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot::empty())),
            source: Some(source),
            ttl,
            refreshing: Mutex::new(()),
            loaded: AtomicBool::new(false),
        }
    }

    pub fn load(source: Arc<dyn CatalogSource>, ttl: Duration) -> Result<Self> {
        let handle = Self::lazy(source, ttl);
        handle.refresh()?;
        Ok(handle)
    }

    /// Current snapshot without triggering a reload.
    pub fn current(&self) -> Arc<CatalogSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current snapshot, reloading first if it has outlived its validity window
    /// or was never loaded. A failed reload keeps serving the old snapshot.
    /// A source that loaded zero rows is not asked again until the window ends.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        let snapshot = self.current();
        if self.source.is_none() {
            return snapshot;
        }
        if self.loaded.load(Ordering::Acquire) && !snapshot.is_stale(self.ttl, Utc::now()) {
            return snapshot;
        }
        // Only one caller reloads; everyone else keeps the snapshot they have.
        let Ok(_guard) = self.refreshing.try_lock() else {
            return snapshot;
        };
        if let Err(err) = self.refresh() {
            warn!(error = %err, "catalog refresh failed; keeping previous snapshot");
            return snapshot;
        }
        self.current()
    }

    /// Snapshot for a query, or `DataSourceUnavailable` when there is nothing to match against.
    pub fn require_snapshot(&self) -> Result<Arc<CatalogSnapshot>> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            let origin = self
                .source
                .as_ref()
                .map(|s| s.describe())
                .unwrap_or_else(|| "in-memory".to_string());
            return Err(Error::DataSourceUnavailable(format!("no catalog rows from {origin}")));
        }
        Ok(snapshot)
    }

    /// Reload from the source and swap the snapshot. Returns the new row count.
    pub fn refresh(&self) -> Result<usize> {
        let Some(source) = self.source.as_ref() else {
            return Ok(self.current().len());
        };
        let records = source
            .load()
            .map_err(|err| Error::Catalog(format!("{}: {err:#}", source.describe())))?;
        let rows = records.len();
        self.replace(records);
        info!(source = %source.describe(), rows, "catalog snapshot loaded");
        Ok(rows)
    }

    /// Swap in a new snapshot built from `records`.
    pub fn replace(&self, records: Vec<CanonicalPlayerRecord>) {
        let next = Arc::new(CatalogSnapshot::new(records));
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        self.loaded.store(true, Ordering::Release);
    }
}
