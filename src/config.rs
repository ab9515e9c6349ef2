use std::path::PathBuf;
use std::time::Duration;

use crate::matching::MatchConfig;
use crate::observations::DEFAULT_CLAIM_LEASE;
use crate::reconcile::DEFAULT_CONFLICT_RETRIES;
use crate::reprocess::DEFAULT_PARALLELISM;

const DEFAULT_CATALOG_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub matching: MatchConfig,
    pub catalog_ttl: Duration,
    pub reprocess_parallelism: usize,
    pub conflict_retries: u32,
    pub claim_lease: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            catalog_path: None,
            matching: MatchConfig::default(),
            catalog_ttl: Duration::from_secs(DEFAULT_CATALOG_TTL_SECS),
            reprocess_parallelism: DEFAULT_PARALLELISM,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }
}

impl Config {
    /// Read `.env.local`, then `.env`, then the process environment.
    pub fn from_env() -> Self {
        load_dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Malformed values fall back to the default; numbers are clamped to
    /// usable ranges.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str| text(key).and_then(|v| v.parse::<f64>().ok()).filter(|v| v.is_finite());
        let count = |key: &str| text(key).and_then(|v| v.parse::<u64>().ok());

        let m = defaults.matching;
        Self {
            db_path: text("SCOUT_DB_PATH").map(PathBuf::from),
            catalog_path: text("SCOUT_CATALOG_PATH").map(PathBuf::from),
            matching: MatchConfig {
                min_confidence: number("SCOUT_MIN_CONFIDENCE")
                    .unwrap_or(m.min_confidence)
                    .clamp(0.0, 100.0),
                team_bonus: number("SCOUT_TEAM_BONUS")
                    .unwrap_or(m.team_bonus)
                    .clamp(0.0, 100.0),
                partial_cap: number("SCOUT_PARTIAL_CAP")
                    .unwrap_or(m.partial_cap)
                    .clamp(0.0, 100.0),
                partial_min_token_len: count("SCOUT_PARTIAL_MIN_TOKEN_LEN")
                    .map(|v| v.clamp(1, 32) as usize)
                    .unwrap_or(m.partial_min_token_len),
                suggestion_limit: count("SCOUT_SUGGESTION_LIMIT")
                    .map(|v| v.min(50) as usize)
                    .unwrap_or(m.suggestion_limit),
            },
            catalog_ttl: count("SCOUT_CATALOG_TTL_SECS")
                .map(|v| Duration::from_secs(v.max(1)))
                .unwrap_or(defaults.catalog_ttl),
            reprocess_parallelism: count("SCOUT_REPROCESS_PARALLELISM")
                .map(|v| v.clamp(1, 32) as usize)
                .unwrap_or(defaults.reprocess_parallelism),
            conflict_retries: count("SCOUT_CONFLICT_RETRIES")
                .map(|v| v.min(100) as u32)
                .unwrap_or(defaults.conflict_retries),
            claim_lease: count("SCOUT_CLAIM_LEASE_SECS")
                .map(|v| Duration::from_secs(v.max(1)))
                .unwrap_or(defaults.claim_lease),
        }
    }

    pub fn resolved_db_path(&self) -> Option<PathBuf> {
        self.db_path.clone().or_else(crate::db::default_db_path)
    }
}

pub fn load_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
}

/// Structured logs on stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_map(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(from_map(&[]), Config::default());
        let d = Config::default();
        assert_eq!(d.matching.min_confidence, 70.0);
        assert_eq!(d.matching.team_bonus, 10.0);
        assert_eq!(d.matching.partial_cap, 80.0);
        assert_eq!(d.catalog_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn values_are_parsed_and_clamped() {
        let cfg = from_map(&[
            ("SCOUT_MIN_CONFIDENCE", "85"),
            ("SCOUT_TEAM_BONUS", "500"),
            ("SCOUT_REPROCESS_PARALLELISM", "0"),
            ("SCOUT_CATALOG_PATH", " players.json "),
            ("SCOUT_SUGGESTION_LIMIT", "three"),
            ("SCOUT_CLAIM_LEASE_SECS", "0"),
        ]);
        assert_eq!(cfg.matching.min_confidence, 85.0);
        assert_eq!(cfg.matching.team_bonus, 100.0);
        assert_eq!(cfg.reprocess_parallelism, 1);
        assert_eq!(cfg.catalog_path, Some(PathBuf::from("players.json")));
        assert_eq!(cfg.matching.suggestion_limit, 5);
        assert_eq!(cfg.claim_lease, Duration::from_secs(1));
    }
}
