use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use scout_link::audit::{DiagnosticsSink, FanoutSink, SqliteAuditSink, TracingSink};
use scout_link::catalog::{CatalogHandle, JsonFileSource};
use scout_link::config::{self, Config};
use scout_link::db;
use scout_link::intake::ObservationIntake;
use scout_link::matching::MatchingCascade;
use scout_link::observations::ObservationStore;
use scout_link::reconcile::ReconciliationStore;
use scout_link::reprocess::ReprocessingJob;

fn main() -> Result<()> {
    config::init_tracing();
    let cfg = Config::from_env();
    let args = std::env::args().skip(1).collect::<Vec<_>>();

    let db_path = parse_path_arg(&args, "--db")
        .or_else(|| cfg.resolved_db_path())
        .context("unable to resolve sqlite path")?;
    let catalog_path = parse_path_arg(&args, "--catalog")
        .or_else(|| cfg.catalog_path.clone())
        .context("no catalog given; pass --catalog=PATH or set SCOUT_CATALOG_PATH")?;
    let as_json = args.iter().any(|a| a == "--json");

    let conn = db::shared(
        db::open_db(&db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?,
    );
    let catalog = CatalogHandle::load(Arc::new(JsonFileSource::new(&catalog_path)), cfg.catalog_ttl)
        .context("load catalog")?;

    let sinks = vec![
        Arc::new(TracingSink) as Arc<dyn DiagnosticsSink>,
        Arc::new(SqliteAuditSink::new(conn.clone())),
    ];
    let cascade = MatchingCascade::new(Arc::new(catalog), Arc::new(FanoutSink::new(sinks)), cfg.matching);
    let players = ReconciliationStore::new(conn.clone()).with_conflict_retries(cfg.conflict_retries);
    let intake = ObservationIntake::new(
        ObservationStore::new(conn).with_claim_lease(cfg.claim_lease),
        Arc::new(players),
        Arc::new(cascade),
        cfg.matching.min_confidence,
    );

    let summary = ReprocessingJob::new(Arc::new(intake), cfg.reprocess_parallelism).run()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("Reprocessing complete");
    println!("DB: {}", db_path.display());
    println!("Linked: {}/{}", summary.succeeded, summary.attempted);
    if summary.skipped > 0 {
        println!("Skipped (claimed elsewhere): {}", summary.skipped);
    }
    if !summary.errors.is_empty() {
        println!("Errors: {}", summary.errors.len());
        for err in summary.errors.iter().take(8) {
            println!(" - {err}");
        }
    }
    Ok(())
}

fn parse_path_arg(args: &[String], flag: &str) -> Option<PathBuf> {
    let prefix = format!("{flag}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix(&prefix) {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if arg == flag {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(PathBuf::from(next));
            }
        }
    }
    None
}
