use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use scout_link::audit::TracingSink;
use scout_link::catalog::{CatalogHandle, JsonFileSource};
use scout_link::config::{self, Config};
use scout_link::matching::{MatchingCascade, Resolution};

fn main() -> Result<()> {
    config::init_tracing();
    let cfg = Config::from_env();

    let mut catalog_path = cfg.catalog_path.clone();
    let mut team: Option<String> = None;
    let mut min_confidence = cfg.matching.min_confidence;
    let mut name_parts = Vec::new();
    for arg in std::env::args().skip(1) {
        if let Some(path) = arg.strip_prefix("--catalog=") {
            catalog_path = Some(PathBuf::from(path.trim()));
        } else if let Some(t) = arg.strip_prefix("--team=") {
            team = Some(t.trim().to_string()).filter(|t| !t.is_empty());
        } else if let Some(raw) = arg.strip_prefix("--min=") {
            min_confidence = raw
                .trim()
                .parse::<f64>()
                .with_context(|| format!("invalid --min value {raw:?}"))?
                .clamp(0.0, 100.0);
        } else {
            name_parts.push(arg);
        }
    }
    let name = name_parts.join(" ");
    if name.trim().is_empty() {
        return Err(anyhow!(
            "usage: scout_resolve [--catalog=PATH] [--team=TEAM] [--min=N] NAME..."
        ));
    }
    let catalog_path =
        catalog_path.context("no catalog given; pass --catalog=PATH or set SCOUT_CATALOG_PATH")?;

    let catalog = CatalogHandle::load(Arc::new(JsonFileSource::new(&catalog_path)), cfg.catalog_ttl)
        .context("load catalog")?;
    let cascade = MatchingCascade::new(Arc::new(catalog), Arc::new(TracingSink), cfg.matching);

    match cascade.resolve(&name, team.as_deref(), min_confidence) {
        Resolution::Found(outcome) => {
            println!(
                "{:<8} {:>5.1}  {} ({})",
                outcome.strategy.as_str(),
                outcome.confidence,
                outcome.candidate.name,
                outcome.candidate.team
            );
        }
        Resolution::NotFound => {
            println!("No catalog match for {name:?}");
            let suggestions = cascade.suggest(&name, cascade.config().suggestion_limit);
            if !suggestions.is_empty() {
                println!("Did you mean:");
                for s in suggestions {
                    println!(" - {} ({}) {:.1}", s.name, s.team, s.score);
                }
            }
        }
    }
    Ok(())
}
