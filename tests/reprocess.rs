use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};

use scout_link::audit::MemorySink;
use scout_link::catalog::{CatalogHandle, parse_catalog_json};
use scout_link::db;
use scout_link::intake::ObservationIntake;
use scout_link::matching::{MatchConfig, MatchingCascade, Resolution, Resolver};
use scout_link::observations::{LinkageState, ObservationStore, ScoutingObservation};
use scout_link::reconcile::ReconciliationStore;
use scout_link::reprocess::ReprocessingJob;
use scout_link::{Error, Result};

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

fn fixture_cascade() -> MatchingCascade {
    let records = parse_catalog_json(&read_fixture("catalog.json"))
        .expect("fixture should parse")
        .records;
    MatchingCascade::new(
        Arc::new(CatalogHandle::from_records(records)),
        Arc::new(MemorySink::new()),
        MatchConfig::default(),
    )
}

/// Wraps the real cascade; fails every call while `down` is set and always
/// fails for names in `broken`.
struct FlakyResolver {
    inner: MatchingCascade,
    down: AtomicBool,
    broken: Vec<&'static str>,
    panic_instead: bool,
}

impl FlakyResolver {
    fn new(down: bool) -> Self {
        Self {
            inner: fixture_cascade(),
            down: AtomicBool::new(down),
            broken: Vec::new(),
            panic_instead: false,
        }
    }
}

impl Resolver for FlakyResolver {
    fn resolve(&self, name: &str, team: Option<&str>, min_confidence: f64) -> Result<Resolution> {
        if self.down.load(Ordering::SeqCst) || self.broken.iter().any(|b| *b == name) {
            if self.panic_instead {
                panic!("resolver exploded on {name}");
            }
            return Err(Error::Matching(format!("lookup backend down for {name}")));
        }
        Ok(self.inner.resolve(name, team, min_confidence))
    }
}

fn intake_with(resolver: Arc<FlakyResolver>) -> Arc<ObservationIntake> {
    let conn = db::shared(db::open_in_memory().expect("db should open"));
    Arc::new(ObservationIntake::new(
        ObservationStore::new(conn.clone()),
        Arc::new(ReconciliationStore::new(conn)),
        resolver,
        70.0,
    ))
}

#[test]
fn errored_observations_are_linked_on_reprocess() {
    let resolver = Arc::new(FlakyResolver::new(true));
    let intake = intake_with(resolver.clone());

    let stored = intake
        .submit(ScoutingObservation::new("Erling Haaland", "Manchester City", 9.0))
        .expect("observation is saved even when matching fails");
    assert_eq!(stored.linkage.state, LinkageState::Error);
    assert_eq!(stored.linkage.confidence, Some(-1.0));
    assert!(stored.linkage.error.is_some());
    assert_eq!(intake.players().count().expect("count"), 0);

    resolver.down.store(false, Ordering::SeqCst);
    let job = ReprocessingJob::new(intake.clone(), 2);
    let summary = job.run().expect("run should succeed");
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(summary.errors.is_empty());

    let id = stored.id.expect("id");
    let reloaded = intake.observations().get(id).expect("read").expect("row");
    assert_eq!(reloaded.linkage.state, LinkageState::Resolved);
    assert_eq!(reloaded.linkage.confidence, Some(100.0));
    assert!(reloaded.linkage.error.is_none());
    assert_eq!(reloaded.rating, 9.0);
    assert_eq!(intake.players().count().expect("count"), 1);

    let again = job.run().expect("second run");
    assert_eq!(again.attempted, 0);
}

#[test]
fn panicking_resolver_leaves_observation_retryable() {
    let mut flaky = FlakyResolver::new(true);
    flaky.panic_instead = true;
    let resolver = Arc::new(flaky);
    let intake = intake_with(resolver.clone());

    let stored = intake
        .submit(ScoutingObservation::new("Bukayo Saka", "Arsenal", 7.5))
        .expect("panic is contained");
    assert_eq!(stored.linkage.state, LinkageState::Error);
    assert_eq!(intake.observations().list_pending().expect("pending").len(), 1);

    resolver.down.store(false, Ordering::SeqCst);
    let summary = ReprocessingJob::new(intake.clone(), 1).run().expect("run");
    assert_eq!(summary.succeeded, 1);
    assert!(intake.observations().list_pending().expect("pending").is_empty());
}

#[test]
fn one_failure_does_not_stop_the_sweep() {
    let mut flaky = FlakyResolver::new(true);
    flaky.broken = vec!["Lamine Yamal"];
    let resolver = Arc::new(flaky);
    let intake = intake_with(resolver.clone());

    for (name, team) in [
        ("Lamine Yamal", "Barcelona"),
        ("Jamal Musiala", "Bayern Munich"),
        ("Florian Wirtz", "Leverkusen"),
    ] {
        intake
            .submit(ScoutingObservation::new(name, team, 8.0))
            .expect("submit");
    }
    assert_eq!(intake.observations().list_pending().expect("pending").len(), 3);

    resolver.down.store(false, Ordering::SeqCst);
    let job = ReprocessingJob::new(intake.clone(), 4);
    let summary = job.run().expect("run");
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains("Lamine Yamal"));

    let pending = intake.observations().list_pending().expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].player_name, "Lamine Yamal");
    assert_eq!(pending[0].linkage.state, LinkageState::Error);
    assert_eq!(intake.players().count().expect("count"), 2);
}

#[test]
fn resolved_observations_are_left_alone() {
    let resolver = Arc::new(FlakyResolver::new(false));
    let intake = intake_with(resolver);
    intake
        .submit(ScoutingObservation::new("Mohamed Salah", "Liverpool", 8.0))
        .expect("submit");
    intake
        .submit(ScoutingObservation::new("Unknown Trialist", "Academy", 5.0))
        .expect("submit");

    let summary = ReprocessingJob::new(intake.clone(), 2).run().expect("run");
    assert_eq!(summary.attempted, 0);

    let salah = intake
        .players()
        .get_by_key("Mohamed Salah", "Liverpool")
        .expect("read")
        .expect("record");
    assert_eq!(salah.sightings, 1);
}

/// Asks the running job to stop from inside the first item it processes.
struct StoppingResolver {
    inner: MatchingCascade,
    job: OnceLock<Arc<ReprocessingJob>>,
}

impl Resolver for StoppingResolver {
    fn resolve(&self, name: &str, team: Option<&str>, min_confidence: f64) -> Result<Resolution> {
        if let Some(job) = self.job.get() {
            job.stop();
        }
        Ok(self.inner.resolve(name, team, min_confidence))
    }
}

#[test]
fn stop_leaves_unstarted_items_pending() {
    let conn = db::shared(db::open_in_memory().expect("db should open"));
    let observations = ObservationStore::new(conn.clone());
    for name in ["Pedri", "Rodri", "Bukayo Saka"] {
        observations
            .insert(&ScoutingObservation::new(name, "", 7.0))
            .expect("insert");
    }

    let resolver = Arc::new(StoppingResolver {
        inner: fixture_cascade(),
        job: OnceLock::new(),
    });
    let intake = Arc::new(ObservationIntake::new(
        observations,
        Arc::new(ReconciliationStore::new(conn)),
        resolver.clone(),
        70.0,
    ));
    let job = Arc::new(ReprocessingJob::new(intake.clone(), 1));
    assert!(resolver.job.set(job.clone()).is_ok());

    let summary = job.run().expect("run");
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(intake.observations().list_pending().expect("pending").len(), 2);

    // A fresh run clears the stop request and picks up where the last one ended.
    let summary = job.run().expect("second run");
    assert_eq!(summary.attempted, 1);
}

/// Runs a side effect the first time it resolves, in the middle of a submit.
struct MidSubmitResolver {
    inner: MatchingCascade,
    during_resolve: Box<dyn Fn() + Send + Sync>,
    fired: AtomicBool,
}

impl Resolver for MidSubmitResolver {
    fn resolve(&self, name: &str, team: Option<&str>, min_confidence: f64) -> Result<Resolution> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            (self.during_resolve)();
        }
        Ok(self.inner.resolve(name, team, min_confidence))
    }
}

#[test]
fn sweep_during_submit_does_not_count_the_sighting_twice() {
    let conn = db::shared(db::open_in_memory().expect("db should open"));
    let job_slot: Arc<OnceLock<Arc<ReprocessingJob>>> = Arc::new(OnceLock::new());
    let nested_attempts = Arc::new(OnceLock::new());

    let slot = job_slot.clone();
    let attempts = nested_attempts.clone();
    let resolver = Arc::new(MidSubmitResolver {
        inner: fixture_cascade(),
        during_resolve: Box::new(move || {
            if let Some(job) = slot.get() {
                let summary = job.run().expect("nested run");
                let _ = attempts.set(summary.attempted);
            }
        }),
        fired: AtomicBool::new(false),
    });
    let intake = Arc::new(ObservationIntake::new(
        ObservationStore::new(conn.clone()),
        Arc::new(ReconciliationStore::new(conn)),
        resolver,
        70.0,
    ));
    let job = Arc::new(ReprocessingJob::new(intake.clone(), 2));
    assert!(job_slot.set(job.clone()).is_ok());

    let stored = intake
        .submit(ScoutingObservation::new("Pedri", "Barcelona", 8.0))
        .expect("submit");
    assert_eq!(nested_attempts.get(), Some(&0));
    assert_eq!(stored.linkage.state, LinkageState::Resolved);

    let pedri = intake
        .players()
        .get_by_key("Pedri", "Barcelona")
        .expect("read")
        .expect("record");
    assert_eq!(pedri.sightings, 1);
    assert_eq!(job.run().expect("follow-up run").attempted, 0);
}

#[test]
fn lost_claim_rolls_back_the_registry_write() {
    let conn = db::shared(db::open_in_memory().expect("db should open"));
    let side_conn = conn.clone();
    // Another worker takes the row over while matching is still running.
    let resolver = Arc::new(MidSubmitResolver {
        inner: fixture_cascade(),
        during_resolve: Box::new(move || {
            side_conn
                .lock()
                .expect("connection lock")
                .execute(
                    "UPDATE observations SET linkage_state = 'error', claimed_at = NULL",
                    [],
                )
                .expect("release claim");
        }),
        fired: AtomicBool::new(false),
    });
    let intake = Arc::new(ObservationIntake::new(
        ObservationStore::new(conn.clone()),
        Arc::new(ReconciliationStore::new(conn)),
        resolver,
        70.0,
    ));

    let stored = intake
        .submit(ScoutingObservation::new("Bukayo Saka", "Arsenal", 7.5))
        .expect("observation is saved");
    assert_eq!(stored.linkage.state, LinkageState::Error);
    assert_eq!(intake.players().count().expect("count"), 0);

    let summary = ReprocessingJob::new(intake.clone(), 1).run().expect("run");
    assert_eq!(summary.succeeded, 1);
    assert_eq!(intake.players().count().expect("count"), 1);
    let saka = intake
        .players()
        .get_by_key("Bukayo Saka", "Arsenal")
        .expect("read")
        .expect("record");
    assert_eq!(saka.sightings, 1);
}

#[test]
fn stop_before_run_holds_for_the_next_run() {
    let resolver = Arc::new(FlakyResolver::new(true));
    let intake = intake_with(resolver.clone());
    intake
        .submit(ScoutingObservation::new("Jamal Musiala", "Bayern Munich", 8.5))
        .expect("submit");
    resolver.down.store(false, Ordering::SeqCst);

    let job = ReprocessingJob::new(intake.clone(), 2);
    job.stop();
    let stopped = job.run().expect("stopped run");
    assert_eq!(stopped.attempted, 0);
    assert_eq!(intake.observations().list_pending().expect("pending").len(), 1);

    let resumed = job.run().expect("next run");
    assert_eq!(resumed.attempted, 1);
    assert_eq!(resumed.succeeded, 1);
    assert!(intake.observations().list_pending().expect("pending").is_empty());
}
