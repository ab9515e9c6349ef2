use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::intake::ObservationIntake;

pub const DEFAULT_PARALLELISM: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReprocessSummary {
    pub attempted: usize,
    pub succeeded: usize,
    // Linked or claimed by someone else between listing and claiming.
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Re-links every observation left `unresolved` or `error`, plus any whose
/// claim expired without an outcome.
///
/// Items are independent: one failure is counted and the sweep moves on.
/// Each item is claimed before linking, so one that is linked or being linked
/// elsewhere by then is skipped rather than counted twice.
pub struct ReprocessingJob {
    intake: Arc<ObservationIntake>,
    parallelism: usize,
    stop: AtomicBool,
}

impl ReprocessingJob {
    pub fn new(intake: Arc<ObservationIntake>, parallelism: usize) -> Self {
        Self {
            intake,
            parallelism: parallelism.clamp(1, 32),
            stop: AtomicBool::new(false),
        }
    }

    /// Stop scheduling new items. Items already running finish normally.
    ///
    /// The request holds until the end of the next `run`, so a stop issued
    /// between runs makes the next run return without linking anything.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn run(&self) -> Result<ReprocessSummary> {
        let summary = self.sweep();
        self.stop.store(false, Ordering::SeqCst);
        summary
    }

    fn sweep(&self) -> Result<ReprocessSummary> {
        let pending = self.intake.observations().list_pending()?;
        if pending.is_empty() {
            return Ok(ReprocessSummary::default());
        }

        type ItemResult = std::result::Result<bool, String>;
        let results: Vec<Option<ItemResult>> = with_pool(self.parallelism, || {
            pending
                .par_iter()
                .map(|obs| {
                    if self.stop.load(Ordering::SeqCst) {
                        return None;
                    }
                    let result = self
                        .intake
                        .process(obs)
                        .map(|linkage| linkage.is_some())
                        .map_err(|err| format!("observation {}: {err}", obs.id.unwrap_or_default()));
                    Some(result)
                })
                .collect()
        });

        let mut summary = ReprocessSummary::default();
        for result in results.into_iter().flatten() {
            match result {
                Ok(false) => summary.skipped += 1,
                Ok(true) => {
                    summary.attempted += 1;
                    summary.succeeded += 1;
                }
                Err(err) => {
                    summary.attempted += 1;
                    summary.errors.push(err);
                }
            }
        }

        if summary.errors.is_empty() {
            info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                skipped = summary.skipped,
                "reprocessing finished"
            );
        } else {
            warn!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                skipped = summary.skipped,
                failed = summary.errors.len(),
                "reprocessing finished with failures"
            );
        }
        Ok(summary)
    }
}

fn with_pool<T>(threads: usize, action: impl FnOnce() -> T + Send) -> T
where
    T: Send,
{
    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool.install(action),
        Err(_) => action(),
    }
}
