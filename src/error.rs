use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catalog snapshot missing or empty at query time.
    #[error("catalog unavailable: {0}")]
    DataSourceUnavailable(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    /// Concurrent writers kept colliding on the same identity key.
    #[error("reconciliation conflict on {key} after {attempts} attempts")]
    ReconciliationConflict { key: String, attempts: u32 },

    #[error("matching failed: {0}")]
    Matching(String),

    #[error("invalid rating {0}")]
    InvalidRating(f64),

    #[error("observation has not been persisted")]
    NotPersisted,

    /// The observation is no longer claimed by this worker; its linkage was not written.
    #[error("observation {0} is not claimed by this worker")]
    ClaimLost(i64),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
