pub mod audit;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod intake;
pub mod matching;
pub mod normalize;
pub mod observations;
pub mod reconcile;
pub mod reprocess;
pub mod similarity;

pub use error::{Error, Result};
