//! Output module for harvested data and statistics
//!
//! This module handles:
//! - Writing per-task CSV files (data rows and summary statistics)
//! - Rolling files back to the lengths recorded in a checkpoint
//! - Printing database-wide task and credential statistics

mod csv;
pub mod stats;

pub use csv::{data_path, escape_field, stats_path, CommittedLengths, OutputSink};
pub use stats::{load_statistics, print_statistics, HarvestStatistics};

use thiserror::Error;

/// Errors raised while writing task output
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Failed to write output file: {0}")]
    Io(#[from] std::io::Error),
}
