//! Statistics from the harvest database
//!
//! This module provides functionality for extracting and displaying task and
//! credential statistics from the storage layer.

use crate::credential::{CredentialPool, PoolStatus};
use crate::state::TaskStatus;
use crate::storage::Storage;
use crate::{lock, HarvestError, SharedStorage};
use std::collections::HashMap;

/// Harvest statistics summary
#[derive(Debug, Clone)]
pub struct HarvestStatistics {
    /// Total number of tasks ever created
    pub total_tasks: u64,

    /// Count of tasks by status
    pub tasks_by_status: HashMap<TaskStatus, u64>,

    /// Checkpoint keys recorded as completed, across all tasks
    pub completed_keys: u64,

    /// Checkpoint keys recorded as failed, across all tasks
    pub failed_keys: u64,

    /// Credential pool summary
    pub pool: PoolStatus,
}

/// Loads statistics from storage and the credential pool
///
/// # Arguments
///
/// * `storage` - The shared store to query
/// * `pool` - The credential pool to summarize
///
/// # Returns
///
/// * `Ok(HarvestStatistics)` - Successfully loaded statistics
/// * `Err(HarvestError)` - Failed to query statistics
pub fn load_statistics(
    storage: &SharedStorage,
    pool: &CredentialPool,
) -> Result<HarvestStatistics, HarvestError> {
    let (tasks_by_status, (completed_keys, failed_keys)) = {
        let storage = lock(storage);
        (
            storage.count_tasks_by_status()?,
            storage.count_checkpoint_items()?,
        )
    };
    let total_tasks = tasks_by_status.values().sum();

    Ok(HarvestStatistics {
        total_tasks,
        tasks_by_status,
        completed_keys,
        failed_keys,
        pool: pool.status()?,
    })
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &HarvestStatistics) {
    println!("=== Harvest Statistics ===\n");

    println!("Tasks ({} total):", stats.total_tasks);
    for status in TaskStatus::all_states() {
        let count = stats.tasks_by_status.get(&status).copied().unwrap_or(0);
        let percentage = if stats.total_tasks > 0 {
            (count as f64 / stats.total_tasks as f64) * 100.0
        } else {
            0.0
        };
        println!("  {}: {} ({:.1}%)", status, count, percentage);
    }
    println!();

    println!("Work items:");
    println!("  Completed keys: {}", stats.completed_keys);
    println!("  Failed keys: {}", stats.failed_keys);
    println!();

    println!("Credentials:");
    println!("  Total: {}", stats.pool.total);
    println!("  Available: {}", stats.pool.available);
    println!("  Temporarily banned: {}", stats.pool.temp_banned);
    println!("  Permanently banned: {}", stats.pool.perm_banned);
    println!("  Expired: {}", stats.pool.expired);

    if stats.pool.total > 0 && stats.pool.available == 0 {
        println!();
        println!("Warning: no credential is currently available; running tasks will pause");
    }
}
