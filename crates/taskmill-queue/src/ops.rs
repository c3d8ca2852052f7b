//! Operational helpers
//!
//! Thin queries behind status and maintenance surfaces: pending counts,
//! per-state totals, fleet listing, and clearing the pending queue.

use taskmill_storage::{FleetView, StoreError, TaskStateCounts, TaskStore, WorkerRecord};

/// Global queue status: pending work plus the alive fleet.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub pending_tasks: i64,
    pub fleet: FleetView,
}

/// Detailed statistics: per-state task totals plus the alive fleet.
#[derive(Debug, Clone)]
pub struct QueueStatistics {
    pub tasks: TaskStateCounts,
    pub fleet: FleetView,
}

pub async fn queue_status(store: &dyn TaskStore) -> Result<QueueStatus, StoreError> {
    Ok(QueueStatus {
        pending_tasks: store.pending_count().await?,
        fleet: store.fleet_view().await?,
    })
}

pub async fn queue_statistics(store: &dyn TaskStore) -> Result<QueueStatistics, StoreError> {
    Ok(QueueStatistics {
        tasks: store.counts_by_state().await?,
        fleet: store.fleet_view().await?,
    })
}

/// Delete all pending tasks; returns how many were removed.
pub async fn clear_pending(store: &dyn TaskStore) -> Result<u64, StoreError> {
    store.clear_pending().await
}

/// Every registered server, running or not.
pub async fn list_servers(store: &dyn TaskStore) -> Result<Vec<WorkerRecord>, StoreError> {
    store.list_servers().await
}
