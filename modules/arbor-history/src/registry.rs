//! Known partitions and their lightweight metadata.
//!
//! Updated synchronously as copies are written; lookups never touch the log.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use arbor_events::{HistoryError, PartitionId, PartitionSummary, Result, StoredEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionInfo {
    pub partition_id: PartitionId,
    pub event_count: u64,
    pub last_sequence: i64,
    pub first_event_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
}

impl From<PartitionSummary> for PartitionInfo {
    fn from(summary: PartitionSummary) -> Self {
        Self {
            partition_id: summary.partition_id,
            event_count: summary.event_count,
            last_sequence: summary.max_sequence,
            first_event_at: summary.first_event_at,
            last_event_at: summary.last_event_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct PartitionRegistry {
    partitions: RwLock<BTreeMap<PartitionId, PartitionInfo>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<PartitionId, PartitionInfo>> {
        self.partitions.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<PartitionId, PartitionInfo>> {
        self.partitions.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace the contents with what the storage reports.
    pub fn seed(&self, summaries: Vec<PartitionSummary>) {
        let mut partitions = self.write();
        partitions.clear();
        for summary in summaries {
            partitions.insert(summary.partition_id.clone(), summary.into());
        }
    }

    /// Account for one written copy.
    pub fn record(&self, event: &StoredEvent) {
        let mut partitions = self.write();
        partitions
            .entry(event.partition_id.clone())
            .and_modify(|info| {
                info.event_count += 1;
                info.last_sequence = info.last_sequence.max(event.sequence_in_partition);
                info.first_event_at = info.first_event_at.min(event.recorded_at);
                info.last_event_at = info.last_event_at.max(event.recorded_at);
            })
            .or_insert_with(|| PartitionInfo {
                partition_id: event.partition_id.clone(),
                event_count: 1,
                last_sequence: event.sequence_in_partition,
                first_event_at: event.recorded_at,
                last_event_at: event.recorded_at,
            });
    }

    pub fn list_partitions(&self) -> Vec<PartitionId> {
        self.read().keys().cloned().collect()
    }

    pub fn partition_info(&self, partition: &PartitionId) -> Result<PartitionInfo> {
        self.read()
            .get(partition)
            .cloned()
            .ok_or_else(|| HistoryError::NotFound(format!("partition {partition}")))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn reset(&self) {
        self.write().clear();
    }
}
