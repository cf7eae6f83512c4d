//! In-memory storage. Thread-safe, no database required.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{HistoryError, Result};
use crate::partition::PartitionId;
use crate::storage::EventStorage;
use crate::types::{PartitionSummary, ReadOptions, StoredEvent};

#[derive(Debug, Default)]
struct MemoryInner {
    partitions: HashMap<PartitionId, BTreeMap<i64, StoredEvent>>,
    copies: HashMap<String, Vec<(PartitionId, i64)>>,
}

#[derive(Debug)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
    available: AtomicBool,
    writes_fail: AtomicBool,
    /// Partition whose next write fails.
    fail_next: Mutex<Option<PartitionId>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
            available: AtomicBool::new(true),
            writes_fail: AtomicBool::new(false),
            fail_next: Mutex::new(None),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryInner>> {
        self.check_available()?;
        Ok(self.inner.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, MemoryInner>> {
        self.check_available()?;
        Ok(self.inner.write().unwrap_or_else(|p| p.into_inner()))
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HistoryError::StorageUnavailable(
                "memory storage is offline".to_string(),
            ))
        }
    }

    fn take_write_failure(&self, partition: &PartitionId) -> bool {
        let mut armed = self.fail_next.lock().unwrap_or_else(|p| p.into_inner());
        if armed.as_ref() == Some(partition) {
            *armed = None;
            true
        } else {
            false
        }
    }

    /// Total physical copies held.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.partitions.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl MemoryStorage {
    /// Simulate an outage: every call fails with `StorageUnavailable` until
    /// switched back on.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail only `write`; reads keep working.
    pub fn set_writes_fail(&self, fail: bool) {
        self.writes_fail.store(fail, Ordering::SeqCst);
    }

    /// Fail the next write to `partition` only. Other partitions keep
    /// accepting writes.
    pub fn fail_next_write_to(&self, partition: PartitionId) {
        *self.fail_next.lock().unwrap_or_else(|p| p.into_inner()) = Some(partition);
    }
}

#[async_trait]
impl EventStorage for MemoryStorage {
    async fn write(&self, event: &StoredEvent) -> Result<bool> {
        if self.writes_fail.load(Ordering::SeqCst) || self.take_write_failure(&event.partition_id) {
            return Err(HistoryError::StorageUnavailable(
                "memory storage rejected the write".to_string(),
            ));
        }
        let mut inner = self.write_lock()?;

        let already_copied = inner
            .copies
            .get(&event.id)
            .is_some_and(|slots| slots.iter().any(|(p, _)| p == &event.partition_id));
        if already_copied {
            return Ok(false);
        }

        let partition = inner
            .partitions
            .entry(event.partition_id.clone())
            .or_default();

        if partition.contains_key(&event.sequence_in_partition) {
            let actual = partition.keys().next_back().map_or(0, |max| max + 1);
            return Err(HistoryError::ConcurrencyConflict {
                partition: event.partition_id.to_string(),
                expected: event.sequence_in_partition,
                actual,
            });
        }
        partition.insert(event.sequence_in_partition, event.clone());

        inner
            .copies
            .entry(event.id.clone())
            .or_default()
            .push((event.partition_id.clone(), event.sequence_in_partition));
        Ok(true)
    }

    async fn read_partition(
        &self,
        partition: &PartitionId,
        options: ReadOptions,
    ) -> Result<Vec<StoredEvent>> {
        let inner = self.read()?;
        let Some(events) = inner.partitions.get(partition) else {
            return Ok(Vec::new());
        };

        let lower = options.from_sequence.map_or(Bound::Unbounded, Bound::Included);
        let upper = options.to_sequence.map_or(Bound::Unbounded, Bound::Included);
        if let (Some(from), Some(to)) = (options.from_sequence, options.to_sequence) {
            if from > to {
                return Ok(Vec::new());
            }
        }

        Ok(events
            .range((lower, upper))
            .map(|(_, event)| event.clone())
            .take(options.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn read_global_range(&self, from: i64, to: Option<i64>) -> Result<Vec<StoredEvent>> {
        let inner = self.read()?;
        let Some(global) = inner.partitions.get(&PartitionId::global()) else {
            return Ok(Vec::new());
        };
        let mut events: Vec<StoredEvent> = global
            .values()
            .filter(|e| e.global_order >= from && to.map_or(true, |to| e.global_order <= to))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.global_order);
        Ok(events)
    }

    async fn copies_of(&self, event_id: &str) -> Result<Vec<StoredEvent>> {
        let inner = self.read()?;
        let Some(slots) = inner.copies.get(event_id) else {
            return Ok(Vec::new());
        };
        Ok(slots
            .iter()
            .filter_map(|(partition, seq)| inner.partitions.get(partition)?.get(seq).cloned())
            .collect())
    }

    async fn read_caused_by(&self, event_id: &str) -> Result<Vec<StoredEvent>> {
        let inner = self.read()?;
        let Some(global) = inner.partitions.get(&PartitionId::global()) else {
            return Ok(Vec::new());
        };
        let mut events: Vec<StoredEvent> = global
            .values()
            .filter(|e| e.causation_id.as_deref() == Some(event_id))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.global_order);
        Ok(events)
    }

    async fn partition_summaries(&self) -> Result<Vec<PartitionSummary>> {
        let inner = self.read()?;
        let mut summaries: Vec<PartitionSummary> = inner
            .partitions
            .iter()
            .filter_map(|(partition_id, events)| {
                let (&max_sequence, _) = events.iter().next_back()?;
                let first_event_at = events.values().map(|e| e.recorded_at).min()?;
                let last_event_at = events.values().map(|e| e.recorded_at).max()?;
                Some(PartitionSummary {
                    partition_id: partition_id.clone(),
                    event_count: events.len() as u64,
                    max_sequence,
                    first_event_at,
                    last_event_at,
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(summaries)
    }

    async fn max_global_order(&self) -> Result<i64> {
        let inner = self.read()?;
        Ok(inner
            .partitions
            .values()
            .flat_map(BTreeMap::values)
            .map(|e| e.global_order)
            .max()
            .unwrap_or(0))
    }

    fn decode_failures(&self) -> u64 {
        // Events are held already decoded.
        0
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.write_lock()?;
        inner.partitions.clear();
        inner.copies.clear();
        Ok(())
    }
}
