//! EventLog: append-only, per-partition ordered history with a global total
//! order.
//!
//! Every logical event is written to `global` plus each partition it routes
//! to. The sequencer claims all slots for one logical event in a single step;
//! the physical writes then run concurrently. Appends that share an event id
//! run one at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{HistoryError, Result};
use crate::partition::PartitionId;
use crate::sequencer::{Allocation, Held, Sequencer};
use crate::storage::EventStorage;
use crate::types::{AppendEvent, AppendOptions, ReadOptions, Slot, StoredEvent};
use crate::vocabulary::EventType;

/// Outcome of one logical append.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    /// Every physical copy, in partition order.
    pub copies: Vec<StoredEvent>,
    /// Copies that no earlier call reported: those written now plus those an
    /// earlier failed attempt managed to write. Empty for a plain replay.
    pub written: Vec<StoredEvent>,
}

/// Per-event-id locks, created on demand and dropped when nobody holds or
/// waits on them.
#[derive(Default)]
struct EventLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl EventLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn lock(&self, event_id: &str) -> EventGuard<'_> {
        let lock = self.map().entry(event_id.to_string()).or_default().clone();
        EventGuard {
            locks: self,
            event_id: event_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

struct EventGuard<'a> {
    locks: &'a EventLocks,
    event_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EventGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.locks.map();
        // One reference in the map, one in this guard: no waiters left.
        if map
            .get(&self.event_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            map.remove(&self.event_id);
        }
        self.guard.take();
    }
}

/// Append-only event log. The single mutation owner.
#[derive(Clone)]
pub struct EventLog {
    storage: Arc<dyn EventStorage>,
    sequencer: Arc<Sequencer>,
    in_flight: Arc<EventLocks>,
}

impl EventLog {
    /// Open a log over `storage`, resuming sequence numbers from what it
    /// already holds.
    pub async fn open(storage: Arc<dyn EventStorage>) -> Result<Self> {
        let summaries = storage.partition_summaries().await?;
        let max_global = storage.max_global_order().await?;
        debug!(
            partitions = summaries.len(),
            max_global_order = max_global,
            "Seeding sequencer"
        );
        Ok(Self {
            storage,
            sequencer: Arc::new(Sequencer::seeded(&summaries, max_global)),
            in_flight: Arc::new(EventLocks::default()),
        })
    }

    pub fn storage(&self) -> &Arc<dyn EventStorage> {
        &self.storage
    }

    /// Append to one partition (and `global`). Returns the copy written to
    /// `partition`.
    pub async fn append(
        &self,
        partition: &PartitionId,
        event_type: EventType,
        payload: Value,
        opts: AppendOptions,
    ) -> Result<StoredEvent> {
        self.append_detailed(partition, event_type, payload, opts)
            .await?
            .copies
            .into_iter()
            .find(|e| &e.partition_id == partition)
            .ok_or_else(|| HistoryError::NotFound(format!("copy in {partition}")))
    }

    /// Like [`EventLog::append`], but reports every copy and which of them
    /// this call wrote.
    pub async fn append_detailed(
        &self,
        partition: &PartitionId,
        event_type: EventType,
        payload: Value,
        opts: AppendOptions,
    ) -> Result<Appended> {
        let mut event = AppendEvent::new(event_type, payload);
        if let Some(id) = opts.event_id {
            event.id = id;
        }
        event.metadata = opts.metadata;
        event.causation_id = opts.causation_id;
        event.correlation_id = opts.correlation_id;
        event.occurred_at = opts.occurred_at;

        let mut partitions = vec![PartitionId::global()];
        if !partition.is_global() {
            partitions.push(partition.clone());
        }

        let expected = opts.expected_sequence.map(|seq| (partition, seq));
        self.write_copies(&partitions, event, expected).await
    }

    /// Append one logical event to every listed partition. `global` is added
    /// when missing. Returns every physical copy, in partition order.
    pub async fn append_fanout(
        &self,
        partitions: &[PartitionId],
        event: AppendEvent,
    ) -> Result<Vec<StoredEvent>> {
        Ok(self.append_fanout_detailed(partitions, event).await?.copies)
    }

    pub async fn append_fanout_detailed(
        &self,
        partitions: &[PartitionId],
        event: AppendEvent,
    ) -> Result<Appended> {
        let mut targets = Vec::with_capacity(partitions.len() + 1);
        targets.push(PartitionId::global());
        for partition in partitions {
            if !targets.contains(partition) {
                targets.push(partition.clone());
            }
        }
        self.write_copies(&targets, event, None).await
    }

    async fn write_copies(
        &self,
        partitions: &[PartitionId],
        event: AppendEvent,
        expected: Option<(&PartitionId, i64)>,
    ) -> Result<Appended> {
        let _in_flight = self.in_flight.lock(&event.id).await;

        // A retry of an earlier attempt keeps whatever was already written.
        let existing = self.storage.copies_of(&event.id).await?;
        let (held_slots, landed) = match self.sequencer.take_held(&event.id) {
            Some(held) => (Some(held.allocation), held.landed),
            None => (None, Vec::new()),
        };
        let reuse_global = existing.first().map(|e| e.global_order);
        let missing: Vec<PartitionId> = partitions
            .iter()
            .filter(|p| !existing.iter().any(|e| &e.partition_id == *p))
            .cloned()
            .collect();

        if missing.is_empty() {
            debug!(
                event_id = %event.id,
                unreported = landed.len(),
                "Append already recorded, reusing copies"
            );
            return Ok(Appended {
                copies: order_like(partitions, existing),
                written: landed,
            });
        }

        let allocation = match held_slots.and_then(|held| held.covering(&missing)) {
            Some(held) => held,
            None => {
                // Only honour an expected sequence for a partition still to be written.
                let expected = expected.filter(|(p, _)| missing.contains(p));
                match self.sequencer.allocate(&missing, expected, reuse_global) {
                    Ok(allocation) => allocation,
                    Err(e) => {
                        self.hold_unreported(&event.id, landed);
                        return Err(e);
                    }
                }
            }
        };
        let recorded_at = Utc::now();

        let drafts: Vec<StoredEvent> = allocation
            .slots
            .iter()
            .map(|slot| {
                event
                    .clone()
                    .into_stored(slot, allocation.global_order, recorded_at)
            })
            .collect();
        let results = join_all(drafts.iter().map(|copy| self.storage.write(copy))).await;

        let mut fresh: Vec<StoredEvent> = Vec::with_capacity(drafts.len());
        let mut unwritten: Vec<Slot> = Vec::new();
        let mut failure: Option<HistoryError> = None;
        let mut raced = false;
        for (copy, result) in drafts.into_iter().zip(results) {
            match result {
                Ok(true) => fresh.push(copy),
                Ok(false) => {
                    warn!(
                        event_id = %event.id,
                        partition = %copy.partition_id,
                        sequence = copy.sequence_in_partition,
                        "Copy already stored by another writer; slot left empty"
                    );
                    raced = true;
                }
                Err(e) => {
                    // A conflicting slot belongs to someone else now.
                    if !matches!(e, HistoryError::ConcurrencyConflict { .. }) {
                        unwritten.push(Slot {
                            partition_id: copy.partition_id,
                            sequence: copy.sequence_in_partition,
                        });
                    }
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            warn!(
                event_id = %event.id,
                global_order = allocation.global_order,
                landed = fresh.len(),
                error = %e,
                "Append failed; retry with the same event id"
            );
            let mut unreported = landed;
            unreported.extend(fresh);
            if !unwritten.is_empty() || !unreported.is_empty() {
                self.sequencer.hold(
                    &event.id,
                    Held {
                        allocation: Allocation {
                            global_order: allocation.global_order,
                            slots: unwritten,
                        },
                        landed: unreported,
                    },
                );
            }
            return Err(e);
        }

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            global_order = allocation.global_order,
            copies = fresh.len(),
            "Appended event"
        );

        let copies = if raced {
            match self.storage.copies_of(&event.id).await {
                Ok(copies) => copies,
                Err(e) => {
                    let mut unreported = landed;
                    unreported.extend(fresh);
                    self.hold_unreported(&event.id, unreported);
                    return Err(e);
                }
            }
        } else {
            let mut all = existing;
            all.extend(fresh.iter().cloned());
            all
        };
        let mut written = landed;
        written.extend(fresh);
        Ok(Appended {
            copies: order_like(partitions, copies),
            written,
        })
    }

    /// Keep copies an earlier attempt wrote so the next retry still reports
    /// them.
    fn hold_unreported(&self, event_id: &str, landed: Vec<StoredEvent>) {
        let Some(global_order) = landed.first().map(|e| e.global_order) else {
            return;
        };
        self.sequencer.hold(
            event_id,
            Held {
                allocation: Allocation {
                    global_order,
                    slots: Vec::new(),
                },
                landed,
            },
        );
    }

    /// Read one partition in ascending sequence. Unknown partitions are empty.
    pub async fn read_partition(
        &self,
        partition: &PartitionId,
        options: ReadOptions,
    ) -> Result<Vec<StoredEvent>> {
        self.storage.read_partition(partition, options).await
    }

    /// Replay every logical event with `from <= global_order <= to`.
    pub async fn read_by_global_order(&self, from: i64, to: Option<i64>) -> Result<Vec<StoredEvent>> {
        self.storage.read_global_range(from, to).await
    }

    /// The `global` copy of one logical event.
    pub async fn get_event(&self, event_id: &str) -> Result<StoredEvent> {
        let copies = self.storage.copies_of(event_id).await?;
        let mut fallback = None;
        for copy in copies {
            if copy.partition_id.is_global() {
                return Ok(copy);
            }
            fallback.get_or_insert(copy);
        }
        fallback.ok_or_else(|| HistoryError::NotFound(format!("event {event_id}")))
    }

    /// Events directly caused by `event_id`, ascending by global order.
    pub async fn read_caused_by(&self, event_id: &str) -> Result<Vec<StoredEvent>> {
        self.storage.read_caused_by(event_id).await
    }

    /// The sequence the next auto-assigned append to `partition` will get.
    pub fn next_sequence(&self, partition: &PartitionId) -> i64 {
        self.sequencer.next_sequence(partition)
    }

    pub fn decode_failures(&self) -> u64 {
        self.storage.decode_failures()
    }

    /// Drop all events and restart numbering.
    pub async fn reset(&self) -> Result<()> {
        self.storage.clear().await?;
        self.sequencer.reset();
        Ok(())
    }

    pub async fn close(&self) {
        self.storage.close().await;
    }
}

fn order_like(partitions: &[PartitionId], mut copies: Vec<StoredEvent>) -> Vec<StoredEvent> {
    copies.retain(|c| partitions.contains(&c.partition_id));
    copies.sort_by_key(|c| {
        partitions
            .iter()
            .position(|p| p == &c.partition_id)
            .unwrap_or(usize::MAX)
    });
    copies
}
