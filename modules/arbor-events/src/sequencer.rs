//! The single arbitration point for ordering.
//!
//! One lock guards both the shared global counter and every partition's next
//! sequence, so the slots of one logical event are claimed together. Physical
//! writes happen after the lock is released.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use crate::error::{HistoryError, Result};
use crate::partition::PartitionId;
use crate::types::{PartitionSummary, Slot, StoredEvent};

/// How many failed appends keep their slots before the oldest is dropped.
pub const DEFAULT_HOLD_LIMIT: usize = 4096;

/// Slots claimed for one logical event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub global_order: i64,
    pub slots: Vec<Slot>,
}

impl Allocation {
    /// The slots for exactly `partitions`, when this allocation has one for
    /// each of them.
    pub fn covering(&self, partitions: &[PartitionId]) -> Option<Allocation> {
        let covers = partitions
            .iter()
            .all(|p| self.slots.iter().any(|s| &s.partition_id == p));
        covers.then(|| Allocation {
            global_order: self.global_order,
            slots: self
                .slots
                .iter()
                .filter(|s| partitions.contains(&s.partition_id))
                .cloned()
                .collect(),
        })
    }
}

/// What a failed append leaves behind for its retry.
#[derive(Debug, Clone, PartialEq)]
pub struct Held {
    /// Claimed slots that were never written.
    pub allocation: Allocation,
    /// Copies that did land but were never reported to the caller.
    pub landed: Vec<StoredEvent>,
}

#[derive(Debug)]
struct SequencerState {
    next_global: i64,
    next_sequence: HashMap<PartitionId, i64>,
    held: HashMap<String, Held>,
    /// Event ids in `held`, oldest first.
    held_order: VecDeque<String>,
}

impl SequencerState {
    fn empty() -> Self {
        Self {
            next_global: 1,
            next_sequence: HashMap::new(),
            held: HashMap::new(),
            held_order: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
pub struct Sequencer {
    state: Mutex<SequencerState>,
    hold_limit: usize,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SequencerState::empty()),
            hold_limit: DEFAULT_HOLD_LIMIT,
        }
    }

    pub fn with_hold_limit(mut self, limit: usize) -> Self {
        self.hold_limit = limit.max(1);
        self
    }

    /// Resume from what the storage already holds.
    pub fn seeded(summaries: &[PartitionSummary], max_global_order: i64) -> Self {
        let next_sequence = summaries
            .iter()
            .map(|s| (s.partition_id.clone(), s.max_sequence + 1))
            .collect();
        Self {
            state: Mutex::new(SequencerState {
                next_global: max_global_order.max(0) + 1,
                next_sequence,
                held: HashMap::new(),
                held_order: VecDeque::new(),
            }),
            hold_limit: DEFAULT_HOLD_LIMIT,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SequencerState> {
        // Allocation never panics mid-update, so a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim one slot per partition plus a global order.
    ///
    /// `expected` pins the sequence of one partition; any mismatch fails the
    /// whole allocation before anything is claimed. `reuse_global` keeps the
    /// global order of an event whose other copies were already written.
    pub fn allocate(
        &self,
        partitions: &[PartitionId],
        expected: Option<(&PartitionId, i64)>,
        reuse_global: Option<i64>,
    ) -> Result<Allocation> {
        let mut state = self.lock();

        if let Some((partition, expected)) = expected {
            let actual = state.next_sequence.get(partition).copied().unwrap_or(0);
            if expected != actual {
                return Err(HistoryError::ConcurrencyConflict {
                    partition: partition.to_string(),
                    expected,
                    actual,
                });
            }
        }

        let mut slots: Vec<Slot> = Vec::with_capacity(partitions.len());
        for partition in partitions {
            if slots.iter().any(|s| &s.partition_id == partition) {
                continue;
            }
            let next = state.next_sequence.entry(partition.clone()).or_insert(0);
            slots.push(Slot {
                partition_id: partition.clone(),
                sequence: *next,
            });
            *next += 1;
        }

        let global_order = match reuse_global {
            Some(global) => {
                state.next_global = state.next_global.max(global + 1);
                global
            }
            None => {
                let global = state.next_global;
                state.next_global += 1;
                global
            }
        };

        Ok(Allocation {
            global_order,
            slots,
        })
    }

    /// Keep what a failed append left behind so a retry of `event_id` fills
    /// the claimed slots and reports the copies that landed.
    ///
    /// At most `hold_limit` event ids are kept. Past that the oldest hold is
    /// dropped and its unwritten slots stay empty.
    pub fn hold(&self, event_id: &str, held: Held) {
        let mut state = self.lock();
        if state.held.insert(event_id.to_string(), held).is_none() {
            state.held_order.push_back(event_id.to_string());
        }
        while state.held.len() > self.hold_limit {
            let Some(oldest) = state.held_order.pop_front() else {
                break;
            };
            if let Some(dropped) = state.held.remove(&oldest) {
                warn!(
                    event_id = %oldest,
                    unwritten_slots = dropped.allocation.slots.len(),
                    unreported_copies = dropped.landed.len(),
                    "Dropping hold of an append that was never retried"
                );
            }
        }
    }

    /// Consume the hold of `event_id`, if any.
    pub fn take_held(&self, event_id: &str) -> Option<Held> {
        let mut state = self.lock();
        let held = state.held.remove(event_id)?;
        state.held_order.retain(|id| id != event_id);
        Some(held)
    }

    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// The sequence the next auto-assigned append to `partition` will get.
    pub fn next_sequence(&self, partition: &PartitionId) -> i64 {
        self.lock().next_sequence.get(partition).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        *self.lock() = SequencerState::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn first_slot_is_zero_and_global_starts_at_one() {
        let seq = Sequencer::new();
        let alloc = seq
            .allocate(&[PartitionId::global(), PartitionId::agent("a1").unwrap()], None, None)
            .unwrap();
        assert_eq!(alloc.global_order, 1);
        assert_eq!(alloc.slots.len(), 2);
        assert!(alloc.slots.iter().all(|s| s.sequence == 0));
    }

    #[test]
    fn partitions_advance_independently() {
        let seq = Sequencer::new();
        let a = PartitionId::agent("a").unwrap();
        let b = PartitionId::agent("b").unwrap();
        seq.allocate(&[a.clone()], None, None).unwrap();
        seq.allocate(&[a.clone()], None, None).unwrap();
        let third = seq.allocate(&[a.clone(), b.clone()], None, None).unwrap();
        assert_eq!(third.global_order, 3);
        assert_eq!(third.slots[0].sequence, 2);
        assert_eq!(third.slots[1].sequence, 0);
    }

    #[test]
    fn duplicate_partitions_get_one_slot() {
        let seq = Sequencer::new();
        let g = PartitionId::global();
        let alloc = seq.allocate(&[g.clone(), g.clone()], None, None).unwrap();
        assert_eq!(alloc.slots.len(), 1);
        assert_eq!(seq.next_sequence(&g), 1);
    }

    #[test]
    fn stale_expected_sequence_conflicts_without_claiming() {
        let seq = Sequencer::new();
        let p = PartitionId::session("s1").unwrap();
        seq.allocate(&[p.clone()], Some((&p, 0)), None).unwrap();

        let err = seq.allocate(&[p.clone()], Some((&p, 0)), None).unwrap_err();
        assert!(matches!(
            err,
            HistoryError::ConcurrencyConflict { expected: 0, actual: 1, .. }
        ));
        assert_eq!(seq.next_sequence(&p), 1);

        let ahead = seq.allocate(&[p.clone()], Some((&p, 5)), None).unwrap_err();
        assert!(matches!(ahead, HistoryError::ConcurrencyConflict { .. }));
    }

    #[test]
    fn reused_global_does_not_consume_a_new_value() {
        let seq = Sequencer::new();
        let first = seq.allocate(&[PartitionId::global()], None, None).unwrap();
        let retry = seq
            .allocate(&[PartitionId::agent("a1").unwrap()], None, Some(first.global_order))
            .unwrap();
        assert_eq!(retry.global_order, first.global_order);
        let next = seq.allocate(&[PartitionId::global()], None, None).unwrap();
        assert_eq!(next.global_order, first.global_order + 1);
    }

    fn held(allocation: Allocation) -> Held {
        Held {
            allocation,
            landed: Vec::new(),
        }
    }

    #[test]
    fn held_slots_are_returned_once() {
        let seq = Sequencer::new();
        let a = PartitionId::agent("a").unwrap();
        let alloc = seq
            .allocate(&[PartitionId::global(), a.clone()], None, None)
            .unwrap();
        seq.hold("e1", held(alloc.clone()));
        assert_eq!(seq.held_count(), 1);

        let retry = seq.take_held("e1").unwrap().allocation.covering(&[a.clone()]).unwrap();
        assert_eq!(retry.global_order, alloc.global_order);
        assert_eq!(retry.slots, vec![alloc.slots[1].clone()]);
        assert!(seq.take_held("e1").is_none());
        assert_eq!(seq.held_count(), 0);
    }

    #[test]
    fn allocation_not_covering_the_retry_yields_nothing() {
        let seq = Sequencer::new();
        let alloc = seq.allocate(&[PartitionId::global()], None, None).unwrap();
        assert!(alloc.covering(&[PartitionId::session("other").unwrap()]).is_none());
        assert_eq!(alloc.covering(&[]).map(|a| a.slots.len()), Some(0));
    }

    #[test]
    fn holds_past_the_limit_drop_the_oldest() {
        let seq = Sequencer::new().with_hold_limit(2);
        for id in ["e1", "e2", "e3"] {
            let alloc = seq.allocate(&[PartitionId::global()], None, None).unwrap();
            seq.hold(id, held(alloc));
        }
        assert_eq!(seq.held_count(), 2);
        assert!(seq.take_held("e1").is_none());
        assert_eq!(seq.take_held("e2").unwrap().allocation.global_order, 2);
        assert_eq!(seq.take_held("e3").unwrap().allocation.global_order, 3);
    }

    #[test]
    fn rehold_of_the_same_id_keeps_one_entry() {
        let seq = Sequencer::new().with_hold_limit(1);
        let first = seq.allocate(&[PartitionId::global()], None, None).unwrap();
        seq.hold("e1", held(first.clone()));
        seq.hold("e1", held(first));
        assert_eq!(seq.held_count(), 1);
        assert!(seq.take_held("e1").is_some());
    }

    #[test]
    fn seeded_resumes_after_existing_rows() {
        let now = Utc::now();
        let summaries = vec![PartitionSummary {
            partition_id: PartitionId::global(),
            event_count: 10,
            max_sequence: 9,
            first_event_at: now,
            last_event_at: now,
        }];
        let seq = Sequencer::seeded(&summaries, 14);
        let alloc = seq.allocate(&[PartitionId::global()], None, None).unwrap();
        assert_eq!(alloc.slots[0].sequence, 10);
        assert_eq!(alloc.global_order, 15);
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let seq = Arc::new(Sequencer::new());
        let p = PartitionId::agent("busy").unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = seq.clone();
                let p = p.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| seq.allocate(&[p.clone()], None, None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut sequences = HashSet::new();
        let mut globals = HashSet::new();
        for handle in handles {
            for alloc in handle.join().unwrap() {
                assert!(sequences.insert(alloc.slots[0].sequence));
                assert!(globals.insert(alloc.global_order));
            }
        }
        assert_eq!(sequences.len(), 400);
        assert_eq!(sequences.iter().max(), Some(&399));
    }
}
