//! Core types for the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::partition::PartitionId;
use crate::vocabulary::EventType;

/// One physical copy of an event, as stored in one partition. Returned by all
/// read methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    pub partition_id: PartitionId,
    pub sequence_in_partition: i64,
    pub global_order: i64,
    pub event_type: EventType,
    pub payload: Value,
    pub metadata: Value,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// An event to be appended. The caller builds this; the log assigns
/// sequence numbers, global order and `recorded_at`.
///
/// The id is fixed at construction. Retrying an append with the same value
/// is idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendEvent {
    pub id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub metadata: Map<String, Value>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl AppendEvent {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            payload,
            metadata: Map::new(),
            causation_id: None,
            correlation_id: None,
            occurred_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Read a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Read a string field from the metadata.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Materialize the physical copy for one partition slot.
    pub(crate) fn into_stored(
        self,
        slot: &Slot,
        global_order: i64,
        recorded_at: DateTime<Utc>,
    ) -> StoredEvent {
        StoredEvent {
            id: self.id,
            partition_id: slot.partition_id.clone(),
            sequence_in_partition: slot.sequence,
            global_order,
            event_type: self.event_type,
            payload: self.payload,
            metadata: Value::Object(self.metadata),
            causation_id: self.causation_id.filter(|id| !id.is_empty()),
            correlation_id: self.correlation_id.filter(|id| !id.is_empty()),
            occurred_at: self.occurred_at.unwrap_or(recorded_at),
            recorded_at,
        }
    }
}

/// Options for a single-partition append.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Claim exactly this sequence in the target partition, or fail with
    /// `ConcurrencyConflict`. `None` auto-assigns and cannot conflict.
    pub expected_sequence: Option<i64>,
    /// Reuse an id from an earlier, failed attempt.
    pub event_id: Option<String>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl AppendOptions {
    pub fn expecting(sequence: i64) -> Self {
        Self {
            expected_sequence: Some(sequence),
            ..Self::default()
        }
    }
}

/// Floor/ceiling window for incremental partition reads. Both bounds are
/// inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    pub from_sequence: Option<i64>,
    pub to_sequence: Option<i64>,
    pub limit: Option<usize>,
}

impl ReadOptions {
    pub fn from_sequence(sequence: i64) -> Self {
        Self {
            from_sequence: Some(sequence),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn contains(&self, sequence: i64) -> bool {
        self.from_sequence.map_or(true, |from| sequence >= from)
            && self.to_sequence.map_or(true, |to| sequence <= to)
    }
}

/// A sequence slot reserved for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub partition_id: PartitionId,
    pub sequence: i64,
}

/// Aggregate view of one partition, as reported by the storage on startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSummary {
    pub partition_id: PartitionId,
    pub event_count: u64,
    pub max_sequence: i64,
    pub first_event_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
}
