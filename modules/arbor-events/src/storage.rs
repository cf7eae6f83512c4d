//! The storage contract beneath the event log.

use async_trait::async_trait;

use crate::error::Result;
use crate::partition::PartitionId;
use crate::types::{PartitionSummary, ReadOptions, StoredEvent};

/// Durable home for physical event copies.
///
/// Implemented by `MemoryStorage` (tests, single process) and `PgStorage`
/// (production). Sequencing happens above this trait; implementations only
/// enforce uniqueness of `(partition_id, sequence_in_partition)` and of
/// `(id, partition_id)`.
#[async_trait]
pub trait EventStorage: Send + Sync {
    /// Write one physical copy. Returns `false` when the partition already
    /// holds a copy of this event id, in which case nothing is written. A
    /// taken `(partition, sequence)` slot is a `ConcurrencyConflict`.
    async fn write(&self, event: &StoredEvent) -> Result<bool>;

    /// Copies of one partition in ascending sequence. Unknown partitions
    /// read as empty.
    async fn read_partition(
        &self,
        partition: &PartitionId,
        options: ReadOptions,
    ) -> Result<Vec<StoredEvent>>;

    /// `global` copies with `from <= global_order <= to`, ascending.
    async fn read_global_range(&self, from: i64, to: Option<i64>) -> Result<Vec<StoredEvent>>;

    /// Every physical copy of a logical event.
    async fn copies_of(&self, event_id: &str) -> Result<Vec<StoredEvent>>;

    /// `global` copies whose `causation_id` is `event_id`, ascending.
    async fn read_caused_by(&self, event_id: &str) -> Result<Vec<StoredEvent>>;

    async fn partition_summaries(&self) -> Result<Vec<PartitionSummary>>;

    /// Highest global order written so far, `0` when empty.
    async fn max_global_order(&self) -> Result<i64>;

    /// Rows skipped by reads because they could not be decoded.
    fn decode_failures(&self) -> u64;

    /// Drop every stored copy.
    async fn clear(&self) -> Result<()>;

    /// Release connections. Further calls may fail.
    async fn close(&self) {}
}
