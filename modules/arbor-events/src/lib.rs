//! Append-only, partitioned event log for the Arbor history layer.
//!
//! Each logical event is stored once per partition it belongs to. Copies share
//! the event id and a single global order; each partition numbers its own
//! copies from zero without gaps.
//!
//! Storage is pluggable through [`EventStorage`]: [`MemoryStorage`] for tests
//! and single-process use, [`PgStorage`] for Postgres.

pub mod error;
pub mod memory;
pub mod partition;
pub mod postgres;
pub mod sequencer;
pub mod storage;
pub mod store;
pub mod types;
pub mod vocabulary;

pub use error::{HistoryError, Result};
pub use memory::MemoryStorage;
pub use partition::{PartitionId, PartitionKind};
pub use postgres::PgStorage;
pub use sequencer::{Allocation, Held, Sequencer, DEFAULT_HOLD_LIMIT};
pub use storage::EventStorage;
pub use store::{Appended, EventLog};
pub use types::{AppendEvent, AppendOptions, PartitionSummary, ReadOptions, Slot, StoredEvent};
pub use vocabulary::{Category, EventType, Kind};
