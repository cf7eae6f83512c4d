//! Arbor history: turns bus signals into partitioned events and answers
//! questions about them.
//!
//! Signals are encoded against the closed vocabulary, routed to their
//! partitions and fanned out through the [`arbor_events::EventLog`]. Reads go
//! through the query engine (filters, aggregates) or the timeline
//! reconstructor (time spans, causal chains). [`HistoryService`] wires it all
//! together.

pub mod codec;
pub mod config;
pub mod filter;
pub mod query;
pub mod registry;
pub mod router;
pub mod service;
pub mod timeline;

pub use codec::{decode, encode, event_id_for_signal, HistoryEntry, Signal};
pub use config::{Backend, HistoryConfig};
pub use filter::{Condition, Field, Filter, Op, OrderBy};
pub use query::{AgentActivity, QueryEngine};
pub use registry::{PartitionInfo, PartitionRegistry};
pub use router::route;
pub use service::HistoryService;
pub use timeline::{CausalChain, Direction, Span, Timeline, TimelineReconstructor};
