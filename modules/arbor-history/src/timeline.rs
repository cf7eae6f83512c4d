//! Timeline reconstruction.
//!
//! Span mode merges several partitions into one chronology keyed by global
//! order. Causal-chain mode follows `causation_id` links from a single event,
//! bounded by a depth limit.

use std::collections::{BTreeMap, HashSet, VecDeque};

use arbor_events::{Category, EventLog, HistoryError, Kind, PartitionId, ReadOptions, Result};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::{decode, HistoryEntry};

pub const DEFAULT_CAUSAL_DEPTH: usize = 50;

/// Time-bounded, multi-partition query. Restrictions are ANDed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub partitions: Vec<PartitionId>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub kinds: Vec<Kind>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl Span {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            partitions: Vec::new(),
            categories: Vec::new(),
            kinds: Vec::new(),
            agent_id: None,
            correlation_id: None,
        }
    }

    pub fn partition(mut self, partition: PartitionId) -> Self {
        self.partitions.push(partition);
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.categories.push(category);
        self
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Partitions to read: explicit ones plus those implied by the
    /// restrictions, or `global` when nothing narrows the span. An agent or
    /// correlation id that cannot name a partition is `InvalidPartition`.
    pub fn resolve_partitions(&self) -> Result<Vec<PartitionId>> {
        let mut resolved: Vec<PartitionId> = self.partitions.clone();
        resolved.extend(
            self.categories
                .iter()
                .filter_map(|c| PartitionId::category(*c).ok()),
        );
        if let Some(agent) = &self.agent_id {
            resolved.push(PartitionId::agent(agent)?);
        }
        if let Some(correlation) = &self.correlation_id {
            resolved.push(PartitionId::correlation(correlation)?);
        }
        if resolved.is_empty() {
            resolved.push(PartitionId::global());
        }
        let mut seen = HashSet::new();
        resolved.retain(|p| seen.insert(p.clone()));
        Ok(resolved)
    }

    fn admits(&self, entry: &HistoryEntry) -> bool {
        entry.occurred_at >= self.from
            && entry.occurred_at <= self.to
            && (self.categories.is_empty() || self.categories.contains(&entry.category))
            && (self.kinds.is_empty() || self.kinds.contains(&entry.kind))
            && self
                .agent_id
                .as_deref()
                .map_or(true, |agent| entry.agent_id() == Some(agent))
            && self
                .correlation_id
                .as_deref()
                .map_or(true, |c| entry.correlation_id.as_deref() == Some(c))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    pub partitions: Vec<PartitionId>,
    pub entries: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Backward,
    Forward,
}

/// Events linked by causation, in increasing global order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CausalChain {
    pub direction: Direction,
    pub entries: Vec<HistoryEntry>,
    /// The depth bound was hit, or a link broke the ordering invariant.
    pub truncated: bool,
    /// A causation id that resolves to no stored event.
    pub missing_cause: Option<String>,
}

#[derive(Clone)]
pub struct TimelineReconstructor {
    log: EventLog,
    max_depth: usize,
}

impl TimelineReconstructor {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            max_depth: DEFAULT_CAUSAL_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    pub async fn reconstruct(&self, span: &Span) -> Result<Timeline> {
        if span.from > span.to {
            return Err(HistoryError::InvalidQuery(format!(
                "span starts after it ends ({} > {})",
                span.from, span.to
            )));
        }

        let partitions = span.resolve_partitions()?;
        let reads = try_join_all(
            partitions
                .iter()
                .map(|p| self.log.read_partition(p, ReadOptions::default())),
        )
        .await?;

        // Keyed by global order: partition sequences are unrelated to each other.
        let mut merged: BTreeMap<i64, HistoryEntry> = BTreeMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        for event in reads.iter().flatten() {
            if seen.contains(&event.id) {
                continue;
            }
            let entry = decode(event);
            if span.admits(&entry) {
                seen.insert(entry.id.clone());
                merged.insert(entry.global_order, entry);
            }
        }

        Ok(Timeline {
            partitions,
            entries: merged.into_values().collect(),
        })
    }

    pub async fn causal_chain(
        &self,
        event_id: &str,
        direction: Direction,
        max_depth: Option<usize>,
    ) -> Result<CausalChain> {
        let depth = max_depth.unwrap_or(self.max_depth).max(1);
        let start = decode(&self.log.get_event(event_id).await?);
        match direction {
            Direction::Backward => self.walk_backward(start, depth).await,
            Direction::Forward => self.walk_forward(start, depth).await,
        }
    }

    async fn walk_backward(&self, start: HistoryEntry, depth: usize) -> Result<CausalChain> {
        let mut seen: HashSet<String> = HashSet::from([start.id.clone()]);
        let mut chain = vec![start];
        let mut truncated = false;
        let mut missing_cause = None;

        while let Some(cause_id) = chain.last().and_then(|e| e.causation_id.clone()) {
            if chain.len() > depth {
                truncated = true;
                break;
            }
            let cause = match self.log.get_event(&cause_id).await {
                Ok(event) => decode(&event),
                Err(HistoryError::NotFound(_)) => {
                    warn!(cause_id = %cause_id, "Causal chain references a missing event");
                    missing_cause = Some(cause_id);
                    break;
                }
                Err(e) => return Err(e),
            };
            let current_order = chain.last().map_or(i64::MAX, |e| e.global_order);
            if cause.global_order >= current_order || !seen.insert(cause.id.clone()) {
                warn!(cause_id = %cause.id, "Causation link violates global ordering");
                truncated = true;
                break;
            }
            chain.push(cause);
        }

        chain.reverse();
        Ok(CausalChain {
            direction: Direction::Backward,
            entries: chain,
            truncated,
            missing_cause,
        })
    }

    async fn walk_forward(&self, start: HistoryEntry, depth: usize) -> Result<CausalChain> {
        let mut seen: HashSet<String> = HashSet::from([start.id.clone()]);
        let mut frontier: VecDeque<(HistoryEntry, usize)> = VecDeque::from([(start.clone(), 0)]);
        let mut collected = vec![start];
        let mut truncated = false;

        while let Some((parent, level)) = frontier.pop_front() {
            let children = self.log.read_caused_by(&parent.id).await?;
            if children.is_empty() {
                continue;
            }
            if level >= depth {
                truncated = true;
                continue;
            }
            for child in children.iter().map(decode) {
                if child.global_order <= parent.global_order || !seen.insert(child.id.clone()) {
                    warn!(event_id = %child.id, "Causation link violates global ordering");
                    truncated = true;
                    continue;
                }
                frontier.push_back((child.clone(), level + 1));
                collected.push(child);
            }
        }

        collected.sort_by_key(|e| e.global_order);
        Ok(CausalChain {
            direction: Direction::Forward,
            entries: collected,
            truncated,
            missing_cause: None,
        })
    }
}
