//! Per-partition reads, filtered queries and aggregate reducers.

use std::collections::BTreeMap;

use arbor_events::{Category, EventLog, HistoryError, Kind, PartitionId, ReadOptions, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::{decode, HistoryEntry};
use crate::filter::Filter;

/// Per-agent activity summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentActivity {
    pub agent_id: String,
    pub total: usize,
    pub by_kind: BTreeMap<Kind, usize>,
    pub error_count: usize,
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct QueryEngine {
    log: EventLog,
}

impl QueryEngine {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }

    /// Decoded entries of one partition. Unknown and empty partitions both
    /// read as an empty list.
    pub async fn read(&self, partition: &PartitionId, options: ReadOptions) -> Result<Vec<HistoryEntry>> {
        let events = self.log.read_partition(partition, options).await?;
        Ok(events.iter().map(decode).collect())
    }

    /// Apply `filter` to the universal partition.
    pub async fn query(&self, filter: &Filter) -> Result<Vec<HistoryEntry>> {
        let entries = self.read(&PartitionId::global(), ReadOptions::default()).await?;
        Ok(filter.apply(entries))
    }

    /// Look up an entry by the producer's original signal id.
    pub async fn find_by_external_id(&self, signal_id: &str) -> Result<HistoryEntry> {
        self.read(&PartitionId::global(), ReadOptions::default())
            .await?
            .into_iter()
            .find(|e| e.signal_id.as_deref() == Some(signal_id))
            .ok_or_else(|| HistoryError::NotFound(format!("signal {signal_id}")))
    }

    pub async fn count_by_category(&self, filter: &Filter) -> Result<BTreeMap<Category, usize>> {
        Ok(count_by_category(&self.query(&filter.unpaged()).await?))
    }

    pub async fn type_distribution(&self, filter: &Filter) -> Result<BTreeMap<String, usize>> {
        Ok(type_distribution(&self.query(&filter.unpaged()).await?))
    }

    pub async fn agent_activity(&self, agent_id: &str, filter: &Filter) -> Result<AgentActivity> {
        let entries = self
            .read(&PartitionId::agent(agent_id)?, ReadOptions::default())
            .await?;
        let matched = filter.unpaged().apply(entries);
        Ok(agent_activity(agent_id, &matched))
    }

    pub async fn error_count(&self, filter: &Filter) -> Result<usize> {
        Ok(error_count(&self.query(&filter.unpaged()).await?))
    }
}

pub fn count_by_category(entries: &[HistoryEntry]) -> BTreeMap<Category, usize> {
    entries.iter().fold(BTreeMap::new(), |mut acc, e| {
        *acc.entry(e.category).or_insert(0) += 1;
        acc
    })
}

pub fn type_distribution(entries: &[HistoryEntry]) -> BTreeMap<String, usize> {
    entries.iter().fold(BTreeMap::new(), |mut acc, e| {
        *acc.entry(e.event_type().to_string()).or_insert(0) += 1;
        acc
    })
}

pub fn error_count(entries: &[HistoryEntry]) -> usize {
    entries.iter().filter(|e| e.is_error()).count()
}

pub fn agent_activity(agent_id: &str, entries: &[HistoryEntry]) -> AgentActivity {
    let mut activity = AgentActivity {
        agent_id: agent_id.to_string(),
        ..AgentActivity::default()
    };
    for entry in entries {
        activity.total += 1;
        *activity.by_kind.entry(entry.kind).or_insert(0) += 1;
        if entry.is_error() {
            activity.error_count += 1;
        }
        activity.first_at = Some(activity.first_at.map_or(entry.occurred_at, |t| t.min(entry.occurred_at)));
        activity.last_at = Some(activity.last_at.map_or(entry.occurred_at, |t| t.max(entry.occurred_at)));
    }
    activity
}
