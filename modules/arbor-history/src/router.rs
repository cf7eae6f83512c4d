//! Partition routing. Pure.

use arbor_events::{AppendEvent, PartitionId};

use crate::codec::SOURCE_KEY;

/// Every partition `event` belongs to, `global` first.
///
/// Partitions are added independently: a resolved category, the agent (from
/// `payload.agent_id` or the source address), `payload.session_id`, and a
/// non-empty correlation id.
pub fn route(event: &AppendEvent) -> Vec<PartitionId> {
    let mut partitions = vec![PartitionId::global()];

    // An unknown category has no partition.
    partitions.extend(PartitionId::category(event.event_type.category).ok());

    let agent = event
        .payload_str("agent_id")
        .and_then(valid_key)
        .or_else(|| event.metadata_str(SOURCE_KEY).and_then(agent_from_source));
    partitions.extend(agent.and_then(|agent| PartitionId::agent(agent).ok()));

    let session = event.payload_str("session_id").and_then(valid_key);
    partitions.extend(session.and_then(|session| PartitionId::session(session).ok()));

    let correlation = event.correlation_id.as_deref().and_then(valid_key);
    partitions.extend(correlation.and_then(|c| PartitionId::correlation(c).ok()));

    partitions.dedup();
    partitions
}

/// Pull the agent id out of a source address.
///
/// Recognized shapes: `arbor://agent/{id}/...`, `.../agents/{id}`,
/// `agent:{id}`.
pub fn agent_from_source(source: &str) -> Option<&str> {
    if let Some(rest) = source.strip_prefix("agent:") {
        return valid_key(rest);
    }

    let path = source.split_once("://").map_or(source, |(_, rest)| rest);
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "agent" || segment == "agents" {
            return segments.next().and_then(valid_key);
        }
    }
    None
}

fn valid_key(raw: &str) -> Option<&str> {
    let key = raw.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        None
    } else {
        Some(key)
    }
}
