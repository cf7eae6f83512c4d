//! Signal ⇄ event mapping. Pure, no I/O.
//!
//! Signals come from the platform bus and carry untrusted names. Category and
//! kind are resolved against the closed vocabulary; anything unrecognized
//! becomes `unknown`.

use arbor_events::{AppendEvent, Category, EventType, Kind, PartitionId, StoredEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::router::agent_from_source;

/// Metadata key holding the producer's signal id.
pub const SIGNAL_ID_KEY: &str = "signal_id";
/// Metadata key holding the producer address.
pub const SOURCE_KEY: &str = "source";

const NAMESPACE_ROOT: &str = "arbor";

/// Namespace for event ids derived from producer signal ids.
const SIGNAL_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c2e_9b84_4d07_8e55_0c1d_a7b2_f419);

/// A signal as published on the bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    /// Dotted namespace, e.g. `arbor.activity.agent_started`.
    #[serde(default, rename = "type")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, alias = "causation_id")]
    pub cause_id: Option<String>,
    #[serde(default, alias = "trace_id")]
    pub correlation_id: Option<String>,
    #[serde(default, alias = "timestamp")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Signal {
    pub fn new(category: &str, kind: &str, data: Value) -> Self {
        Self {
            category: Some(category.to_string()),
            kind: Some(kind.to_string()),
            data: match data {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            ..Self::default()
        }
    }
}

/// Decoded view of one stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub partition_id: PartitionId,
    pub sequence_in_partition: i64,
    pub global_order: i64,
    pub category: Category,
    pub kind: Kind,
    pub payload: Value,
    pub metadata: Value,
    pub source: Option<String>,
    pub signal_id: Option<String>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn event_type(&self) -> EventType {
        EventType::new(self.category, self.kind)
    }

    /// The agent this entry is about, resolved the same way the router does.
    pub fn agent_id(&self) -> Option<&str> {
        self.payload
            .get("agent_id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .or_else(|| self.source.as_deref().and_then(agent_from_source))
    }

    pub fn is_error(&self) -> bool {
        self.kind.is_error()
    }
}

/// Turn a signal into a draft ready for the log.
///
/// A signal carrying a producer id always encodes to the same event id, so a
/// redelivered signal is recorded once.
pub fn encode(signal: &Signal) -> AppendEvent {
    let event_type = resolve_type(signal);

    let mut metadata = signal.metadata.clone();
    if let Some(source) = &signal.source {
        metadata.insert(SOURCE_KEY.to_string(), Value::String(source.clone()));
    }
    if let Some(id) = &signal.id {
        metadata.insert(SIGNAL_ID_KEY.to_string(), Value::String(id.clone()));
    }

    let causation = non_empty(signal.cause_id.as_deref())
        .or_else(|| metadata_str(&signal.metadata, &["causation_id", "cause_id"]));
    let correlation = non_empty(signal.correlation_id.as_deref())
        .or_else(|| metadata_str(&signal.metadata, &["correlation_id", "trace_id"]));

    let mut event = AppendEvent::new(event_type, Value::Object(signal.data.clone()))
        .with_occurred_at(signal.occurred_at.unwrap_or_else(Utc::now));
    if let Some(signal_id) = non_empty(signal.id.as_deref()) {
        event.id = event_id_for_signal(&signal_id);
    }
    event.metadata = metadata;
    event.causation_id = causation;
    event.correlation_id = correlation;
    event
}

/// The event id a producer signal id maps to.
pub fn event_id_for_signal(signal_id: &str) -> String {
    Uuid::new_v5(&SIGNAL_ID_NAMESPACE, signal_id.as_bytes()).to_string()
}

/// The inverse of [`encode`], with the log-assigned fields attached.
pub fn decode(event: &StoredEvent) -> HistoryEntry {
    let meta = |key: &str| {
        event
            .metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    HistoryEntry {
        id: event.id.clone(),
        partition_id: event.partition_id.clone(),
        sequence_in_partition: event.sequence_in_partition,
        global_order: event.global_order,
        category: event.event_type.category,
        kind: event.event_type.kind,
        payload: event.payload.clone(),
        metadata: event.metadata.clone(),
        source: meta(SOURCE_KEY),
        signal_id: meta(SIGNAL_ID_KEY),
        causation_id: event.causation_id.clone(),
        correlation_id: event.correlation_id.clone(),
        occurred_at: event.occurred_at,
        recorded_at: event.recorded_at,
    }
}

fn resolve_type(signal: &Signal) -> EventType {
    let (ns_category, ns_kind) = signal
        .namespace
        .as_deref()
        .map(split_namespace)
        .unwrap_or((None, None));

    let category = non_empty(signal.category.as_deref())
        .or(ns_category)
        .map_or(Category::Unknown, |c| Category::parse(&c));
    let kind = non_empty(signal.kind.as_deref())
        .or(ns_kind)
        .map_or(Kind::Unknown, |k| Kind::parse(&k));

    EventType::new(category, kind)
}

/// `arbor.activity.agent_started` → (`activity`, `agent_started`). The root
/// segment is optional; a lone segment is taken as the kind.
fn split_namespace(raw: &str) -> (Option<String>, Option<String>) {
    let mut segments: Vec<&str> = raw
        .split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if segments
        .first()
        .is_some_and(|s| s.eq_ignore_ascii_case(NAMESPACE_ROOT))
    {
        segments.remove(0);
    }

    match segments.as_slice() {
        [] => (None, None),
        [kind] => (None, Some(kind.to_string())),
        [category, rest @ ..] => (Some(category.to_string()), Some(rest.join("_"))),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn metadata_str(metadata: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| non_empty(metadata.get(*key).and_then(Value::as_str)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_fields_win() {
        let signal = Signal::new("security", "authorization_denied", json!({"agent_id": "a1"}));
        let event = encode(&signal);
        assert_eq!(event.event_type.to_string(), "security:authorization_denied");
        assert_eq!(event.payload, json!({"agent_id": "a1"}));
    }

    #[test]
    fn dotted_namespace_is_parsed() {
        let signal = Signal {
            namespace: Some("arbor.activity.agent_started".to_string()),
            ..Signal::default()
        };
        assert_eq!(
            encode(&signal).event_type,
            EventType::new(Category::Activity, Kind::AgentStarted)
        );

        let no_root = Signal {
            namespace: Some("tool.tool_failed".to_string()),
            ..Signal::default()
        };
        assert_eq!(
            encode(&no_root).event_type,
            EventType::new(Category::Tool, Kind::ToolFailed)
        );
    }

    #[test]
    fn multi_segment_kind_is_joined() {
        let signal = Signal {
            namespace: Some("arbor.session.message.sent".to_string()),
            ..Signal::default()
        };
        assert_eq!(encode(&signal).event_type.kind, Kind::MessageSent);
    }

    #[test]
    fn unregistered_names_map_to_unknown() {
        let signal = Signal::new("exfiltration", "steal_everything", json!({}));
        let event = encode(&signal);
        assert_eq!(event.event_type, EventType::UNKNOWN);
    }

    #[test]
    fn both_causation_spellings_are_accepted() {
        let a: Signal = serde_json::from_value(json!({"cause_id": "e1"})).unwrap();
        let b: Signal = serde_json::from_value(json!({"causation_id": "e1"})).unwrap();
        assert_eq!(encode(&a).causation_id.as_deref(), Some("e1"));
        assert_eq!(encode(&b).causation_id.as_deref(), Some("e1"));

        let c: Signal = serde_json::from_value(json!({"trace_id": "op"})).unwrap();
        assert_eq!(encode(&c).correlation_id.as_deref(), Some("op"));
    }

    #[test]
    fn ids_fall_back_to_metadata() {
        let signal: Signal = serde_json::from_value(json!({
            "metadata": {"causation_id": "e9", "correlation_id": "op-3"}
        }))
        .unwrap();
        let event = encode(&signal);
        assert_eq!(event.causation_id.as_deref(), Some("e9"));
        assert_eq!(event.correlation_id.as_deref(), Some("op-3"));
    }

    #[test]
    fn occurred_at_defaults_to_now() {
        let before = Utc::now();
        let event = encode(&Signal::default());
        let at = event.occurred_at.unwrap();
        assert!(at >= before);
    }

    #[test]
    fn source_and_signal_id_land_in_metadata() {
        let signal = Signal {
            id: Some("sig-1".to_string()),
            source: Some("arbor://agent/a1".to_string()),
            ..Signal::default()
        };
        let event = encode(&signal);
        assert_eq!(event.metadata_str(SIGNAL_ID_KEY), Some("sig-1"));
        assert_eq!(event.metadata_str(SOURCE_KEY), Some("arbor://agent/a1"));
    }

    #[test]
    fn signal_id_fixes_the_event_id() {
        let signal = Signal {
            id: Some("sig-7".to_string()),
            ..Signal::new("tool", "tool_invoked", json!({}))
        };
        let first = encode(&signal);
        assert_eq!(first.id, encode(&signal).id);
        assert_eq!(first.id, event_id_for_signal("sig-7"));
        assert_ne!(first.id, event_id_for_signal("sig-8"));

        let anonymous = Signal::new("tool", "tool_invoked", json!({}));
        assert_ne!(encode(&anonymous).id, encode(&anonymous).id);
    }
}
