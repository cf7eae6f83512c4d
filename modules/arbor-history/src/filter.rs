//! Declarative filters over decoded history entries.

use std::cmp::Ordering;
use std::fmt;

use arbor_events::{Category, HistoryError, Kind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::codec::HistoryEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
}

/// A filterable attribute of an entry. Payload and metadata keys may be
/// dotted paths (`payload.tool.name`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Field {
    Category,
    Kind,
    Type,
    Source,
    CorrelationId,
    CausationId,
    AgentId,
    OccurredAt,
    RecordedAt,
    GlobalOrder,
    Payload(String),
    Metadata(String),
}

impl Field {
    fn extract(&self, entry: &HistoryEntry) -> Value {
        let opt = |v: Option<&str>| v.map_or(Value::Null, |s| Value::String(s.to_string()));
        match self {
            Field::Category => json!(entry.category.as_str()),
            Field::Kind => json!(entry.kind.as_str()),
            Field::Type => json!(entry.event_type().to_string()),
            Field::Source => opt(entry.source.as_deref()),
            Field::CorrelationId => opt(entry.correlation_id.as_deref()),
            Field::CausationId => opt(entry.causation_id.as_deref()),
            Field::AgentId => opt(entry.agent_id()),
            Field::OccurredAt => json!(entry.occurred_at.to_rfc3339()),
            Field::RecordedAt => json!(entry.recorded_at.to_rfc3339()),
            Field::GlobalOrder => json!(entry.global_order),
            Field::Payload(path) => lookup(&entry.payload, path),
            Field::Metadata(path) => lookup(&entry.metadata, path),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Category => f.write_str("category"),
            Field::Kind => f.write_str("kind"),
            Field::Type => f.write_str("type"),
            Field::Source => f.write_str("source"),
            Field::CorrelationId => f.write_str("correlation_id"),
            Field::CausationId => f.write_str("causation_id"),
            Field::AgentId => f.write_str("agent_id"),
            Field::OccurredAt => f.write_str("occurred_at"),
            Field::RecordedAt => f.write_str("recorded_at"),
            Field::GlobalOrder => f.write_str("global_order"),
            Field::Payload(path) => write!(f, "payload.{path}"),
            Field::Metadata(path) => write!(f, "metadata.{path}"),
        }
    }
}

impl TryFrom<String> for Field {
    type Error = HistoryError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let field = match raw.as_str() {
            "category" => Field::Category,
            "kind" => Field::Kind,
            "type" => Field::Type,
            "source" => Field::Source,
            "correlation_id" => Field::CorrelationId,
            "causation_id" => Field::CausationId,
            "agent_id" => Field::AgentId,
            "occurred_at" => Field::OccurredAt,
            "recorded_at" => Field::RecordedAt,
            "global_order" => Field::GlobalOrder,
            other => match other.split_once('.') {
                Some(("payload", path)) if !path.is_empty() => Field::Payload(path.to_string()),
                Some(("metadata", path)) if !path.is_empty() => Field::Metadata(path.to_string()),
                _ => return Err(HistoryError::InvalidQuery(format!("unknown field {raw}"))),
            },
        };
        Ok(field)
    }
}

impl From<Field> for String {
    fn from(field: Field) -> String {
        field.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: Field,
    pub op: Op,
    pub value: Value,
}

impl Condition {
    pub fn new(field: Field, op: Op, value: Value) -> Self {
        Self { field, op, value }
    }

    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        let actual = self.field.extract(entry);
        match self.op {
            Op::Eq => loosely_equal(&actual, &self.value),
            Op::Neq => !loosely_equal(&actual, &self.value),
            Op::Gt => compare(&actual, &self.value) == Some(Ordering::Greater),
            Op::Gte => matches!(
                compare(&actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Op::Lt => compare(&actual, &self.value) == Some(Ordering::Less),
            Op::Lte => matches!(
                compare(&actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Op::In => self
                .value
                .as_array()
                .is_some_and(|options| options.iter().any(|v| loosely_equal(&actual, v))),
            Op::Contains => match (&actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|v| loosely_equal(v, needle)),
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    GlobalOrderAsc,
    GlobalOrderDesc,
    OccurredAtAsc,
    OccurredAtDesc,
}

/// Conditions are ANDed. `since`/`until` bound `occurred_at` inclusively.
/// `offset` and `limit` apply after filtering and ordering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    pub conditions: Vec<Condition>,
    #[serde(alias = "from")]
    pub since: Option<DateTime<Utc>>,
    #[serde(alias = "to")]
    pub until: Option<DateTime<Utc>>,
    pub order_by: OrderBy,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition(mut self, field: Field, op: Op, value: Value) -> Self {
        self.conditions.push(Condition::new(field, op, value));
        self
    }

    pub fn category(self, category: Category) -> Self {
        self.with_condition(Field::Category, Op::Eq, json!(category.as_str()))
    }

    pub fn kind(self, kind: Kind) -> Self {
        self.with_condition(Field::Kind, Op::Eq, json!(kind.as_str()))
    }

    pub fn source(self, source: &str) -> Self {
        self.with_condition(Field::Source, Op::Eq, json!(source))
    }

    pub fn correlation(self, correlation_id: &str) -> Self {
        self.with_condition(Field::CorrelationId, Op::Eq, json!(correlation_id))
    }

    pub fn agent(self, agent_id: &str) -> Self {
        self.with_condition(Field::AgentId, Op::Eq, json!(agent_id))
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.since = Some(from);
        self.until = Some(to);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        self.since.map_or(true, |since| entry.occurred_at >= since)
            && self.until.map_or(true, |until| entry.occurred_at <= until)
            && self.conditions.iter().all(|c| c.matches(entry))
    }

    /// Filter, order, then page `entries`.
    pub fn apply(&self, entries: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
        let mut matched: Vec<HistoryEntry> = entries.into_iter().filter(|e| self.matches(e)).collect();
        match self.order_by {
            OrderBy::GlobalOrderAsc => matched.sort_by_key(|e| e.global_order),
            OrderBy::GlobalOrderDesc => matched.sort_by_key(|e| std::cmp::Reverse(e.global_order)),
            OrderBy::OccurredAtAsc => matched.sort_by_key(|e| (e.occurred_at, e.global_order)),
            OrderBy::OccurredAtDesc => {
                matched.sort_by_key(|e| std::cmp::Reverse((e.occurred_at, e.global_order)))
            }
        }
        matched
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// The filter without paging, for reducers that must see every match.
    pub fn unpaged(&self) -> Self {
        Self {
            limit: None,
            offset: None,
            ..self.clone()
        }
    }
}

fn lookup(root: &Value, path: &str) -> Value {
    path.split('.')
        .try_fold(root, |node, key| node.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    a == b || compare(a, b) == Some(Ordering::Equal)
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (parse_timestamp(x), parse_timestamp(y)) {
                (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_events::PartitionId;
    use chrono::Duration;

    fn entry(order: i64, category: Category, kind: Kind, payload: Value) -> HistoryEntry {
        let at = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(order);
        HistoryEntry {
            id: format!("e{order}"),
            partition_id: PartitionId::global(),
            sequence_in_partition: order - 1,
            global_order: order,
            category,
            kind,
            payload,
            metadata: json!({"source": "arbor://agent/a1"}),
            source: Some("arbor://agent/a1".to_string()),
            signal_id: None,
            causation_id: None,
            correlation_id: None,
            occurred_at: at,
            recorded_at: at,
        }
    }

    #[test]
    fn field_names_parse() {
        let parsed: Field = serde_json::from_value(json!("payload.tool.name")).unwrap();
        assert_eq!(parsed, Field::Payload("tool.name".to_string()));
        assert!(serde_json::from_value::<Field>(json!("password")).is_err());
        assert_eq!(Field::CorrelationId.to_string(), "correlation_id");
    }

    #[test]
    fn operators() {
        let e = entry(3, Category::Tool, Kind::ToolInvoked, json!({"tool": {"name": "grep"}, "ms": 40, "tags": ["fs"]}));

        assert!(Condition::new(Field::Payload("tool.name".into()), Op::Eq, json!("grep")).matches(&e));
        assert!(Condition::new(Field::Kind, Op::Neq, json!("tool_failed")).matches(&e));
        assert!(Condition::new(Field::Payload("ms".into()), Op::Gt, json!(39)).matches(&e));
        assert!(Condition::new(Field::Payload("ms".into()), Op::Lte, json!(40.0)).matches(&e));
        assert!(!Condition::new(Field::Payload("ms".into()), Op::Lt, json!(40)).matches(&e));
        assert!(Condition::new(Field::Category, Op::In, json!(["tool", "security"])).matches(&e));
        assert!(Condition::new(Field::Payload("tags".into()), Op::Contains, json!("fs")).matches(&e));
        assert!(Condition::new(Field::Source, Op::Contains, json!("agent/a1")).matches(&e));
        assert!(Condition::new(Field::GlobalOrder, Op::Gte, json!(3)).matches(&e));
        assert!(Condition::new(Field::AgentId, Op::Eq, json!("a1")).matches(&e));
        assert!(!Condition::new(Field::Payload("missing".into()), Op::Eq, json!("x")).matches(&e));
    }

    #[test]
    fn timestamps_compare_chronologically() {
        let e = entry(1, Category::Activity, Kind::AgentStarted, json!({}));
        let later = "2026-03-01T13:00:00+01:00";
        assert!(Condition::new(Field::OccurredAt, Op::Gte, json!(later)).matches(&e));
    }

    #[test]
    fn apply_filters_orders_and_pages() {
        let entries: Vec<_> = (1..=6)
            .map(|i| {
                let category = if i % 2 == 0 { Category::Security } else { Category::Activity };
                entry(i, category, Kind::Unknown, json!({}))
            })
            .collect();

        let all_security = Filter::new().category(Category::Security).apply(entries.clone());
        assert_eq!(all_security.iter().map(|e| e.global_order).collect::<Vec<_>>(), vec![2, 4, 6]);

        let page = Filter::new()
            .category(Category::Security)
            .order_by(OrderBy::GlobalOrderDesc)
            .offset(1)
            .limit(1)
            .apply(entries.clone());
        assert_eq!(page[0].global_order, 4);

        let window_start = entries[1].occurred_at;
        let window_end = entries[3].occurred_at;
        let windowed = Filter::new().between(window_start, window_end).apply(entries);
        assert_eq!(windowed.len(), 3);
    }

    #[test]
    fn filter_deserializes_from_json() {
        let filter: Filter = serde_json::from_value(json!({
            "conditions": [{"field": "category", "op": "eq", "value": "security"}],
            "order_by": "occurred_at_desc",
            "limit": 5
        }))
        .unwrap();
        assert_eq!(filter.limit, Some(5));
        assert_eq!(filter.order_by, OrderBy::OccurredAtDesc);
        assert_eq!(filter.conditions[0].field, Field::Category);
    }

    #[test]
    fn window_accepts_from_and_to() {
        let filter: Filter = serde_json::from_value(json!({
            "from": "2026-03-01T12:00:00Z",
            "to": "2026-03-01T12:05:00Z"
        }))
        .unwrap();
        let inside = entry(3, Category::Security, Kind::PolicyViolation, json!({}));
        let outside = entry(9, Category::Security, Kind::PolicyViolation, json!({}));
        assert!(filter.matches(&inside));
        assert!(!filter.matches(&outside));
    }
}
