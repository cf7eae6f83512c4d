//! Partition (stream) identifiers.
//!
//! A partition id is always one of five templates: `global`, `agent:{id}`,
//! `category:{name}`, `session:{id}`, `correlation:{id}`. The constructors and
//! the parser apply the same checks: a key is non-empty without whitespace,
//! and a category is a known one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HistoryError;
use crate::vocabulary::Category;

const GLOBAL: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    Global,
    Agent,
    Category,
    Session,
    Correlation,
}

impl PartitionKind {
    fn prefix(&self) -> &'static str {
        match self {
            PartitionKind::Global => GLOBAL,
            PartitionKind::Agent => "agent",
            PartitionKind::Category => "category",
            PartitionKind::Session => "session",
            PartitionKind::Correlation => "correlation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionId(String);

impl PartitionId {
    /// The universal partition every logical event lands in.
    pub fn global() -> Self {
        Self(GLOBAL.to_string())
    }

    pub fn agent(agent_id: &str) -> Result<Self, HistoryError> {
        Self::templated(PartitionKind::Agent, agent_id)
    }

    /// Fails for `Category::Unknown`, which has no partition.
    pub fn category(category: Category) -> Result<Self, HistoryError> {
        Self::templated(PartitionKind::Category, category.as_str())
    }

    pub fn session(session_id: &str) -> Result<Self, HistoryError> {
        Self::templated(PartitionKind::Session, session_id)
    }

    pub fn correlation(correlation_id: &str) -> Result<Self, HistoryError> {
        Self::templated(PartitionKind::Correlation, correlation_id)
    }

    fn templated(kind: PartitionKind, key: &str) -> Result<Self, HistoryError> {
        let raw = format!("{}:{key}", kind.prefix());
        if key.trim().is_empty() || key.chars().any(char::is_whitespace) {
            return Err(HistoryError::InvalidPartition(raw));
        }
        if kind == PartitionKind::Category && Category::parse(key).is_unknown() {
            return Err(HistoryError::InvalidPartition(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL
    }

    pub fn kind(&self) -> PartitionKind {
        if self.is_global() {
            return PartitionKind::Global;
        }
        match self.0.split_once(':').map(|(prefix, _)| prefix) {
            Some("agent") => PartitionKind::Agent,
            Some("category") => PartitionKind::Category,
            Some("session") => PartitionKind::Session,
            // Construction guarantees one of the templates.
            _ => PartitionKind::Correlation,
        }
    }

    /// The `{id}` part of a templated partition; `None` for `global`.
    pub fn key(&self) -> Option<&str> {
        if self.is_global() {
            None
        } else {
            self.0.split_once(':').map(|(_, key)| key)
        }
    }
}

impl FromStr for PartitionId {
    type Err = HistoryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw == GLOBAL {
            return Ok(Self::global());
        }
        let (prefix, key) = raw
            .split_once(':')
            .ok_or_else(|| HistoryError::InvalidPartition(raw.to_string()))?;
        let kind = [
            PartitionKind::Agent,
            PartitionKind::Category,
            PartitionKind::Session,
            PartitionKind::Correlation,
        ]
        .into_iter()
        .find(|k| k.prefix() == prefix)
        .ok_or_else(|| HistoryError::InvalidPartition(raw.to_string()))?;
        Self::templated(kind, key)
    }
}

impl TryFrom<String> for PartitionId {
    type Error = HistoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PartitionId> for String {
    fn from(value: PartitionId) -> String {
        value.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
