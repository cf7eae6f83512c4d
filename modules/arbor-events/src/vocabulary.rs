//! Closed event-type vocabulary.
//!
//! External signal names are untrusted. Every category and kind is a variant
//! of a fixed enum; strings that match nothing resolve to `Unknown` instead of
//! minting a new identifier.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! closed_vocabulary {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $text:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(into = "String", from = "String")]
        pub enum $name {
            $($variant,)+
            Unknown,
        }

        impl $name {
            /// Every registered value, excluding `Unknown`.
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                    $name::Unknown => "unknown",
                }
            }

            /// Resolve an external string. Never fails: unregistered input
            /// becomes `Unknown`.
            pub fn parse(raw: &str) -> Self {
                let normalized = raw.trim().to_ascii_lowercase();
                match normalized.as_str() {
                    $($text => $name::$variant,)+
                    _ => $name::Unknown,
                }
            }

            pub fn is_unknown(&self) -> bool {
                matches!(self, $name::Unknown)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.as_str().to_string()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name::parse(&value)
            }
        }
    };
}

closed_vocabulary! {
    /// Top-level event category.
    pub enum Category {
        Activity => "activity",
        Security => "security",
        Tool => "tool",
        Session => "session",
        Consensus => "consensus",
        Memory => "memory",
        System => "system",
    }
}

closed_vocabulary! {
    /// What happened, within a category.
    pub enum Kind {
        AgentStarted => "agent_started",
        AgentStopped => "agent_stopped",
        AgentCrashed => "agent_crashed",
        TaskStarted => "task_started",
        TaskCompleted => "task_completed",
        TaskFailed => "task_failed",
        AuthorizationGranted => "authorization_granted",
        AuthorizationDenied => "authorization_denied",
        CapabilityGranted => "capability_granted",
        CapabilityRevoked => "capability_revoked",
        PolicyViolation => "policy_violation",
        ToolInvoked => "tool_invoked",
        ToolSucceeded => "tool_succeeded",
        ToolFailed => "tool_failed",
        SessionStarted => "session_started",
        SessionEnded => "session_ended",
        MessageReceived => "message_received",
        MessageSent => "message_sent",
        ProposalSubmitted => "proposal_submitted",
        ProposalApproved => "proposal_approved",
        ProposalRejected => "proposal_rejected",
        EvaluationCompleted => "evaluation_completed",
        MemoryStored => "memory_stored",
        MemoryRecalled => "memory_recalled",
        NodeJoined => "node_joined",
        NodeLeft => "node_left",
        HealthCheck => "health_check",
        Error => "error",
    }
}

impl Kind {
    /// Kinds counted by error reducers.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Kind::AgentCrashed
                | Kind::TaskFailed
                | Kind::AuthorizationDenied
                | Kind::PolicyViolation
                | Kind::ToolFailed
                | Kind::ProposalRejected
                | Kind::Error
        )
    }
}

/// `category:kind` pair stored in the `event_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct EventType {
    pub category: Category,
    pub kind: Kind,
}

impl EventType {
    pub const UNKNOWN: EventType = EventType {
        category: Category::Unknown,
        kind: Kind::Unknown,
    };

    pub fn new(category: Category, kind: Kind) -> Self {
        Self { category, kind }
    }

    /// Split a stored `category:kind` string. A missing separator leaves the
    /// category unknown and treats the whole string as a kind.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((category, kind)) => Self::new(Category::parse(category), Kind::parse(kind)),
            None => Self::new(Category::Unknown, Kind::parse(raw)),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind.is_error()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.kind)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> String {
        value.to_string()
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        EventType::parse(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_names_resolve() {
        assert_eq!(Category::parse("security"), Category::Security);
        assert_eq!(Kind::parse(" Agent_Started "), Kind::AgentStarted);
    }

    #[test]
    fn unregistered_names_become_unknown() {
        assert_eq!(Category::parse("definitely_not_a_category"), Category::Unknown);
        assert_eq!(Kind::parse("drop_table"), Kind::Unknown);
        assert_eq!(Kind::parse(""), Kind::Unknown);
    }

    #[test]
    fn every_variant_round_trips_through_its_name() {
        for category in Category::ALL {
            assert_eq!(Category::parse(category.as_str()), *category);
        }
        for kind in Kind::ALL {
            assert_eq!(Kind::parse(kind.as_str()), *kind);
        }
    }

    #[test]
    fn event_type_splits_on_colon() {
        let t = EventType::parse("activity:agent_started");
        assert_eq!(t, EventType::new(Category::Activity, Kind::AgentStarted));
        assert_eq!(t.to_string(), "activity:agent_started");

        let unknown = EventType::parse("weird:thing");
        assert_eq!(unknown.to_string(), "unknown:unknown");
    }

    #[test]
    fn event_type_serializes_as_string() {
        let t = EventType::new(Category::Tool, Kind::ToolFailed);
        let json = serde_json::to_value(t).unwrap();
        assert_eq!(json, serde_json::json!("tool:tool_failed"));
        let back: EventType = serde_json::from_value(json).unwrap();
        assert_eq!(back, t);
        assert!(back.is_error());
    }
}
