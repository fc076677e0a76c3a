//! The immutable, causally-linked event record.
//!
//! This module provides:
//! - `CausalEvent`, the fact schema stored in the event log
//! - `Causation`, the what/who/why that produced an event
//! - `CausalEventBuilder` for staging new events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identifier::EventIdentifier;

// =============================================================================
// Causation
// =============================================================================

/// What, who and why caused an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Causation {
    /// The event that triggered this one, if any
    pub caused_by_event_id: Option<EventIdentifier>,

    /// The user (or agent) that issued the command
    pub caused_by_user: String,

    /// The command or action name
    pub caused_by_action: String,
}

impl Causation {
    pub fn new(user: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            caused_by_event_id: None,
            caused_by_user: user.into(),
            caused_by_action: action.into(),
        }
    }

    /// Set the triggering event.
    pub fn caused_by(mut self, event_id: EventIdentifier) -> Self {
        self.caused_by_event_id = Some(event_id);
        self
    }
}

// =============================================================================
// CausalEvent
// =============================================================================

/// An immutable fact about an aggregate.
///
/// `version` is the position in the aggregate's stream, starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalEvent {
    pub id: EventIdentifier,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub caused_by_event_id: Option<EventIdentifier>,
    pub caused_by_user: String,
    pub caused_by_action: String,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    pub version: u64,
}

impl CausalEvent {
    /// Start building an event for an aggregate.
    pub fn builder(
        id: EventIdentifier,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
    ) -> CausalEventBuilder {
        CausalEventBuilder::new(id, aggregate_id, aggregate_type, event_type)
    }

    /// Look up a field in the payload's `metadata` object.
    pub fn metadata_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get("metadata").and_then(|m| m.get(key))
    }

    /// The causation triple of this event.
    pub fn causation(&self) -> Causation {
        Causation {
            caused_by_event_id: self.caused_by_event_id.clone(),
            caused_by_user: self.caused_by_user.clone(),
            caused_by_action: self.caused_by_action.clone(),
        }
    }
}

/// Builder for [`CausalEvent`].
#[derive(Debug, Clone)]
pub struct CausalEventBuilder {
    event: CausalEvent,
}

impl CausalEventBuilder {
    fn new(
        id: EventIdentifier,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        let tenant_id = id.namespace().tenant.clone();
        Self {
            event: CausalEvent {
                id,
                aggregate_id: aggregate_id.into(),
                aggregate_type: aggregate_type.into(),
                event_type: event_type.into(),
                payload: serde_json::Value::Null,
                caused_by_event_id: None,
                caused_by_user: String::new(),
                caused_by_action: String::new(),
                timestamp: Utc::now(),
                tenant_id,
                correlation_id: Uuid::new_v4().to_string(),
                process_id: None,
                version: 1,
            },
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.event.payload = payload;
        self
    }

    pub fn causation(mut self, causation: Causation) -> Self {
        self.event.caused_by_event_id = causation.caused_by_event_id;
        self.event.caused_by_user = causation.caused_by_user;
        self.event.caused_by_action = causation.caused_by_action;
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.event.tenant_id = tenant_id.into();
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.event.correlation_id = correlation_id.into();
        self
    }

    pub fn process(mut self, process_id: impl Into<String>) -> Self {
        self.event.process_id = Some(process_id.into());
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.event.version = version;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.event.timestamp = timestamp;
        self
    }

    pub fn build(self) -> CausalEvent {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::identifier::parse_event_id;
    use serde_json::json;

    #[test]
    fn test_builder_defaults_tenant_from_namespace() {
        let id = parse_event_id("acme.work.task#1").unwrap();
        let event = CausalEvent::builder(id, "t1", "task", "TaskCreated")
            .payload(json!({"title": "Write docs"}))
            .causation(Causation::new("user-1", "createTask"))
            .build();

        assert_eq!(event.tenant_id, "acme");
        assert_eq!(event.version, 1);
        assert_eq!(event.caused_by_user, "user-1");
        assert!(!event.correlation_id.is_empty());
    }

    #[test]
    fn test_metadata_field_lookup() {
        let id = parse_event_id("acme.auth.session#3").unwrap();
        let event = CausalEvent::builder(id, "s1", "session", "auth.login")
            .payload(json!({"metadata": {"result": "failure"}}))
            .build();

        assert_eq!(event.metadata_field("result"), Some(&json!("failure")));
        assert!(event.metadata_field("missing").is_none());
    }

    #[test]
    fn test_serializes_camel_case() {
        let id = parse_event_id("acme.work.task#2").unwrap();
        let cause = parse_event_id("acme.work.task#1").unwrap();
        let event = CausalEvent::builder(id, "t1", "task", "TaskUpdated")
            .causation(Causation::new("user-1", "updateTask").caused_by(cause))
            .version(2)
            .build();

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["causedByEventId"], "acme.work.task#1");
        assert_eq!(value["aggregateId"], "t1");
        assert!(value.get("processId").is_none());
    }
}
