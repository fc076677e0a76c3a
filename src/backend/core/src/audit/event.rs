//! Audit record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Audit severity derived from a risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// The single score-to-severity mapping: 0-25 low, 26-50 medium,
    /// 51-75 high, 76-100 critical.
    pub fn from_risk_score(score: u8) -> Self {
        match score {
            0..=25 => Self::Low,
            26..=50 => Self::Medium,
            51..=75 => Self::High,
            _ => Self::Critical,
        }
    }

    pub fn is_high_or_critical(&self) -> bool {
        *self >= Self::High
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Classification Outputs
// ═══════════════════════════════════════════════════════════════════════════════

/// Audit category, derived from the event type prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Authentication,
    Authorization,
    Security,
    DataAccess,
    DataModification,
    Compliance,
    AiAction,
    System,
    Operational,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Security => "security",
            Self::DataAccess => "data_access",
            Self::DataModification => "data_modification",
            Self::Compliance => "compliance",
            Self::AiAction => "ai_action",
            Self::System => "system",
            Self::Operational => "operational",
        }
    }
}

/// Kind of operation performed, derived from the event type verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Read,
    Update,
    Delete,
    Export,
    Login,
    Logout,
    Execute,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Actors and Entities
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    System,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(rename = "type")]
    pub actor_type: ActorType,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actor_type: ActorType::User,
        }
    }

    pub fn system(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actor_type: ActorType::System,
        }
    }

    pub fn ai(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actor_type: ActorType::Ai,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
        }
    }
}

/// A single field-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub field: String,
    #[serde(default)]
    pub old_value: serde_json::Value,
    #[serde(default)]
    pub new_value: serde_json::Value,
}

/// Retention tier for persisted records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Hot,
    Warm,
    Cold,
}

impl StorageTier {
    pub fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::High | Severity::Critical => Self::Hot,
            Severity::Medium => Self::Warm,
            Severity::Low => Self::Cold,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Audit Event
// ═══════════════════════════════════════════════════════════════════════════════

/// The durable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub blueprint_id: String,
    pub event_type: String,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityRef>,
    pub category: AuditCategory,
    pub severity: Severity,
    pub risk_score: u8,
    #[serde(default)]
    pub compliance_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<OperationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<Change>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub storage_tier: StorageTier,
    pub ai_generated: bool,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    /// An unclassified record; classification fills in category, severity and score.
    pub fn new(blueprint_id: impl Into<String>, event_type: impl Into<String>, actor: Actor) -> Self {
        let ai_generated = actor.actor_type == ActorType::Ai;
        Self {
            blueprint_id: blueprint_id.into(),
            event_type: event_type.into(),
            actor,
            entity: None,
            category: AuditCategory::Operational,
            severity: Severity::Low,
            risk_score: 0,
            compliance_tags: Vec::new(),
            operation_type: None,
            changes: None,
            metadata: None,
            storage_tier: StorageTier::Cold,
            ai_generated,
            created_at: Utc::now(),
        }
    }

    pub fn with_entity(mut self, entity: EntityRef) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn with_changes(mut self, changes: Vec<Change>) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }

    /// Whether the metadata reports a failed outcome.
    pub fn is_failure(&self) -> bool {
        let Some(metadata) = &self.metadata else {
            return false;
        };
        if metadata.get("success").and_then(|v| v.as_bool()) == Some(false) {
            return true;
        }
        matches!(
            metadata.get("result").and_then(|v| v.as_str()),
            Some("failure" | "failed" | "denied" | "error")
        )
    }

    pub fn change_count(&self) -> usize {
        self.changes.as_ref().map_or(0, Vec::len)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Notification
// ═══════════════════════════════════════════════════════════════════════════════

/// An alert written to the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub title: String,
    pub description: String,
    pub datetime: DateTime<Utc>,
    pub read: bool,
    /// Name of the policy rule that raised the alert
    pub extra: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl Notification {
    pub fn alert(
        user_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        rule_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            notification_type: "ALERT".to_string(),
            title: title.into(),
            description: description.into(),
            datetime: Utc::now(),
            read: false,
            extra: rule_name.into(),
            link: None,
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }
}
