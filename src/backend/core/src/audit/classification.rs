//! Deterministic audit classification.
//!
//! Category comes from the event-type prefix, operation type from its verb
//! unless the record already carries one.
//! The risk score starts at a per-category base and is adjusted by outcome,
//! operation, actor and change volume, then clamped to 0..=100. Compliance
//! tags follow from the category and any sensitive entity or field.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{ChronicleError, Result};

use super::event::{ActorType, AuditCategory, AuditEvent, OperationType, Severity, StorageTier};

/// Output of [`AuditClassificationEngine::classify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub category: AuditCategory,
    pub severity: Severity,
    pub risk_score: u8,
    pub compliance_tags: Vec<String>,
    pub operation_type: Option<OperationType>,
}

impl Classification {
    /// Copy the classification onto an audit record.
    pub fn apply_to(&self, event: &mut AuditEvent) {
        event.category = self.category;
        event.severity = self.severity;
        event.risk_score = self.risk_score;
        event.compliance_tags = self.compliance_tags.clone();
        event.operation_type = self.operation_type;
        event.storage_tier = StorageTier::for_severity(self.severity);
    }
}

const FAILURE_MODIFIER: u32 = 25;
const DELETE_MODIFIER: u32 = 15;
const EXPORT_MODIFIER: u32 = 20;
const AI_ACTOR_MODIFIER: u32 = 10;
const SENSITIVE_MODIFIER: u32 = 15;
const PER_CHANGE_MODIFIER: u32 = 2;
const MAX_CHANGE_MODIFIER: u32 = 10;

/// Stateless classifier with configurable sensitivity lists.
#[derive(Debug, Clone)]
pub struct AuditClassificationEngine {
    sensitive_entities: HashSet<String>,
    sensitive_fields: HashSet<String>,
    financial_fields: HashSet<String>,
}

impl Default for AuditClassificationEngine {
    fn default() -> Self {
        let set = |items: &[&str]| -> HashSet<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            sensitive_entities: set(&[
                "user",
                "customer",
                "employee",
                "payment",
                "invoice",
                "contract",
                "personal_data",
                "medical_record",
            ]),
            sensitive_fields: set(&[
                "email",
                "phone",
                "address",
                "ssn",
                "date_of_birth",
                "password",
                "salary",
                "medical",
            ]),
            financial_fields: set(&["amount", "price", "value", "salary", "balance", "budget"]),
        }
    }
}

impl AuditClassificationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensitive_entity(mut self, entity_type: impl Into<String>) -> Self {
        self.sensitive_entities.insert(entity_type.into().to_lowercase());
        self
    }

    /// Whether the record touches a sensitive entity or field.
    pub fn is_sensitive(&self, event: &AuditEvent) -> bool {
        let entity = event
            .entity
            .as_ref()
            .map_or(false, |e| self.sensitive_entities.contains(&e.entity_type.to_lowercase()));
        entity || self.changed_fields(event).any(|f| self.sensitive_fields.contains(&f))
    }

    /// Classify an audit record. Identical input yields identical output.
    pub fn classify(&self, event: &AuditEvent) -> Result<Classification> {
        let tokens = tokenize(&event.event_type);
        if tokens.is_empty() {
            return Err(ChronicleError::field("eventType", "Audit event type is empty"));
        }

        let operation_type = event.operation_type.or_else(|| operation_of(&tokens));
        let category = category_of(&tokens, operation_type, event.actor.actor_type);
        let sensitive = self.is_sensitive(event);

        let mut score = base_score(category);
        if event.is_failure() {
            score += FAILURE_MODIFIER;
        }
        match operation_type {
            Some(OperationType::Delete) => score += DELETE_MODIFIER,
            Some(OperationType::Export) => score += EXPORT_MODIFIER,
            _ => {}
        }
        if event.actor.actor_type == ActorType::Ai {
            score += AI_ACTOR_MODIFIER;
        }
        if sensitive {
            score += SENSITIVE_MODIFIER;
        }
        score += (event.change_count() as u32 * PER_CHANGE_MODIFIER).min(MAX_CHANGE_MODIFIER);

        let risk_score = score.min(100) as u8;

        Ok(Classification {
            category,
            severity: Severity::from_risk_score(risk_score),
            risk_score,
            compliance_tags: self.compliance_tags(event, category, sensitive),
            operation_type,
        })
    }

    fn compliance_tags(&self, event: &AuditEvent, category: AuditCategory, sensitive: bool) -> Vec<String> {
        let mut tags = BTreeSet::new();
        match category {
            AuditCategory::Authentication | AuditCategory::Authorization | AuditCategory::Security => {
                tags.insert("SOC2");
            }
            AuditCategory::Compliance => {
                tags.insert("AUDIT");
            }
            AuditCategory::AiAction => {
                tags.insert("AI_GOVERNANCE");
            }
            _ => {}
        }
        if sensitive {
            tags.insert("GDPR");
        }
        if self.changed_fields(event).any(|f| self.financial_fields.contains(&f)) {
            tags.insert("SOX");
        }
        if let Some(entity) = &event.entity {
            match entity.entity_type.to_lowercase().as_str() {
                "payment" | "invoice" | "card" => {
                    tags.insert("PCI");
                }
                "medical_record" | "patient" => {
                    tags.insert("HIPAA");
                }
                _ => {}
            }
        }
        tags.into_iter().map(String::from).collect()
    }

    fn changed_fields<'a>(&self, event: &'a AuditEvent) -> impl Iterator<Item = String> + 'a {
        event
            .changes
            .iter()
            .flatten()
            .map(|c| c.field.to_lowercase())
    }
}

fn base_score(category: AuditCategory) -> u32 {
    match category {
        AuditCategory::Security => 60,
        AuditCategory::Compliance => 50,
        AuditCategory::Authorization => 40,
        AuditCategory::AiAction => 30,
        AuditCategory::Authentication => 30,
        AuditCategory::DataAccess => 25,
        AuditCategory::DataModification => 20,
        AuditCategory::System => 10,
        AuditCategory::Operational => 10,
    }
}

/// Split `auth.login_failed`, `TaskCreated` or `data-export` into lowercase words.
fn tokenize(event_type: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for part in event_type.split(|c: char| matches!(c, '.' | '_' | '-' | ':' | ' ')) {
        let mut current = String::new();
        let mut prev_lower = false;
        for ch in part.chars() {
            if ch.is_uppercase() && prev_lower && !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
            current.extend(ch.to_lowercase());
        }
        if !current.is_empty() {
            tokens.push(current);
        }
    }
    tokens
}

fn operation_of(tokens: &[String]) -> Option<OperationType> {
    tokens.iter().rev().find_map(|t| {
        Some(match t.as_str() {
            "create" | "created" | "add" | "added" | "insert" | "register" | "registered" => {
                OperationType::Create
            }
            "read" | "view" | "viewed" | "get" | "list" | "listed" | "access" | "accessed"
            | "search" => OperationType::Read,
            "update" | "updated" | "change" | "changed" | "amend" | "amended" | "assign"
            | "assigned" | "modify" | "modified" => OperationType::Update,
            "delete" | "deleted" | "remove" | "removed" | "purge" | "purged" => OperationType::Delete,
            "export" | "exported" | "download" | "downloaded" => OperationType::Export,
            "login" | "signin" => OperationType::Login,
            "logout" | "signout" => OperationType::Logout,
            "execute" | "executed" | "run" | "invoke" | "invoked" => OperationType::Execute,
            _ => return None,
        })
    })
}

fn category_of(tokens: &[String], operation: Option<OperationType>, actor: ActorType) -> AuditCategory {
    match tokens[0].as_str() {
        "auth" | "authentication" | "login" | "logout" | "session" | "mfa" => {
            AuditCategory::Authentication
        }
        "permission" | "role" | "access" | "authorization" | "rbac" => AuditCategory::Authorization,
        "security" | "threat" | "breach" | "intrusion" => AuditCategory::Security,
        "compliance" | "gdpr" | "retention" | "consent" | "audit" => AuditCategory::Compliance,
        "ai" | "agent" | "llm" | "model" => AuditCategory::AiAction,
        "system" | "config" | "scheduler" | "cron" | "job" => AuditCategory::System,
        "data" => match operation {
            Some(OperationType::Read | OperationType::Export) => AuditCategory::DataAccess,
            _ => AuditCategory::DataModification,
        },
        _ => match operation {
            _ if actor == ActorType::Ai => AuditCategory::AiAction,
            Some(OperationType::Login | OperationType::Logout) => AuditCategory::Authentication,
            Some(OperationType::Read | OperationType::Export) => AuditCategory::DataAccess,
            Some(OperationType::Create | OperationType::Update | OperationType::Delete) => {
                AuditCategory::DataModification
            }
            _ => AuditCategory::Operational,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{Actor, Change, EntityRef};
    use serde_json::json;

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("TaskCreated"), vec!["task", "created"]);
        assert_eq!(tokenize("auth.login_failed"), vec!["auth", "login", "failed"]);
        assert_eq!(tokenize("data-export"), vec!["data", "export"]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn test_auth_failure_is_high() {
        let engine = AuditClassificationEngine::new();
        let event = AuditEvent::new("bp", "auth.login", Actor::user("u1"))
            .with_metadata_entry("result", json!("failure"));

        let c = engine.classify(&event).unwrap();
        assert_eq!(c.category, AuditCategory::Authentication);
        assert_eq!(c.operation_type, Some(OperationType::Login));
        assert_eq!(c.risk_score, 55);
        assert_eq!(c.severity, Severity::High);
        assert_eq!(c.compliance_tags, vec!["SOC2"]);
    }

    #[test]
    fn test_domain_events_fall_back_to_verb() {
        let engine = AuditClassificationEngine::new();
        let event = AuditEvent::new("bp", "TaskUpdated", Actor::user("u1"))
            .with_entity(EntityRef::new("task", "t1"));

        let c = engine.classify(&event).unwrap();
        assert_eq!(c.category, AuditCategory::DataModification);
        assert_eq!(c.severity, Severity::Low);
        assert!(c.compliance_tags.is_empty());
    }

    #[test]
    fn test_sensitive_export_tags_and_score() {
        let engine = AuditClassificationEngine::new();
        let event = AuditEvent::new("bp", "data.export", Actor::user("u1"))
            .with_entity(EntityRef::new("customer", "c9"));

        let c = engine.classify(&event).unwrap();
        assert_eq!(c.category, AuditCategory::DataAccess);
        assert_eq!(c.risk_score, 25 + 20 + 15);
        assert!(c.compliance_tags.contains(&"GDPR".to_string()));
    }

    #[test]
    fn test_explicit_operation_type_wins_over_verb() {
        let engine = AuditClassificationEngine::new();
        let mut event = AuditEvent::new("bp", "customer.shared", Actor::user("u1"))
            .with_entity(EntityRef::new("customer", "c9"));
        assert_eq!(engine.classify(&event).unwrap().operation_type, None);

        event.operation_type = Some(OperationType::Export);
        let c = engine.classify(&event).unwrap();
        assert_eq!(c.operation_type, Some(OperationType::Export));
        assert_eq!(c.category, AuditCategory::DataAccess);
        assert_eq!(c.risk_score, 25 + 20 + 15);
    }

    #[test]
    fn test_score_is_clamped() {
        let engine = AuditClassificationEngine::new();
        let changes = (0..20)
            .map(|i| Change {
                field: format!("salary_{}", i),
                old_value: json!(1),
                new_value: json!(2),
            })
            .collect();
        let event = AuditEvent::new("bp", "security.records_deleted", Actor::ai("agent:x"))
            .with_entity(EntityRef::new("employee", "e1"))
            .with_changes(changes)
            .with_metadata_entry("result", json!("failed"));

        let c = engine.classify(&event).unwrap();
        assert_eq!(c.risk_score, 100);
        assert_eq!(c.severity, Severity::Critical);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let engine = AuditClassificationEngine::new();
        let event = AuditEvent::new("bp", "ContractAmended", Actor::user("u1"))
            .with_entity(EntityRef::new("contract", "c1"))
            .with_changes(vec![Change {
                field: "value".into(),
                old_value: json!(10),
                new_value: json!(12),
            }]);
        assert_eq!(engine.classify(&event).unwrap(), engine.classify(&event).unwrap());
        assert_eq!(
            engine.classify(&event).unwrap().compliance_tags,
            vec!["GDPR", "SOX"]
        );
    }

    #[test]
    fn test_empty_type_is_rejected() {
        let engine = AuditClassificationEngine::new();
        let event = AuditEvent::new("bp", "..", Actor::user("u1"));
        assert!(engine.classify(&event).is_err());
    }

    #[test]
    fn test_apply_sets_storage_tier() {
        let engine = AuditClassificationEngine::new();
        let mut event = AuditEvent::new("bp", "security.alert", Actor::system("ids"));
        engine.classify(&event).unwrap().apply_to(&mut event);
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.storage_tier, StorageTier::Hot);
    }
}
