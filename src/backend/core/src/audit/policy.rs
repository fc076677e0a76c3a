//! First-match policy engine for classified audit events.
//!
//! Rules are evaluated in order and the first whose condition matches decides
//! the outcome. When no rule matches the event is allowed under the
//! `default-allow` rule.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ChronicleError, ErrorCode, Result};

use super::event::{ActorType, AuditCategory, AuditEvent, OperationType};

/// Name reported when no rule matched.
pub const DEFAULT_ALLOW: &str = "default-allow";

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// What to do with an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    /// Persist normally
    Allow,
    /// Drop without persisting
    Suppress,
    /// Persist and mark for review
    Flag,
    /// Persist and raise to a human
    Escalate,
}

/// Result of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub rule: String,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PolicyDecision {
    pub fn allow_default() -> Self {
        Self {
            action: PolicyAction::Allow,
            rule: DEFAULT_ALLOW.to_string(),
            reasons: Vec::new(),
            notify: false,
            tags: Vec::new(),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.action == PolicyAction::Suppress
    }

    /// Whether this decision should produce a notification.
    pub fn should_notify(&self) -> bool {
        self.notify && matches!(self.action, PolicyAction::Escalate | PolicyAction::Flag)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rules
// ═══════════════════════════════════════════════════════════════════════════════

type Condition = Arc<dyn Fn(&AuditEvent) -> bool + Send + Sync>;

/// A named condition and the decision it produces.
#[derive(Clone)]
pub struct PolicyRule {
    pub name: String,
    pub reason: String,
    pub action: PolicyAction,
    pub notify: bool,
    pub tags: Vec<String>,
    condition: Condition,
}

impl fmt::Debug for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRule")
            .field("name", &self.name)
            .field("action", &self.action)
            .field("notify", &self.notify)
            .finish()
    }
}

impl PolicyRule {
    pub fn new<F>(name: impl Into<String>, action: PolicyAction, condition: F) -> Self
    where
        F: Fn(&AuditEvent) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            reason: name.clone(),
            name,
            action,
            notify: false,
            tags: Vec::new(),
            condition: Arc::new(condition),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn notifying(mut self) -> Self {
        self.notify = true;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        (self.condition)(event)
    }

    fn decision(&self) -> PolicyDecision {
        PolicyDecision {
            action: self.action,
            rule: self.name.clone(),
            reasons: vec![self.reason.clone()],
            notify: self.notify,
            tags: self.tags.clone(),
        }
    }
}

/// The shipped rule set, in evaluation order.
pub fn default_rules() -> Vec<PolicyRule> {
    const SENSITIVE_TAGS: [&str; 3] = ["GDPR", "PCI", "HIPAA"];

    vec![
        PolicyRule::new("Security High Severity", PolicyAction::Escalate, |e| {
            e.category == AuditCategory::Security && e.severity.is_high_or_critical()
        })
        .with_reason("High or critical severity security event")
        .with_tag("security")
        .notifying(),
        PolicyRule::new("Auth Failure", PolicyAction::Escalate, |e| {
            e.category == AuditCategory::Authentication && e.is_failure()
        })
        .with_reason("Authentication failure")
        .with_tag("auth")
        .notifying(),
        PolicyRule::new("Sensitive Data Access", PolicyAction::Escalate, |e| {
            matches!(e.operation_type, Some(OperationType::Read | OperationType::Export))
                && e.compliance_tags
                    .iter()
                    .any(|t| SENSITIVE_TAGS.contains(&t.as_str()))
        })
        .with_reason("Read or export of sensitive data")
        .with_tag("privacy")
        .notifying(),
        PolicyRule::new("Noisy Reads", PolicyAction::Suppress, |e| {
            e.operation_type == Some(OperationType::Read) && !e.severity.is_high_or_critical()
                && e.category != AuditCategory::Compliance
        })
        .with_reason("Low-signal read"),
        PolicyRule::new("AI Actions", PolicyAction::Flag, |e| {
            e.ai_generated || e.actor.actor_type == ActorType::Ai
        })
        .with_reason("Action performed by an AI actor")
        .with_tag("ai"),
        PolicyRule::new("Compliance Events", PolicyAction::Escalate, |e| {
            e.category == AuditCategory::Compliance
        })
        .with_reason("Compliance-relevant event")
        .with_tag("compliance")
        .notifying(),
    ]
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered rule list with first-match evaluation.
#[derive(Debug)]
pub struct AuditPolicyEngine {
    rules: RwLock<Vec<PolicyRule>>,
}

impl Default for AuditPolicyEngine {
    fn default() -> Self {
        Self::with_rules(default_rules())
    }
}

impl AuditPolicyEngine {
    /// Engine with the default rule set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self::with_rules(Vec::new())
    }

    pub fn with_rules(rules: Vec<PolicyRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Decide on an event using the first matching rule.
    pub fn evaluate(&self, event: &AuditEvent) -> PolicyDecision {
        let rules = self.rules.read();
        match rules.iter().find(|r| r.matches(event)) {
            Some(rule) => {
                debug!(
                    rule = %rule.name,
                    action = ?rule.action,
                    event_type = %event.event_type,
                    "Policy rule matched"
                );
                rule.decision()
            }
            None => PolicyDecision::allow_default(),
        }
    }

    /// Append a rule at the lowest priority.
    pub fn add_rule(&self, rule: PolicyRule) {
        self.rules.write().push(rule);
    }

    /// Insert a rule at `index` (0 = highest priority).
    pub fn insert_rule(&self, index: usize, rule: PolicyRule) -> Result<()> {
        let mut rules = self.rules.write();
        if index > rules.len() {
            return Err(ChronicleError::new(
                ErrorCode::InvalidArgument,
                format!("Rule index {} out of range (0..={})", index, rules.len()),
            ));
        }
        rules.insert(index, rule);
        Ok(())
    }

    /// Remove every rule named `name`. Returns false if none existed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        let removed = rules.len() != before;
        if !removed {
            warn!(rule = %name, "Attempted to remove unknown policy rule");
        }
        removed
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.read().iter().map(|r| r.name.clone()).collect()
    }
}
