//! Three-layer governance data model.
//!
//! - **L0** [`GovernanceRule`]: mutable policy, the only layer with update/delete.
//! - **L1** [`FactEvent`]: append-only facts; mistakes are fixed by a new
//!   fact carrying a `corrects` back-reference.
//! - **L2** [`DerivedState`]: recomputable views over facts, marked stale
//!   instead of deleted when their inputs change.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ChronicleError, ErrorDetails, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// L0: Governance Rules
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a rule applies. An empty list matches everything on that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleScope {
    #[serde(default)]
    pub contracts: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
}

impl RuleScope {
    /// Whether a fact for `contract_id` at `location` falls under this scope.
    pub fn matches(&self, contract_id: Option<&str>, location: Option<&str>) -> bool {
        fn dimension(list: &[String], value: Option<&str>) -> bool {
            list.is_empty() || value.map_or(false, |v| list.iter().any(|item| item == v))
        }
        dimension(&self.contracts, contract_id) && dimension(&self.locations, location)
    }
}

/// What a rule requires before a fact may be recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRequirements {
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub approvers: Vec<String>,
}

/// A mutable L0 governance rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceRule {
    pub id: String,
    pub scope: RuleScope,
    pub rules: RuleRequirements,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub timestamp: DateTime<Utc>,
}

impl GovernanceRule {
    pub fn new(id: impl Into<String>, rule_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scope: RuleScope::default(),
            rules: RuleRequirements::default(),
            rule_type: rule_type.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_contracts<I, S>(mut self, contracts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.contracts = contracts.into_iter().map(Into::into).collect();
        self
    }

    pub fn for_locations<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.locations = locations.into_iter().map(Into::into).collect();
        self
    }

    pub fn requiring_approval<I, S>(mut self, approvers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.approval_required = true;
        self.rules.approvers = approvers.into_iter().map(Into::into).collect();
        self
    }
}

/// Store for L0 rules. Preserves insertion order.
#[derive(Debug, Default)]
pub struct GovernanceRuleRepository {
    rules: RwLock<Vec<GovernanceRule>>,
}

impl GovernanceRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, rule: GovernanceRule) -> Result<GovernanceRule> {
        if rule.id.trim().is_empty() {
            return Err(ChronicleError::field("id", "Governance rule id is required"));
        }
        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(ChronicleError::validation(format!(
                "Governance rule {} already exists",
                rule.id
            ))
            .with_details(ErrorDetails::new().with_rule(&rule.id)));
        }
        info!(rule_id = %rule.id, rule_type = %rule.rule_type, "Governance rule created");
        rules.push(rule.clone());
        Ok(rule)
    }

    /// Replace a rule. The stored id is kept regardless of `rule.id`.
    pub fn update(&self, id: &str, mut rule: GovernanceRule) -> Result<GovernanceRule> {
        let mut rules = self.rules.write();
        let slot = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ChronicleError::not_found("governance_rule", id))?;
        rule.id = id.to_string();
        *slot = rule.clone();
        info!(rule_id = %id, "Governance rule updated");
        Ok(rule)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        if rules.len() == before {
            return Err(ChronicleError::not_found("governance_rule", id));
        }
        info!(rule_id = %id, "Governance rule deleted");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<GovernanceRule> {
        self.rules.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn list(&self) -> Vec<GovernanceRule> {
        self.rules.read().clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// L1: Fact Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of supporting evidence attached to a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceKind {
    Photo,
    Signature,
    Document,
    Measurement,
    Note,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    #[serde(rename = "type")]
    pub kind: EvidenceKind,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
}

impl Evidence {
    pub fn photo(url: impl Into<String>) -> Self {
        Self {
            kind: EvidenceKind::Photo,
            timestamp: Some(Utc::now()),
            url: Some(url.into()),
            signer: None,
        }
    }

    pub fn signature(signer: impl Into<String>) -> Self {
        Self {
            kind: EvidenceKind::Signature,
            timestamp: Some(Utc::now()),
            url: None,
            signer: Some(signer.into()),
        }
    }
}

/// How certain the fact's location is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Confirmed,
    Provisional,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// The place a fact is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub location: String,
    pub status: TargetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Target {
    pub fn confirmed(location: impl Into<String>, coordinates: Coordinates) -> Self {
        Self {
            location: location.into(),
            status: TargetStatus::Confirmed,
            coordinates: Some(coordinates),
            description: None,
        }
    }

    pub fn provisional(location: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            status: TargetStatus::Provisional,
            coordinates: None,
            description: Some(description.into()),
        }
    }
}

/// An append-only L1 fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub fact_type: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub target: Option<Target>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    pub contract_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrects: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction_reason: Option<String>,
}

impl FactEvent {
    /// A new fact with a generated id.
    pub fn new(fact_type: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            fact_type: fact_type.into(),
            timestamp: Utc::now(),
            actor: actor.into(),
            target: None,
            evidence: Vec::new(),
            contract_id: None,
            corrects: None,
            correction_reason: None,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }

    pub fn with_contract(mut self, contract_id: impl Into<String>) -> Self {
        self.contract_id = Some(contract_id.into());
        self
    }

    /// Mark this fact as a correction of `original_id`.
    pub fn correcting(mut self, original_id: impl Into<String>, reason: impl Into<String>) -> Self {
        self.corrects = Some(original_id.into());
        self.correction_reason = Some(reason.into());
        self
    }

    pub fn is_correction(&self) -> bool {
        self.corrects.is_some()
    }

    pub fn location(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.location.as_str())
    }
}

#[derive(Debug, Default)]
struct FactLog {
    facts: Vec<FactEvent>,
    by_id: HashMap<String, usize>,
}

/// Append-only store for L1 facts.
#[derive(Debug, Default)]
pub struct FactEventRepository {
    log: RwLock<FactLog>,
}

impl FactEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fact. Corrections must target an existing fact and may not
    /// form a cycle.
    pub fn create(&self, fact: FactEvent) -> Result<FactEvent> {
        if fact.id.trim().is_empty() {
            return Err(ChronicleError::field("id", "Fact id is required"));
        }

        let mut log = self.log.write();
        if log.by_id.contains_key(&fact.id) {
            return Err(ChronicleError::validation(format!(
                "Fact {} already exists",
                fact.id
            ))
            .with_details(ErrorDetails::new().with_entity("fact_event", &fact.id)));
        }

        if let Some(target) = &fact.corrects {
            Self::check_correction(&log, &fact.id, target)?;
        }

        debug!(
            fact_id = %fact.id,
            fact_type = %fact.fact_type,
            corrects = ?fact.corrects,
            "Fact recorded"
        );
        let index = log.facts.len();
        log.by_id.insert(fact.id.clone(), index);
        log.facts.push(fact.clone());
        Ok(fact)
    }

    fn check_correction(log: &FactLog, new_id: &str, target: &str) -> Result<()> {
        let cycle = || {
            ChronicleError::field(
                "corrects",
                format!("Correction {} would form a cycle via {}", new_id, target),
            )
        };
        if target == new_id {
            return Err(cycle());
        }

        let Some(&index) = log.by_id.get(target) else {
            return Err(ChronicleError::field(
                "corrects",
                format!("Corrected fact {} does not exist", target),
            ));
        };

        // Walk the target's own correction chain.
        let mut seen = HashSet::new();
        let mut cursor = log.facts[index].corrects.as_deref();
        while let Some(id) = cursor {
            if id == new_id || !seen.insert(id) {
                return Err(cycle());
            }
            cursor = log
                .by_id
                .get(id)
                .and_then(|&i| log.facts[i].corrects.as_deref());
        }
        Ok(())
    }

    /// Always fails: facts are append-only.
    pub fn update(&self, id: &str, _fact: FactEvent) -> Result<FactEvent> {
        warn!(fact_id = %id, "Rejected update of append-only fact");
        Err(ChronicleError::immutable("fact_event", id))
    }

    /// Always fails: facts are append-only.
    pub fn delete(&self, id: &str) -> Result<()> {
        warn!(fact_id = %id, "Rejected delete of append-only fact");
        Err(ChronicleError::immutable("fact_event", id))
    }

    pub fn get(&self, id: &str) -> Option<FactEvent> {
        let log = self.log.read();
        log.by_id.get(id).map(|&i| log.facts[i].clone())
    }

    /// All facts in append order.
    pub fn list(&self) -> Vec<FactEvent> {
        self.log.read().facts.clone()
    }

    pub fn len(&self) -> usize {
        self.log.read().facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direct corrections of `id`, oldest first.
    pub fn corrections_of(&self, id: &str) -> Vec<FactEvent> {
        self.log
            .read()
            .facts
            .iter()
            .filter(|f| f.corrects.as_deref() == Some(id))
            .cloned()
            .collect()
    }

    /// Follow the newest correction repeatedly to the current version of a fact.
    pub fn latest_version_of(&self, id: &str) -> Option<FactEvent> {
        let log = self.log.read();
        let mut current = log.by_id.get(id).map(|&i| &log.facts[i])?;
        while let Some(next) = log
            .facts
            .iter()
            .rev()
            .find(|f| f.corrects.as_deref() == Some(current.id.as_str()))
        {
            current = next;
        }
        Some(current.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// L2: Derived State
// ═══════════════════════════════════════════════════════════════════════════════

/// A recomputable view over facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedState {
    #[serde(rename = "type")]
    pub state_type: String,
    pub data: serde_json::Value,
    pub calculated_at: DateTime<Utc>,
    pub stale: bool,
    pub source_events: Vec<String>,
}

/// Store for L2 derived state, keyed by state type.
///
/// There is no direct update: state changes only via `recompute`.
#[derive(Debug, Default)]
pub struct DerivedStateRepository {
    states: DashMap<String, DerivedState>,
}

impl DerivedStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute and store a fresh state from `sources`.
    pub fn recompute<F>(&self, state_type: &str, sources: &[FactEvent], calculate: F) -> DerivedState
    where
        F: FnOnce(&[FactEvent]) -> serde_json::Value,
    {
        let state = DerivedState {
            state_type: state_type.to_string(),
            data: calculate(sources),
            calculated_at: Utc::now(),
            stale: false,
            source_events: sources.iter().map(|f| f.id.clone()).collect(),
        };
        debug!(state_type, sources = sources.len(), "Derived state recomputed");
        self.states.insert(state_type.to_string(), state.clone());
        state
    }

    pub fn get(&self, state_type: &str) -> Option<DerivedState> {
        self.states.get(state_type).map(|s| s.clone())
    }

    /// Mark every state computed from `fact_id` as stale. Returns how many changed.
    pub fn mark_stale_for(&self, fact_id: &str) -> usize {
        let mut marked = 0;
        for mut entry in self.states.iter_mut() {
            if !entry.stale && entry.source_events.iter().any(|id| id == fact_id) {
                entry.stale = true;
                marked += 1;
            }
        }
        marked
    }

}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn fact(id: &str) -> FactEvent {
        let mut f = FactEvent::new("inspection", "inspector-1")
            .with_target(Target::provisional("north-gate", "east side"))
            .with_evidence(Evidence::photo("https://files/1.jpg"));
        f.id = id.to_string();
        f
    }

    #[test]
    fn test_scope_matching() {
        let scope = RuleScope {
            contracts: vec!["c1".into()],
            locations: vec![],
        };
        assert!(scope.matches(Some("c1"), Some("anywhere")));
        assert!(scope.matches(Some("c1"), None));
        assert!(!scope.matches(Some("c2"), None));
        assert!(!scope.matches(None, None));
        assert!(RuleScope::default().matches(None, None));
    }

    #[test]
    fn test_rule_crud() {
        let repo = GovernanceRuleRepository::new();
        repo.create(GovernanceRule::new("r1", "approval")).unwrap();
        assert!(repo.create(GovernanceRule::new("r1", "approval")).is_err());

        let updated = repo
            .update("r1", GovernanceRule::new("ignored", "approval").requiring_approval(["pm"]))
            .unwrap();
        assert_eq!(updated.id, "r1");
        assert!(repo.get("r1").unwrap().rules.approval_required);

        repo.delete("r1").unwrap();
        assert!(repo.list().is_empty());
        assert_eq!(repo.delete("r1").unwrap_err().code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_fact_update_and_delete_are_rejected() {
        let repo = FactEventRepository::new();
        repo.create(fact("f1")).unwrap();
        let before = serde_json::to_string(&repo.get("f1").unwrap()).unwrap();

        let mut changed = fact("f1");
        changed.actor = "someone-else".into();
        let err = repo.update("f1", changed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ImmutabilityViolation);
        assert_eq!(
            repo.delete("f1").unwrap_err().code(),
            ErrorCode::ImmutabilityViolation
        );
        // Unknown ids are rejected the same way.
        assert_eq!(
            repo.update("nope", fact("nope")).unwrap_err().code(),
            ErrorCode::ImmutabilityViolation
        );

        let after = serde_json::to_string(&repo.get("f1").unwrap()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_correction_chain() {
        let repo = FactEventRepository::new();
        repo.create(fact("f1")).unwrap();
        repo.create(fact("f2").correcting("f1", "wrong gate")).unwrap();
        repo.create(fact("f3").correcting("f2", "still wrong")).unwrap();

        assert_eq!(repo.corrections_of("f1").len(), 1);
        assert_eq!(repo.latest_version_of("f1").unwrap().id, "f3");
        assert_eq!(repo.get("f1").unwrap().corrects, None);
        assert!(repo.latest_version_of("missing").is_none());
    }

    #[test]
    fn test_invalid_corrections_rejected() {
        let repo = FactEventRepository::new();
        repo.create(fact("f1")).unwrap();

        let err = repo.create(fact("f2").correcting("f2", "self")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(err.details().field.as_deref(), Some("corrects"));

        let err = repo.create(fact("f3").correcting("ghost", "missing")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_derived_state_marked_stale() {
        let facts = FactEventRepository::new();
        facts.create(fact("f1")).unwrap();
        facts.create(fact("f2")).unwrap();

        let derived = DerivedStateRepository::new();
        let state = derived.recompute("inspection_count", &facts.list(), |fs| json!({"count": fs.len()}));
        assert_eq!(state.data["count"], 2);
        assert!(!state.stale);

        assert_eq!(derived.mark_stale_for("f2"), 1);
        assert!(derived.get("inspection_count").unwrap().stale);
        assert_eq!(derived.mark_stale_for("unrelated"), 0);

        let fresh = derived.recompute("inspection_count", &facts.list(), |fs| json!({"count": fs.len()}));
        assert!(!fresh.stale);
    }
}
