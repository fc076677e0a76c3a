//! Validation of proposed facts against evidence, location and governance rules.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChronicleError, Result};
use crate::events::aggregate::ContractStatus;

use super::model::{Evidence, EvidenceKind, FactEvent, GovernanceRule, TargetStatus};

/// Runtime facts the governance check needs beyond the candidate itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationContext {
    /// Approvers who have signed off on the candidate.
    #[serde(default)]
    pub approvals: Vec<String>,

    /// Current status of the candidate's contract, when known.
    #[serde(default)]
    pub contract_status: Option<ContractStatus>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approved_by(mut self, approver: impl Into<String>) -> Self {
        self.approvals.push(approver.into());
        self
    }

    pub fn with_contract_status(mut self, status: ContractStatus) -> Self {
        self.contract_status = Some(status);
        self
    }
}

/// Rules whose scope covers the candidate, in rule order.
pub fn matching_rules<'a>(
    candidate: &FactEvent,
    rules: &'a [GovernanceRule],
) -> Vec<&'a GovernanceRule> {
    rules
        .iter()
        .filter(|r| {
            r.scope
                .matches(candidate.contract_id.as_deref(), candidate.location())
        })
        .collect()
}

/// Check a candidate fact against governance rules.
///
/// A candidate bound to a contract with no matching rule is denied. Each
/// matched rule is checked in order for outstanding approvals and for a
/// contract status that forbids new facts; the first failure is returned as a
/// `PolicyViolation` carrying the rule id.
pub fn validate_event_creation(
    candidate: &FactEvent,
    rules: &[GovernanceRule],
    context: &ValidationContext,
) -> Result<()> {
    let matched = matching_rules(candidate, rules);

    if matched.is_empty() {
        if let Some(contract_id) = &candidate.contract_id {
            return Err(ChronicleError::policy_violation(
                "default-deny",
                format!("no active governance rules for contract {}", contract_id),
            ));
        }
        return Ok(());
    }

    for rule in matched {
        if rule.rules.approval_required {
            let missing: Vec<&String> = rule
                .rules
                .approvers
                .iter()
                .filter(|a| !context.approvals.contains(a))
                .collect();
            let approved = if rule.rules.approvers.is_empty() {
                !context.approvals.is_empty()
            } else {
                missing.is_empty()
            };

            if !approved {
                let reason = if missing.is_empty() {
                    format!("Rule {} requires approval before recording", rule.id)
                } else {
                    format!(
                        "Rule {} requires approval from: {}",
                        rule.id,
                        missing
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                };
                return Err(ChronicleError::policy_violation(&rule.id, reason)
                    .with_context("missing_approvals", &missing));
            }
        }

        if let Some(status) = context.contract_status {
            if !status.accepts_events() {
                return Err(ChronicleError::policy_violation(
                    &rule.id,
                    format!("Contract is {:?}; no new facts may be recorded", status),
                )
                .with_context("contract_status", status));
            }
        }

        debug!(rule_id = %rule.id, fact_id = %candidate.id, "Governance rule satisfied");
    }

    Ok(())
}

/// Check the evidence list of a candidate fact.
pub fn validate_evidence(evidence: &[Evidence]) -> Result<()> {
    if evidence.is_empty() {
        return Err(ChronicleError::field(
            "evidence",
            "At least one piece of evidence is required",
        ));
    }

    for (i, item) in evidence.iter().enumerate() {
        if item.timestamp.is_none() {
            return Err(ChronicleError::field(
                format!("evidence[{}].timestamp", i),
                format!("Evidence #{} is missing a timestamp", i + 1),
            ));
        }
        match item.kind {
            EvidenceKind::Photo if is_blank(&item.url) => {
                return Err(ChronicleError::field(
                    format!("evidence[{}].url", i),
                    format!("Photo evidence #{} is missing its URL", i + 1),
                ));
            }
            EvidenceKind::Signature if is_blank(&item.signer) => {
                return Err(ChronicleError::field(
                    format!("evidence[{}].signer", i),
                    format!("Signature evidence #{} is missing signer data", i + 1),
                ));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Check the candidate's target location.
pub fn validate_location(candidate: &FactEvent) -> Result<()> {
    let target = candidate
        .target
        .as_ref()
        .ok_or_else(|| ChronicleError::field("target", "A target location is required"))?;

    if target.location.trim().is_empty() {
        return Err(ChronicleError::field("target.location", "Target location is empty"));
    }

    match target.status {
        TargetStatus::Confirmed if target.coordinates.is_none() => Err(ChronicleError::field(
            "target.coordinates",
            "Confirmed targets require coordinates",
        )),
        TargetStatus::Provisional if is_blank(&target.description) => Err(ChronicleError::field(
            "target.description",
            "Provisional targets require a description",
        )),
        _ => Ok(()),
    }
}

/// Evidence, location, then governance checks.
pub fn validate_fact(
    candidate: &FactEvent,
    rules: &[GovernanceRule],
    context: &ValidationContext,
) -> Result<()> {
    validate_evidence(&candidate.evidence)?;
    validate_location(candidate)?;
    validate_event_creation(candidate, rules, context)
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
