//! Two-tier event identifiers of the form `tenant.context.aggregate#sequence`.
//!
//! The namespace roots a monotonic per-namespace counter held by
//! [`EventIdGenerator`]. Identifiers compare by their full textual reference.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ChronicleError, ErrorCode, ErrorDetails, Result};

fn component_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"))
}

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)#(\d+)$").expect("static regex"))
}

// =============================================================================
// Namespace
// =============================================================================

/// A hierarchical `tenant.context.aggregate` path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub tenant: String,
    pub context: String,
    pub aggregate: String,
}

impl Namespace {
    /// Build a namespace, validating each component.
    pub fn new(
        tenant: impl Into<String>,
        context: impl Into<String>,
        aggregate: impl Into<String>,
    ) -> Result<Self> {
        let ns = Self {
            tenant: tenant.into(),
            context: context.into(),
            aggregate: aggregate.into(),
        };
        for component in [&ns.tenant, &ns.context, &ns.aggregate] {
            if !component_regex().is_match(component) {
                return Err(ChronicleError::new(
                    ErrorCode::InvalidNamespace,
                    format!("Invalid namespace component: {:?}", component),
                ));
            }
        }
        Ok(ns)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.tenant, self.context, self.aggregate)
    }
}

/// Parse a `tenant.context.aggregate` string.
///
/// Returns `None` unless there are exactly three dot-separated components,
/// each matching `[A-Za-z0-9_-]+`.
pub fn parse_namespace(s: &str) -> Option<Namespace> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 3 || !parts.iter().all(|p| component_regex().is_match(p)) {
        return None;
    }
    Some(Namespace {
        tenant: parts[0].to_string(),
        context: parts[1].to_string(),
        aggregate: parts[2].to_string(),
    })
}

// =============================================================================
// EventIdentifier
// =============================================================================

/// A parsed `namespace#sequence` identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventIdentifier {
    namespace: Namespace,
    sequence: u64,
    full_reference: String,
}

impl EventIdentifier {
    /// Create an identifier from a namespace and a positive sequence.
    pub fn new(namespace: Namespace, sequence: u64) -> Result<Self> {
        if sequence == 0 {
            return Err(ChronicleError::new(
                ErrorCode::InvalidArgument,
                "Event sequence must be positive",
            ));
        }
        let full_reference = format!("{}#{}", namespace, sequence);
        Ok(Self {
            namespace,
            sequence,
            full_reference,
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn full_reference(&self) -> &str {
        &self.full_reference
    }
}

impl PartialEq for EventIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.full_reference == other.full_reference
    }
}

impl Eq for EventIdentifier {}

impl std::hash::Hash for EventIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full_reference.hash(state);
    }
}

impl fmt::Display for EventIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_reference)
    }
}

impl FromStr for EventIdentifier {
    type Err = ChronicleError;

    fn from_str(s: &str) -> Result<Self> {
        parse_event_id(s)
    }
}

impl TryFrom<String> for EventIdentifier {
    type Error = ChronicleError;

    fn try_from(s: String) -> Result<Self> {
        parse_event_id(&s)
    }
}

impl From<EventIdentifier> for String {
    fn from(id: EventIdentifier) -> Self {
        id.full_reference
    }
}

/// Parse a `namespace#sequence` reference.
///
/// Fails with `InvalidFormat` when the text does not match `^(.+)#(\d+)$` or
/// the sequence is zero or out of range, and with `InvalidNamespace` when the
/// prefix is not a valid namespace.
pub fn parse_event_id(s: &str) -> Result<EventIdentifier> {
    let invalid_format = || {
        ChronicleError::new(
            ErrorCode::InvalidFormat,
            format!("Event id {:?} does not match namespace#sequence", s),
        )
    };

    let captures = reference_regex().captures(s).ok_or_else(invalid_format)?;
    let prefix = &captures[1];
    let sequence: u64 = captures[2].parse().map_err(|_| invalid_format())?;
    if sequence == 0 {
        return Err(invalid_format());
    }

    let namespace = parse_namespace(prefix).ok_or_else(|| {
        ChronicleError::new(
            ErrorCode::InvalidNamespace,
            format!("Invalid namespace {:?}", prefix),
        )
        .with_details(ErrorDetails::new().with_field("namespace"))
    })?;

    EventIdentifier::new(namespace, sequence)
}

// =============================================================================
// Generator
// =============================================================================

/// Per-namespace monotonic sequence counters.
#[derive(Debug, Default)]
pub struct EventIdGenerator {
    counters: Mutex<HashMap<String, u64>>,
}

impl EventIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate an identifier under `tenant.context.aggregate`.
    ///
    /// Without an explicit `sequence` the namespace counter is incremented
    /// (the first value is 1). An explicit sequence raises the counter to at
    /// least that value so later generated ids keep increasing.
    pub fn generate_event_id(
        &self,
        tenant: &str,
        context: &str,
        aggregate: &str,
        sequence: Option<u64>,
    ) -> Result<EventIdentifier> {
        let namespace = Namespace::new(tenant, context, aggregate)?;
        let key = namespace.to_string();

        let sequence = {
            let mut counters = self.counters.lock();
            let counter = counters.entry(key).or_insert(0);
            match sequence {
                Some(explicit) => {
                    *counter = (*counter).max(explicit);
                    explicit
                }
                None => {
                    *counter += 1;
                    *counter
                }
            }
        };

        EventIdentifier::new(namespace, sequence)
    }

    /// Reset a namespace counter. The next generated sequence is `n + 1`.
    pub fn set_sequence(&self, namespace: &str, n: i64) -> Result<()> {
        if n < 0 {
            return Err(ChronicleError::new(
                ErrorCode::InvalidArgument,
                format!("Sequence must be non-negative, got {}", n),
            ));
        }
        self.counters.lock().insert(namespace.to_string(), n as u64);
        Ok(())
    }

    /// Current counter value for a namespace (0 if never used).
    pub fn current_sequence(&self, namespace: &str) -> u64 {
        self.counters.lock().get(namespace).copied().unwrap_or(0)
    }
}
