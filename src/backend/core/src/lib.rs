#![allow(clippy::result_large_err)]
//! # Chronicle Core
//!
//! Causal event log, three-layer governance model and policy-driven audit pipeline.
//!
//! ## Architecture
//!
//! - **Events**: Namespaced identifiers, causally-linked events, an append-only
//!   store with optimistic concurrency and snapshots, deterministic aggregate replay
//! - **Event Bus**: In-process publish/subscribe with wildcard subscribers and
//!   per-handler fault isolation
//! - **Governance**: L0 rules, append-only L1 facts with corrections, L2 derived
//!   state, and fact validation against evidence, location and rules
//! - **Audit**: Classification, first-match policy, a batching collector with a
//!   storage circuit breaker, and alert notifications
//! - **Telemetry**: Structured logging with redaction and Prometheus metrics

pub mod audit;
pub mod config;
pub mod error;
pub mod events;
pub mod governance;
pub mod telemetry;

pub use error::{ChronicleError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{
        Actor, ActorType, AuditCategory, AuditClassificationEngine, AuditCollector, AuditDetails,
        AuditEvent, AuditPolicyEngine, AuditRepository, CircuitBreaker, CircuitState, CollectorConfig,
        CollectorStats, InMemoryAuditRepository, InMemoryNotificationSink, Notification,
        NotificationForwarder, NotificationSink, PolicyAction, PolicyDecision, PolicyRule, Severity,
    };
    pub use crate::config::Config;
    pub use crate::error::{ChronicleError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};
    pub use crate::events::{
        handler_fn, Aggregate, AggregateProjector, AggregateRoot, CausalEvent, Causation, ContractAggregate,
        EventBus, EventHandler, EventIdGenerator, EventIdentifier, EventStore, InMemoryEventStore,
        ReducerRegistry, Snapshot, Subscription, TaskAggregate,
    };
    pub use crate::governance::{
        DerivedStateRepository, Evidence, FactEvent, FactEventRepository, GovernanceRule,
        GovernanceRuleRepository, Target, ValidationContext,
    };
}
