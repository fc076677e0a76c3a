//! Audit pipeline.
//!
//! - **`event`**: audit records, actors and notifications
//! - **`classification`**: category, severity, risk score and compliance tags
//! - **`policy`**: first-match allow/suppress/flag/escalate rules
//! - **`circuit_breaker`**: consecutive-failure breaker guarding storage
//! - **`repository`**: storage and notification sink traits with in-memory impls
//! - **`notification`**: alert events on the bus and the forwarder to the sink
//! - **`collector`**: buffered bus subscriber tying the above together

pub mod circuit_breaker;
pub mod classification;
pub mod collector;
pub mod event;
pub mod notification;
pub mod policy;
pub mod repository;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
pub use classification::{AuditClassificationEngine, Classification};
pub use collector::{
    infer_actor_type, to_audit_event, AuditCollector, AuditDetails, CollectorConfig, CollectorStats, FlushReport,
};
pub use event::{
    Actor, ActorType, AuditCategory, AuditEvent, Change, EntityRef, Notification, OperationType, Severity,
    StorageTier,
};
pub use notification::{notification_event, NotificationForwarder, NOTIFICATION_EVENT_TYPE};
pub use policy::{default_rules, AuditPolicyEngine, PolicyAction, PolicyDecision, PolicyRule, DEFAULT_ALLOW};
pub use repository::{AuditRepository, InMemoryAuditRepository, InMemoryNotificationSink, NotificationSink};
