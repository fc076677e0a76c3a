//! Batched, policy-filtered audit recording.
//!
//! The collector subscribes to every bus event and buffers it. A buffer is
//! flushed when it reaches `batch_size` or when `batch_timeout` has passed
//! since its first event, whichever comes first. A flush converts, classifies
//! and evaluates each event, drops suppressed ones, writes the rest in a
//! single `create_batch` call and then publishes notification events for
//! decisions that ask for one.
//!
//! Storage writes go through a [`CircuitBreaker`]. While it is open, batches
//! are dropped and counted instead of queued. Storage errors never reach the
//! publisher of the original event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ChronicleError, ErrorCode, Result};
use crate::events::bus::{EventBus, EventHandler, Subscription};
use crate::events::event::CausalEvent;
use crate::events::identifier::{EventIdGenerator, EventIdentifier};
use crate::telemetry::logging::SensitiveFieldRedactor;
use crate::telemetry::metrics::{AuditMetrics, FlushTimer};

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::classification::AuditClassificationEngine;
use super::event::{Actor, ActorType, AuditEvent, Change, EntityRef, Notification, OperationType};
use super::notification::{notification_event, NOTIFICATION_EVENT_TYPE};
use super::policy::{AuditPolicyEngine, PolicyDecision};
use super::repository::AuditRepository;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Collector tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Flush once this many events are buffered
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush this long after the first buffered event
    #[serde(default = "default_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Consecutive storage failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays open
    #[serde(default = "default_cool_down", with = "humantime_serde")]
    pub cool_down: Duration,

    /// Users who receive alert notifications
    #[serde(default = "default_alert_recipients")]
    pub alert_recipients: Vec<String>,

    /// Scrub sensitive metadata before persisting
    #[serde(default = "default_redact_metadata")]
    pub redact_metadata: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout: default_batch_timeout(),
            failure_threshold: default_failure_threshold(),
            cool_down: default_cool_down(),
            alert_recipients: default_alert_recipients(),
            redact_metadata: default_redact_metadata(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cool_down() -> Duration {
    Duration::from_secs(60)
}

fn default_alert_recipients() -> Vec<String> {
    vec!["security-officer".to_string()]
}

fn default_redact_metadata() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Counters {
    collected: AtomicU64,
    classified: AtomicU64,
    persisted: AtomicU64,
    suppressed: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    storage_failures: AtomicU64,
    notifications: AtomicU64,
}

/// Point-in-time collector statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorStats {
    pub collected: u64,
    pub classified: u64,
    pub persisted: u64,
    pub suppressed: u64,
    pub dropped: u64,
    /// Events skipped after a conversion or classification error
    pub skipped: u64,
    pub storage_failures: u64,
    pub notifications: u64,
    pub circuit_breaker_trips: u64,
    pub circuit_state: CircuitState,
    pub buffered: usize,
}

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub processed: usize,
    pub persisted: usize,
    pub suppressed: usize,
    pub dropped: usize,
    pub skipped: usize,
    pub notifications: usize,
}

/// Optional parts of a directly recorded audit event.
#[derive(Debug, Clone, Default)]
pub struct AuditDetails {
    pub entity: Option<EntityRef>,
    /// Overrides the operation inferred from the event type verb
    pub operation_type: Option<OperationType>,
    pub changes: Option<Vec<Change>>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl AuditDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity: EntityRef) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn operation_type(mut self, operation_type: OperationType) -> Self {
        self.operation_type = Some(operation_type);
        self
    }

    pub fn changes(mut self, changes: Vec<Change>) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Collector
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Buffer {
    events: Vec<CausalEvent>,
    first_buffered_at: Option<Instant>,
}

struct CollectorInner {
    config: CollectorConfig,
    bus: EventBus,
    repository: Arc<dyn AuditRepository>,
    classifier: AuditClassificationEngine,
    policy: Arc<AuditPolicyEngine>,
    breaker: CircuitBreaker,
    redactor: SensitiveFieldRedactor,
    ids: EventIdGenerator,
    buffer: Mutex<Buffer>,
    flush_lock: tokio::sync::Mutex<()>,
    armed: Arc<Notify>,
    cancel: CancellationToken,
    counters: Counters,
    subscription: Mutex<Option<Subscription>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running audit collector. Cheap to clone.
#[derive(Clone)]
pub struct AuditCollector {
    inner: Arc<CollectorInner>,
}

impl std::fmt::Debug for AuditCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditCollector")
            .field("config", &self.inner.config)
            .field("buffered", &self.inner.buffer.lock().events.len())
            .field("circuit_state", &self.inner.breaker.state())
            .finish()
    }
}

impl AuditCollector {
    /// Build a collector with the default classifier and policy rules.
    pub fn new(config: CollectorConfig, bus: EventBus, repository: Arc<dyn AuditRepository>) -> Self {
        Self::with_components(
            config,
            bus,
            repository,
            AuditClassificationEngine::new(),
            Arc::new(AuditPolicyEngine::new()),
        )
    }

    pub fn with_components(
        config: CollectorConfig,
        bus: EventBus,
        repository: Arc<dyn AuditRepository>,
        classifier: AuditClassificationEngine,
        policy: Arc<AuditPolicyEngine>,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.failure_threshold).with_cool_down(config.cool_down);
        Self {
            inner: Arc::new(CollectorInner {
                config,
                bus,
                repository,
                classifier,
                policy,
                breaker,
                redactor: SensitiveFieldRedactor::global().clone(),
                ids: EventIdGenerator::new(),
                buffer: Mutex::new(Buffer::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                armed: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
                counters: Counters::default(),
                subscription: Mutex::new(None),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn policy(&self) -> &Arc<AuditPolicyEngine> {
        &self.inner.policy
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.inner.config
    }

    /// Subscribe to the bus and start the batch timer.
    pub fn start(&self) -> Result<()> {
        let mut subscription = self.inner.subscription.lock();
        if subscription.is_some() {
            return Err(ChronicleError::new(
                ErrorCode::InvalidArgument,
                "Audit collector already started",
            ));
        }
        if self.inner.cancel.is_cancelled() {
            return Err(ChronicleError::new(
                ErrorCode::InvalidArgument,
                "Audit collector has been shut down",
            ));
        }

        let handler = Arc::new(CollectorHandler {
            inner: Arc::downgrade(&self.inner),
        });
        *subscription = Some(self.inner.bus.subscribe_all(handler));

        *self.inner.timer.lock() = Some(tokio::spawn(run_timer(
            Arc::downgrade(&self.inner),
            self.inner.armed.clone(),
            self.inner.cancel.clone(),
        )));

        info!(
            batch_size = self.inner.config.batch_size,
            batch_timeout_ms = self.inner.config.batch_timeout.as_millis() as u64,
            "Audit collector started"
        );
        Ok(())
    }

    /// Buffer one event, flushing if the batch is full.
    pub async fn collect(&self, event: CausalEvent) {
        self.inner.collect(event).await
    }

    /// Flush the buffer now.
    pub async fn flush(&self) -> FlushReport {
        self.inner.flush().await
    }

    /// Record an event immediately, bypassing the buffer.
    ///
    /// Returns the policy decision. Suppressed events are not written. A
    /// storage failure or an open breaker is returned as `StorageFailure`.
    #[instrument(skip(self, actor, details), fields(actor_id = %actor.id))]
    pub async fn record_audit_event(
        &self,
        tenant: &str,
        event_type: &str,
        actor: Actor,
        details: Option<AuditDetails>,
    ) -> Result<PolicyDecision> {
        let details = details.unwrap_or_default();
        let mut record = AuditEvent::new(tenant, event_type, actor);
        record.entity = details.entity;
        record.operation_type = details.operation_type;
        record.changes = details.changes;
        record.metadata = details.metadata;

        self.inner.counters.collected.fetch_add(1, Ordering::Relaxed);
        AuditMetrics::record_collected();

        let (record, decision) = self.inner.evaluate(record)?;
        if decision.is_suppressed() {
            return Ok(decision);
        }

        self.inner.persist_one(record.clone()).await?;

        if decision.should_notify() {
            self.inner.notify(&record, &decision, None).await;
        }
        Ok(decision)
    }

    pub fn stats(&self) -> CollectorStats {
        self.inner.stats()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    /// Stop collecting, cancel the timer and flush what is buffered.
    pub async fn shutdown(&self) -> FlushReport {
        if let Some(subscription) = self.inner.subscription.lock().take() {
            subscription.unsubscribe();
        }
        self.inner.cancel.cancel();
        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                warn!(error = %e, "Audit timer task ended abnormally");
            }
        }
        let report = self.inner.flush().await;
        info!(persisted = report.persisted, "Audit collector stopped");
        report
    }
}

impl CollectorInner {
    async fn collect(&self, event: CausalEvent) {
        if event.event_type == NOTIFICATION_EVENT_TYPE {
            return;
        }

        self.counters.collected.fetch_add(1, Ordering::Relaxed);
        AuditMetrics::record_collected();

        let full = {
            let mut buffer = self.buffer.lock();
            if buffer.events.is_empty() {
                buffer.first_buffered_at = Some(Instant::now());
                self.armed.notify_one();
            }
            buffer.events.push(event);
            AuditMetrics::set_buffer_size(buffer.events.len());
            buffer.events.len() >= self.config.batch_size
        };

        if full {
            self.flush().await;
        }
    }

    fn flush_deadline(&self) -> Option<Instant> {
        self.buffer
            .lock()
            .first_buffered_at
            .map(|t| t + self.config.batch_timeout)
    }

    fn flush_due(&self) -> bool {
        self.flush_deadline().map_or(false, |d| d <= Instant::now())
    }

    #[instrument(skip(self))]
    async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let mut alerts = Vec::new();

        {
            let _guard = self.flush_lock.lock().await;
            let batch = {
                let mut buffer = self.buffer.lock();
                buffer.first_buffered_at = None;
                AuditMetrics::set_buffer_size(0);
                std::mem::take(&mut buffer.events)
            };
            if batch.is_empty() {
                return report;
            }

            let timer = FlushTimer::start();
            report.processed = batch.len();
            let mut records = Vec::with_capacity(batch.len());

            for event in &batch {
                let converted = to_audit_event(event);
                match self.evaluate(converted) {
                    Ok((record, decision)) => {
                        if decision.is_suppressed() {
                            report.suppressed += 1;
                            continue;
                        }
                        if decision.should_notify() {
                            alerts.push((record.clone(), decision, event.id.clone()));
                        }
                        records.push(record);
                    }
                    Err(e) => {
                        report.skipped += 1;
                        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                        warn!(event_id = %event.id, error = %e, "Skipping unclassifiable audit event");
                    }
                }
            }

            let count = records.len();
            if count > 0 {
                if self.persist_batch(records).await {
                    report.persisted = count;
                } else {
                    report.dropped = count;
                }
            }

            let elapsed = timer.finish();
            debug!(
                processed = report.processed,
                persisted = report.persisted,
                suppressed = report.suppressed,
                dropped = report.dropped,
                elapsed_ms = elapsed.as_millis() as u64,
                "Audit batch flushed"
            );
        }

        // Published after the flush lock is released so the bus can re-enter the collector.
        for (record, decision, cause) in alerts {
            report.notifications += self.notify(&record, &decision, Some(cause)).await;
        }

        report
    }

    /// Classify, redact and evaluate one record.
    fn evaluate(&self, mut record: AuditEvent) -> Result<(AuditEvent, PolicyDecision)> {
        let classification = self.classifier.classify(&record)?;
        classification.apply_to(&mut record);
        self.counters.classified.fetch_add(1, Ordering::Relaxed);
        AuditMetrics::record_classified();

        if self.config.redact_metadata {
            if let Some(metadata) = record.metadata.take() {
                let mut value = serde_json::Value::Object(metadata);
                self.redactor.redact_json(&mut value);
                if let serde_json::Value::Object(map) = value {
                    record.metadata = Some(map);
                }
            }
        }

        let decision = self.policy.evaluate(&record);
        AuditMetrics::record_decision(&format!("{:?}", decision.action).to_lowercase(), &decision.rule);
        if decision.is_suppressed() {
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            AuditMetrics::record_suppressed();
        }
        Ok((record, decision))
    }

    /// Write a batch through the breaker. Returns whether it was persisted.
    async fn persist_batch(&self, records: Vec<AuditEvent>) -> bool {
        let count = records.len() as u64;
        if !self.breaker.can_execute() {
            self.record_dropped(count, "circuit_open");
            warn!(count, "Circuit breaker open; dropping audit batch");
            return false;
        }

        match self.repository.create_batch(records).await {
            Ok(written) => {
                self.record_success(written as u64);
                true
            }
            Err(e) => {
                self.record_failure();
                self.record_dropped(count, "storage_failure");
                error!(count, error = %e, "Audit batch write failed");
                false
            }
        }
    }

    async fn persist_one(&self, record: AuditEvent) -> Result<String> {
        if !self.breaker.can_execute() {
            self.record_dropped(1, "circuit_open");
            return Err(ChronicleError::storage(
                "audit storage circuit breaker is open; record dropped",
            ));
        }

        match self.repository.create(record).await {
            Ok(id) => {
                self.record_success(1);
                Ok(id)
            }
            Err(e) => {
                self.record_failure();
                self.record_dropped(1, "storage_failure");
                Err(e)
            }
        }
    }

    fn record_success(&self, written: u64) {
        self.breaker.record_success();
        self.counters.persisted.fetch_add(written, Ordering::Relaxed);
        AuditMetrics::record_persisted(written);
        AuditMetrics::record_circuit_breaker_state(self.breaker.state());
    }

    fn record_failure(&self) {
        self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
        AuditMetrics::record_storage_failure();
        if self.breaker.record_failure() {
            AuditMetrics::record_circuit_breaker_trip();
        }
        AuditMetrics::record_circuit_breaker_state(self.breaker.state());
    }

    fn record_dropped(&self, count: u64, reason: &'static str) {
        self.counters.dropped.fetch_add(count, Ordering::Relaxed);
        AuditMetrics::record_dropped(count, reason);
    }

    /// Publish one notification event per recipient. Returns how many were published.
    async fn notify(
        &self,
        record: &AuditEvent,
        decision: &PolicyDecision,
        cause: Option<EventIdentifier>,
    ) -> usize {
        let title = format!("{}: {}", decision.rule, record.event_type);
        let description = format!(
            "{} by {} ({} severity, risk {}){}",
            record.event_type,
            record.actor.id,
            record.severity,
            record.risk_score,
            decision
                .reasons
                .first()
                .map(|r| format!(": {}", r))
                .unwrap_or_default()
        );

        let mut published = 0;
        for recipient in &self.config.alert_recipients {
            let mut alert = Notification::alert(recipient, &title, &description, &decision.rule);
            if let Some(entity) = &record.entity {
                alert = alert.with_link(format!("/{}/{}", entity.entity_type, entity.id));
            }

            match notification_event(&self.ids, &record.blueprint_id, &alert, cause.clone()) {
                Ok(event) => {
                    self.bus.publish(&event).await;
                    published += 1;
                }
                Err(e) => warn!(
                    blueprint_id = %record.blueprint_id,
                    error = %e,
                    "Could not build notification event"
                ),
            }
        }
        self.counters
            .notifications
            .fetch_add(published as u64, Ordering::Relaxed);
        published
    }

    fn stats(&self) -> CollectorStats {
        let c = &self.counters;
        CollectorStats {
            collected: c.collected.load(Ordering::Relaxed),
            classified: c.classified.load(Ordering::Relaxed),
            persisted: c.persisted.load(Ordering::Relaxed),
            suppressed: c.suppressed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            storage_failures: c.storage_failures.load(Ordering::Relaxed),
            notifications: c.notifications.load(Ordering::Relaxed),
            circuit_breaker_trips: self.breaker.trips(),
            circuit_state: self.breaker.state(),
            buffered: self.buffer.lock().events.len(),
        }
    }
}

impl Drop for CollectorInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.unsubscribe();
        }
    }
}

/// Debounced batch timer. Holds only a weak reference, so it ends once the
/// last collector handle is dropped or the collector is shut down.
async fn run_timer(inner: Weak<CollectorInner>, armed: Arc<Notify>, cancel: CancellationToken) {
    loop {
        let Some(deadline) = inner.upgrade().map(|inner| inner.flush_deadline()) else {
            break;
        };

        match deadline {
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = armed.notified() => {}
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {
                        let Some(inner) = inner.upgrade() else { break };
                        if inner.flush_due() {
                            debug!("Audit batch timeout reached");
                            inner.flush().await;
                        }
                    }
                }
            }
        }
    }
    debug!("Audit timer stopped");
}

/// Bus subscriber feeding the collector. Holds a weak reference so the bus
/// does not keep a dropped collector alive.
struct CollectorHandler {
    inner: Weak<CollectorInner>,
}

#[async_trait]
impl EventHandler for CollectorHandler {
    async fn handle(&self, event: &CausalEvent) -> Result<()> {
        if let Some(inner) = self.inner.upgrade() {
            inner.collect(event.clone()).await;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "audit-collector"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversion
// ═══════════════════════════════════════════════════════════════════════════════

/// Map a domain event onto an unclassified audit record.
pub fn to_audit_event(event: &CausalEvent) -> AuditEvent {
    let actor_id = if event.caused_by_user.trim().is_empty() {
        "system".to_string()
    } else {
        event.caused_by_user.clone()
    };
    let actor = Actor {
        id: actor_id,
        actor_type: infer_actor_type(event),
    };

    let mut metadata = event
        .payload
        .get("metadata")
        .and_then(|m| m.as_object())
        .cloned()
        .unwrap_or_default();
    metadata.insert("sourceEventId".into(), event.id.full_reference().into());
    metadata.insert("correlationId".into(), event.correlation_id.clone().into());
    metadata.insert("version".into(), event.version.into());
    if !event.caused_by_action.is_empty() {
        metadata.insert("action".into(), event.caused_by_action.clone().into());
    }
    if let Some(cause) = &event.caused_by_event_id {
        metadata.insert("causedByEventId".into(), cause.full_reference().into());
    }

    let changes = event
        .payload
        .get("changes")
        .and_then(|c| serde_json::from_value::<Vec<Change>>(c.clone()).ok());

    let mut record = AuditEvent::new(&event.tenant_id, &event.event_type, actor)
        .with_entity(EntityRef::new(&event.aggregate_type, &event.aggregate_id))
        .with_metadata(metadata);
    record.changes = changes;
    record.ai_generated = record.ai_generated
        || event.metadata_field("aiGenerated").and_then(|v| v.as_bool()) == Some(true);
    record.created_at = event.timestamp;
    record
}

/// Infer who acted: explicit `actorType` metadata, then AI hints, then
/// system hints, else a user.
pub fn infer_actor_type(event: &CausalEvent) -> ActorType {
    if let Some(explicit) = event
        .metadata_field("actorType")
        .and_then(|v| serde_json::from_value::<ActorType>(v.clone()).ok())
    {
        return explicit;
    }

    let user = event.caused_by_user.to_lowercase();
    let action = event.caused_by_action.to_lowercase();

    let ai_flag = event.metadata_field("aiGenerated").and_then(|v| v.as_bool()) == Some(true);
    if ai_flag
        || user.starts_with("ai:")
        || user.starts_with("agent:")
        || action.split(|c: char| !c.is_alphanumeric()).any(|w| w == "ai")
        || (event.caused_by_action.starts_with("ai")
            && event.caused_by_action[2..].starts_with(char::is_uppercase))
    {
        return ActorType::Ai;
    }

    if user.is_empty()
        || user == "system"
        || user.starts_with("system:")
        || user.starts_with("scheduler")
        || user.starts_with("cron")
    {
        return ActorType::System;
    }

    ActorType::User
}
