//! Aggregate projection: deterministic replay of an event stream into state.
//!
//! Each aggregate registers one reducer per event type in a
//! [`ReducerRegistry`]. Replay folds events through the registry starting at
//! the aggregate's `Default` state. Event types with no registered reducer
//! leave domain fields untouched, so newer producers never break older
//! readers.
//!
//! Reducers use patch semantics: only fields present and non-null in the
//! payload overwrite state. Timestamps and versions come from event metadata,
//! never the wall clock, which keeps `replay_from` a pure function.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ChronicleError, Result};

use super::event::{Causation, CausalEvent};
use super::identifier::EventIdGenerator;
use super::store::{EventStore, Snapshot};

// =============================================================================
// Reducers
// =============================================================================

/// Folds one event into aggregate state.
pub type Reducer<S> = fn(&mut S, &CausalEvent);

/// Reducers keyed by event type.
pub struct ReducerRegistry<S> {
    reducers: HashMap<&'static str, Reducer<S>>,
}

impl<S> ReducerRegistry<S> {
    pub fn new() -> Self {
        Self {
            reducers: HashMap::new(),
        }
    }

    /// Register the reducer for an event type.
    pub fn on(mut self, event_type: &'static str, reducer: Reducer<S>) -> Self {
        self.reducers.insert(event_type, reducer);
        self
    }

    pub fn get(&self, event_type: &str) -> Option<Reducer<S>> {
        self.reducers.get(event_type).copied()
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.reducers.contains_key(event_type)
    }
}

impl<S> Default for ReducerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Overwrite `target` with `payload[key]` when that field is present and non-null.
///
/// Returns whether the target changed. A value that does not deserialize
/// into `T` is ignored.
pub fn patch<T: DeserializeOwned>(target: &mut T, payload: &serde_json::Value, key: &str) -> bool {
    match payload.get(key) {
        Some(value) if !value.is_null() => match T::deserialize(value) {
            Ok(v) => {
                *target = v;
                true
            }
            Err(_) => false,
        },
        _ => false,
    }
}

/// [`patch`] for optional fields.
pub fn patch_opt<T: DeserializeOwned>(
    target: &mut Option<T>,
    payload: &serde_json::Value,
    key: &str,
) -> bool {
    match payload.get(key) {
        Some(value) if !value.is_null() => match T::deserialize(value) {
            Ok(v) => {
                *target = Some(v);
                true
            }
            Err(_) => false,
        },
        _ => false,
    }
}

// =============================================================================
// Aggregate Trait
// =============================================================================

/// State that can be reconstructed from a sequence of causal events.
pub trait Aggregate: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Aggregate type name, also used as the identifier namespace component.
    const AGGREGATE_TYPE: &'static str;

    /// The reducer table for this aggregate.
    fn reducers() -> ReducerRegistry<Self>;

    /// Number of events applied.
    fn version(&self) -> u64;

    /// Record stream position and event time after an event is applied.
    fn stamp(&mut self, version: u64, updated_at: DateTime<Utc>);
}

// =============================================================================
// Projector
// =============================================================================

/// Replays event streams through an aggregate's reducer table.
pub struct AggregateProjector<A: Aggregate> {
    registry: ReducerRegistry<A>,
}

impl<A: Aggregate> AggregateProjector<A> {
    pub fn new() -> Self {
        Self {
            registry: A::reducers(),
        }
    }

    /// Apply a single event.
    ///
    /// Unknown event types do not touch domain fields; the stream position
    /// still advances so `version` always mirrors the log.
    pub fn apply(&self, state: &mut A, event: &CausalEvent) {
        match self.registry.get(&event.event_type) {
            Some(reducer) => reducer(state, event),
            None => debug!(
                event_type = %event.event_type,
                aggregate_type = A::AGGREGATE_TYPE,
                "No reducer registered; skipping payload"
            ),
        }
        state.stamp(event.version, event.timestamp);
    }

    /// Fold an ordered event sequence from the empty state.
    pub fn replay_from(&self, events: &[CausalEvent]) -> A {
        self.replay_onto(A::default(), events)
    }

    /// Fold events newer than the snapshot's version onto the snapshot state.
    pub fn replay_from_snapshot(&self, snapshot: A, events: &[CausalEvent]) -> A {
        let base = snapshot.version();
        let newer: Vec<CausalEvent> = events
            .iter()
            .filter(|e| e.version > base)
            .cloned()
            .collect();
        self.replay_onto(snapshot, &newer)
    }

    fn replay_onto(&self, mut state: A, events: &[CausalEvent]) -> A {
        for event in events {
            self.apply(&mut state, event);
        }
        state
    }
}

impl<A: Aggregate> Default for AggregateProjector<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize aggregate state into a store snapshot.
pub fn to_snapshot<A: Aggregate>(aggregate_id: &str, state: &A) -> Result<Snapshot> {
    Ok(Snapshot {
        aggregate_id: aggregate_id.to_string(),
        state: serde_json::to_value(state)?,
        version: state.version(),
        timestamp: Utc::now(),
    })
}

/// Restore aggregate state from a store snapshot.
pub fn from_snapshot<A: Aggregate>(snapshot: &Snapshot) -> Result<A> {
    Ok(serde_json::from_value(snapshot.state.clone())?)
}

// =============================================================================
// Aggregate Root
// =============================================================================

/// An aggregate's live state plus its not-yet-persisted events.
pub struct AggregateRoot<A: Aggregate> {
    aggregate_id: String,
    state: A,
    committed_version: u64,
    uncommitted: Vec<CausalEvent>,
    projector: AggregateProjector<A>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A fresh aggregate with no history.
    pub fn new(aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            state: A::default(),
            committed_version: 0,
            uncommitted: Vec::new(),
            projector: AggregateProjector::new(),
        }
    }

    /// Load from the store: latest snapshot (if usable) plus newer events.
    pub async fn load(store: &dyn EventStore, aggregate_id: impl Into<String>) -> Result<Self> {
        let mut root = Self::new(aggregate_id);

        let base = match store.get_snapshot(&root.aggregate_id).await? {
            Some(snapshot) => match from_snapshot::<A>(&snapshot) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(
                        aggregate_id = %root.aggregate_id,
                        error = %e,
                        "Discarding unreadable snapshot; replaying full stream"
                    );
                    None
                }
            },
            None => None,
        };

        root.state = match base {
            Some(state) => {
                let events = store
                    .get_events_after_version(&root.aggregate_id, state.version())
                    .await?;
                root.projector.replay_from_snapshot(state, &events)
            }
            None => {
                let events = store.get_events(&root.aggregate_id).await?;
                root.projector.replay_from(&events)
            }
        };
        root.committed_version = root.state.version();

        Ok(root)
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    /// Version including uncommitted events.
    pub fn version(&self) -> u64 {
        self.state.version()
    }

    /// Version of the last persisted event.
    pub fn committed_version(&self) -> u64 {
        self.committed_version
    }

    pub fn uncommitted_events(&self) -> &[CausalEvent] {
        &self.uncommitted
    }

    /// Stage a new event and apply it to the in-memory state.
    pub fn record(
        &mut self,
        ids: &EventIdGenerator,
        tenant: &str,
        context: &str,
        event_type: &str,
        payload: serde_json::Value,
        causation: Causation,
    ) -> Result<&CausalEvent> {
        let id = ids.generate_event_id(tenant, context, A::AGGREGATE_TYPE, None)?;
        let event = CausalEvent::builder(id, &self.aggregate_id, A::AGGREGATE_TYPE, event_type)
            .tenant(tenant)
            .payload(payload)
            .causation(causation)
            .version(self.version() + 1)
            .build();

        self.projector.apply(&mut self.state, &event);
        self.uncommitted.push(event);
        Ok(&self.uncommitted[self.uncommitted.len() - 1])
    }

    /// Persist uncommitted events in order.
    ///
    /// Events accepted by the store leave the buffer; on a rejection the
    /// remaining events stay buffered and the error is returned.
    pub async fn commit(&mut self, store: &dyn EventStore) -> Result<usize> {
        let pending = std::mem::take(&mut self.uncommitted);
        let total = pending.len();

        for (i, event) in pending.iter().enumerate() {
            if let Err(e) = store.append(event.clone()).await {
                self.uncommitted = pending[i..].to_vec();
                return Err(e);
            }
            self.committed_version = event.version;
        }

        Ok(total)
    }

    /// Snapshot the committed state.
    pub async fn save_snapshot(&self, store: &dyn EventStore) -> Result<()> {
        if !self.uncommitted.is_empty() {
            return Err(ChronicleError::validation(
                "Cannot snapshot an aggregate with uncommitted events",
            ));
        }
        store
            .save_snapshot(to_snapshot(&self.aggregate_id, &self.state)?)
            .await
    }
}

// =============================================================================
// Task Aggregate
// =============================================================================

/// Workflow status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Review,
    Done,
    Blocked,
}

/// Reconstructed state of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAggregate {
    pub id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub assignee: Option<String>,
    pub priority: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub deleted: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Aggregate for TaskAggregate {
    const AGGREGATE_TYPE: &'static str = "task";

    fn reducers() -> ReducerRegistry<Self> {
        ReducerRegistry::<Self>::new()
            .on("TaskCreated", |s, e| {
                s.id = Some(e.aggregate_id.clone());
                s.created_at = Some(e.timestamp);
                s.created_by = Some(e.caused_by_user.clone());
                s.status = Some(TaskStatus::Todo);
                patch_opt(&mut s.title, &e.payload, "title");
                patch_opt(&mut s.description, &e.payload, "description");
                patch_opt(&mut s.status, &e.payload, "status");
                patch_opt(&mut s.assignee, &e.payload, "assignee");
                patch_opt(&mut s.priority, &e.payload, "priority");
                patch_opt(&mut s.due_date, &e.payload, "dueDate");
            })
            .on("TaskUpdated", |s, e| {
                patch_opt(&mut s.title, &e.payload, "title");
                patch_opt(&mut s.description, &e.payload, "description");
                patch_opt(&mut s.assignee, &e.payload, "assignee");
                patch_opt(&mut s.priority, &e.payload, "priority");
                patch_opt(&mut s.due_date, &e.payload, "dueDate");
            })
            .on("TaskStatusChanged", |s, e| {
                if !patch_opt(&mut s.status, &e.payload, "to") {
                    patch_opt(&mut s.status, &e.payload, "status");
                }
            })
            .on("TaskAssigned", |s, e| {
                patch_opt(&mut s.assignee, &e.payload, "assignee");
            })
            .on("TaskDeleted", |s, _| {
                s.deleted = true;
            })
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn stamp(&mut self, version: u64, updated_at: DateTime<Utc>) {
        self.version = version;
        self.updated_at = Some(updated_at);
    }
}

// =============================================================================
// Contract Aggregate
// =============================================================================

/// Lifecycle status of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Draft,
    Active,
    Suspended,
    Terminated,
    Completed,
}

impl ContractStatus {
    /// Whether new facts may be recorded against the contract.
    pub fn accepts_events(&self) -> bool {
        !matches!(self, Self::Suspended | Self::Terminated)
    }
}

/// Reconstructed state of a contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractAggregate {
    pub id: Option<String>,
    pub name: Option<String>,
    pub parties: Vec<String>,
    pub locations: Vec<String>,
    pub status: Option<ContractStatus>,
    pub value: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Aggregate for ContractAggregate {
    const AGGREGATE_TYPE: &'static str = "contract";

    fn reducers() -> ReducerRegistry<Self> {
        ReducerRegistry::<Self>::new()
            .on("ContractCreated", |s, e| {
                s.id = Some(e.aggregate_id.clone());
                s.status = Some(ContractStatus::Draft);
                patch_opt(&mut s.name, &e.payload, "name");
                patch(&mut s.parties, &e.payload, "parties");
                patch(&mut s.locations, &e.payload, "locations");
                patch_opt(&mut s.status, &e.payload, "status");
                patch_opt(&mut s.value, &e.payload, "value");
            })
            .on("ContractAmended", |s, e| {
                patch_opt(&mut s.name, &e.payload, "name");
                patch(&mut s.parties, &e.payload, "parties");
                patch(&mut s.locations, &e.payload, "locations");
                patch_opt(&mut s.value, &e.payload, "value");
            })
            .on("ContractStatusChanged", |s, e| {
                if !patch_opt(&mut s.status, &e.payload, "to") {
                    patch_opt(&mut s.status, &e.payload, "status");
                }
            })
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn stamp(&mut self, version: u64, updated_at: DateTime<Utc>) {
        self.version = version;
        self.updated_at = Some(updated_at);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::store::InMemoryEventStore;
    use serde_json::json;

    fn task_event(
        ids: &EventIdGenerator,
        version: u64,
        event_type: &str,
        payload: serde_json::Value,
    ) -> CausalEvent {
        let id = ids.generate_event_id("acme", "work", "task", None).unwrap();
        CausalEvent::builder(id, "t1", "task", event_type)
            .payload(payload)
            .causation(Causation::new("user-1", "cmd"))
            .version(version)
            .build()
    }

    #[test]
    fn test_task_lifecycle_replay() {
        let ids = EventIdGenerator::new();
        let events = vec![
            task_event(&ids, 1, "TaskCreated", json!({"title": "Ship", "priority": "high"})),
            task_event(&ids, 2, "TaskStatusChanged", json!({"from": "TODO", "to": "IN_PROGRESS"})),
        ];

        let state = AggregateProjector::<TaskAggregate>::new().replay_from(&events);
        assert_eq!(state.status, Some(TaskStatus::InProgress));
        assert_eq!(state.version, 2);
        assert_eq!(state.title.as_deref(), Some("Ship"));
        assert_eq!(state.updated_at, Some(events[1].timestamp));
    }

    #[test]
    fn test_patch_semantics_keep_absent_fields() {
        let ids = EventIdGenerator::new();
        let events = vec![
            task_event(&ids, 1, "TaskCreated", json!({"title": "A", "description": "keep me"})),
            task_event(&ids, 2, "TaskUpdated", json!({"title": "B", "description": null})),
        ];

        let state = AggregateProjector::<TaskAggregate>::new().replay_from(&events);
        assert_eq!(state.title.as_deref(), Some("B"));
        assert_eq!(state.description.as_deref(), Some("keep me"));
    }

    #[test]
    fn test_unknown_event_type_is_noop() {
        let ids = EventIdGenerator::new();
        let events = vec![
            task_event(&ids, 1, "TaskCreated", json!({"title": "A"})),
            task_event(&ids, 2, "TaskArchivedV9", json!({"title": "should not apply"})),
        ];

        let state = AggregateProjector::<TaskAggregate>::new().replay_from(&events);
        assert_eq!(state.title.as_deref(), Some("A"));
        assert_eq!(state.version, 2);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let ids = EventIdGenerator::new();
        let events = vec![
            task_event(&ids, 1, "TaskCreated", json!({"title": "A"})),
            task_event(&ids, 2, "TaskAssigned", json!({"assignee": "bob"})),
            task_event(&ids, 3, "TaskStatusChanged", json!({"to": "DONE"})),
        ];

        let projector = AggregateProjector::<TaskAggregate>::new();
        let first = projector.replay_from(&events);
        let second = projector.replay_from(&events);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_replay_from_snapshot_skips_older_events() {
        let ids = EventIdGenerator::new();
        let events = vec![
            task_event(&ids, 1, "TaskCreated", json!({"title": "A"})),
            task_event(&ids, 2, "TaskUpdated", json!({"title": "B"})),
            task_event(&ids, 3, "TaskUpdated", json!({"title": "C"})),
        ];
        let projector = AggregateProjector::<TaskAggregate>::new();
        let snapshot = projector.replay_from(&events[..2]);

        let state = projector.replay_from_snapshot(snapshot, &events);
        assert_eq!(state, projector.replay_from(&events));
    }

    #[test]
    fn test_contract_status_transitions() {
        let ids = EventIdGenerator::new();
        let make = |version, event_type: &str, payload| {
            let id = ids.generate_event_id("acme", "legal", "contract", None).unwrap();
            CausalEvent::builder(id, "c1", "contract", event_type)
                .payload(payload)
                .version(version)
                .build()
        };
        let events = vec![
            make(1, "ContractCreated", json!({"name": "Site works", "status": "active", "locations": ["north"]})),
            make(2, "ContractStatusChanged", json!({"from": "active", "to": "suspended"})),
        ];

        let state = AggregateProjector::<ContractAggregate>::new().replay_from(&events);
        assert_eq!(state.status, Some(ContractStatus::Suspended));
        assert!(!state.status.unwrap().accepts_events());
        assert_eq!(state.locations, vec!["north".to_string()]);
    }

    #[tokio::test]
    async fn test_root_commit_clears_uncommitted() {
        let ids = EventIdGenerator::new();
        let store = InMemoryEventStore::new();
        let mut root = AggregateRoot::<TaskAggregate>::new("t1");

        root.record(&ids, "acme", "work", "TaskCreated", json!({"title": "A"}), Causation::new("u", "create"))
            .unwrap();
        root.record(&ids, "acme", "work", "TaskStatusChanged", json!({"to": "REVIEW"}), Causation::new("u", "move"))
            .unwrap();
        assert_eq!(root.uncommitted_events().len(), 2);
        assert_eq!(root.committed_version(), 0);

        assert_eq!(root.commit(&store).await.unwrap(), 2);
        assert!(root.uncommitted_events().is_empty());
        assert_eq!(root.committed_version(), 2);

        let loaded = AggregateRoot::<TaskAggregate>::load(&store, "t1").await.unwrap();
        assert_eq!(loaded.state(), root.state());
    }

    #[tokio::test]
    async fn test_root_commit_conflict_keeps_buffer() {
        let ids = EventIdGenerator::new();
        let store = InMemoryEventStore::new();

        let mut writer_a = AggregateRoot::<TaskAggregate>::new("t1");
        let mut writer_b = AggregateRoot::<TaskAggregate>::new("t1");
        writer_a
            .record(&ids, "acme", "work", "TaskCreated", json!({"title": "A"}), Causation::new("a", "create"))
            .unwrap();
        writer_b
            .record(&ids, "acme", "work", "TaskCreated", json!({"title": "B"}), Causation::new("b", "create"))
            .unwrap();

        writer_a.commit(&store).await.unwrap();
        let err = writer_b.commit(&store).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ConcurrencyConflict);
        assert_eq!(writer_b.uncommitted_events().len(), 1);
    }

    #[tokio::test]
    async fn test_load_uses_snapshot_plus_newer_events() {
        let ids = EventIdGenerator::new();
        let store = InMemoryEventStore::new();
        let mut root = AggregateRoot::<TaskAggregate>::new("t1");
        root.record(&ids, "acme", "work", "TaskCreated", json!({"title": "A"}), Causation::new("u", "c"))
            .unwrap();
        root.commit(&store).await.unwrap();
        root.save_snapshot(&store).await.unwrap();

        root.record(&ids, "acme", "work", "TaskUpdated", json!({"title": "B"}), Causation::new("u", "u"))
            .unwrap();
        root.commit(&store).await.unwrap();

        let loaded = AggregateRoot::<TaskAggregate>::load(&store, "t1").await.unwrap();
        assert_eq!(loaded.state().title.as_deref(), Some("B"));
        assert_eq!(loaded.version(), 2);
    }
}
