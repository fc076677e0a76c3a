//! Integration tests for the causal event log.
//!
//! Tests cover:
//! - Identifier parsing and generation
//! - Optimistic concurrency on append
//! - Causality checks
//! - Aggregate replay, snapshots and the write model
//! - Bus delivery of committed events

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use chronicle_core::error::{ChronicleError, ErrorCode};
use chronicle_core::events::{
    handler_fn, parse_event_id, Aggregate, AggregateProjector, AggregateRoot, CausalEvent, Causation,
    ContractAggregate, ContractStatus, EventBus, EventIdGenerator, EventStore, InMemoryEventStore,
    TaskAggregate, TaskStatus,
};

fn task_event(
    ids: &EventIdGenerator,
    aggregate_id: &str,
    event_type: &str,
    version: u64,
    payload: serde_json::Value,
) -> CausalEvent {
    let id = ids.generate_event_id("acme", "work", "task", None).unwrap();
    CausalEvent::builder(id, aggregate_id, "task", event_type)
        .payload(payload)
        .causation(Causation::new("user-1", "cmd"))
        .version(version)
        .build()
}

// ============================================================================
// Identifiers
// ============================================================================

#[test]
fn test_parse_valid_reference() {
    let id = parse_event_id("acme.ops.deploy#7").unwrap();
    assert_eq!(id.namespace().to_string(), "acme.ops.deploy");
    assert_eq!(id.sequence(), 7);
    assert_eq!(id.full_reference(), "acme.ops.deploy#7");
}

#[test]
fn test_parse_rejects_single_part_namespace() {
    let err = parse_event_id("bad#7").unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidNamespace);
}

#[test]
fn test_parse_rejects_malformed_references() {
    for input in ["acme.ops.deploy", "acme.ops.deploy#", "acme.ops.deploy#x", "acme.ops.deploy#0", "#1"] {
        assert!(parse_event_id(input).is_err(), "{} should not parse", input);
    }
}

#[test]
fn test_generated_ids_round_trip_through_parse() {
    let ids = EventIdGenerator::new();
    let generated = ids.generate_event_id("acme", "ops", "deploy", None).unwrap();
    let parsed = parse_event_id(generated.full_reference()).unwrap();
    assert_eq!(parsed, generated);
}

#[test]
fn test_explicit_sequence_keeps_counter_monotonic() {
    let ids = EventIdGenerator::new();
    ids.generate_event_id("acme", "ops", "deploy", Some(10)).unwrap();
    let next = ids.generate_event_id("acme", "ops", "deploy", None).unwrap();
    assert_eq!(next.sequence(), 11);

    ids.set_sequence("acme.ops.deploy", 0).unwrap();
    assert_eq!(ids.generate_event_id("acme", "ops", "deploy", None).unwrap().sequence(), 1);
    assert!(ids.set_sequence("acme.ops.deploy", -1).is_err());
}

// ============================================================================
// Append and queries
// ============================================================================

#[tokio::test]
async fn test_versions_are_gap_free() {
    let ids = EventIdGenerator::new();
    let store = InMemoryEventStore::new();

    store.append(task_event(&ids, "t1", "TaskCreated", 1, json!({}))).await.unwrap();

    let gap = store
        .append(task_event(&ids, "t1", "TaskUpdated", 3, json!({})))
        .await
        .unwrap_err();
    assert_eq!(gap.code(), ErrorCode::ConcurrencyConflict);

    let stale = store
        .append(task_event(&ids, "t1", "TaskUpdated", 1, json!({})))
        .await
        .unwrap_err();
    assert_eq!(stale.code(), ErrorCode::ConcurrencyConflict);

    assert_eq!(store.current_version("t1").await.unwrap(), 1);
    assert_eq!(store.current_version("missing").await.unwrap(), 0);
}

#[tokio::test]
async fn test_append_batch_stops_at_first_rejection() {
    let ids = EventIdGenerator::new();
    let store = InMemoryEventStore::new();

    let batch = vec![
        task_event(&ids, "t1", "TaskCreated", 1, json!({})),
        task_event(&ids, "t1", "TaskUpdated", 2, json!({})),
        task_event(&ids, "t1", "TaskUpdated", 4, json!({})),
        task_event(&ids, "t1", "TaskUpdated", 3, json!({})),
    ];
    let err = store.append_batch(batch).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConcurrencyConflict);

    assert_eq!(store.current_version("t1").await.unwrap(), 2);
    let versions: Vec<_> = store.get_events("t1").await.unwrap().iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn test_concurrent_appenders_get_one_winner() {
    let ids = Arc::new(EventIdGenerator::new());
    let store = Arc::new(InMemoryEventStore::new());
    store.append(task_event(&ids, "t1", "TaskCreated", 1, json!({}))).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ids = ids.clone();
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .append(task_event(&ids, "t1", "TaskUpdated", 2, json!({})))
                .await
                .is_ok()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.get_events("t1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cause_must_precede_effect() {
    let ids = EventIdGenerator::new();
    let store = InMemoryEventStore::new();

    let first = task_event(&ids, "t1", "TaskCreated", 1, json!({}));
    let cause = first.id.clone();
    store.append(first).await.unwrap();

    let follow_up = CausalEvent::builder(
        ids.generate_event_id("acme", "work", "task", None).unwrap(),
        "t2",
        "task",
        "TaskCreated",
    )
    .causation(Causation::new("system:workflow", "spawnTask").caused_by(cause.clone()))
    .build();
    store.append(follow_up).await.unwrap();

    let backdated = CausalEvent::builder(
        ids.generate_event_id("acme", "work", "task", None).unwrap(),
        "t3",
        "task",
        "TaskCreated",
    )
    .causation(Causation::new("system:workflow", "spawnTask").caused_by(cause))
    .timestamp(Utc::now() - ChronoDuration::hours(1))
    .build();
    let err = store.append(backdated).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

#[tokio::test]
async fn test_time_range_and_correlation_queries() {
    let ids = EventIdGenerator::new();
    let store = InMemoryEventStore::new();
    let start = Utc::now();

    let created = CausalEvent::builder(
        ids.generate_event_id("acme", "work", "task", None).unwrap(),
        "t1",
        "task",
        "TaskCreated",
    )
    .correlation("req-42")
    .timestamp(start)
    .build();
    let contract = CausalEvent::builder(
        ids.generate_event_id("acme", "legal", "contract", None).unwrap(),
        "c1",
        "contract",
        "ContractCreated",
    )
    .correlation("req-42")
    .timestamp(start + ChronoDuration::seconds(1))
    .build();
    let later = CausalEvent::builder(
        ids.generate_event_id("acme", "work", "task", None).unwrap(),
        "t1",
        "task",
        "TaskUpdated",
    )
    .version(2)
    .timestamp(start + ChronoDuration::minutes(5))
    .build();

    store.append(created).await.unwrap();
    store.append(contract).await.unwrap();
    store.append(later).await.unwrap();

    let window = store
        .get_events_by_time_range("t1", start, start + ChronoDuration::minutes(1))
        .await
        .unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].event_type, "TaskCreated");

    let correlated = store.get_events_by_correlation("req-42").await.unwrap();
    let types: Vec<_> = correlated.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["TaskCreated", "ContractCreated"]);
}

// ============================================================================
// Replay
// ============================================================================

#[tokio::test]
async fn test_task_replay_from_store() {
    let ids = EventIdGenerator::new();
    let store = InMemoryEventStore::new();

    store
        .append(task_event(&ids, "t1", "TaskCreated", 1, json!({"title": "Pour foundation"})))
        .await
        .unwrap();
    store
        .append(task_event(
            &ids,
            "t1",
            "TaskStatusChanged",
            2,
            json!({"from": "TODO", "to": "IN_PROGRESS"}),
        ))
        .await
        .unwrap();

    let events = store.get_events("t1").await.unwrap();
    let state: TaskAggregate = AggregateProjector::new().replay_from(&events);

    assert_eq!(state.status, Some(TaskStatus::InProgress));
    assert_eq!(state.version(), 2);
    assert_eq!(state.title.as_deref(), Some("Pour foundation"));
}

#[tokio::test]
async fn test_snapshot_plus_tail_matches_full_replay() {
    let ids = EventIdGenerator::new();
    let store = InMemoryEventStore::new();

    let mut root = AggregateRoot::<TaskAggregate>::new("t1");
    root.record(&ids, "acme", "work", "TaskCreated", json!({"title": "A"}), Causation::new("u1", "create"))
        .unwrap();
    root.record(&ids, "acme", "work", "TaskAssigned", json!({"assignee": "dev-1"}), Causation::new("u1", "assign"))
        .unwrap();
    root.commit(&store).await.unwrap();
    root.save_snapshot(&store).await.unwrap();

    root.record(&ids, "acme", "work", "TaskUpdated", json!({"title": "B"}), Causation::new("u1", "edit"))
        .unwrap();
    root.commit(&store).await.unwrap();

    let loaded = AggregateRoot::<TaskAggregate>::load(&store, "t1").await.unwrap();
    let full: TaskAggregate = AggregateProjector::new().replay_from(&store.get_events("t1").await.unwrap());

    assert_eq!(loaded.version(), 3);
    assert_eq!(loaded.committed_version(), 3);
    assert_eq!(loaded.state().title, full.title);
    assert_eq!(loaded.state().assignee.as_deref(), Some("dev-1"));
}

#[tokio::test]
async fn test_contract_lifecycle() {
    let ids = EventIdGenerator::new();
    let store = InMemoryEventStore::new();

    let mut contract = AggregateRoot::<ContractAggregate>::new("c1");
    contract
        .record(
            &ids,
            "acme",
            "legal",
            "ContractCreated",
            json!({"name": "Site works", "parties": ["acme", "builder"], "status": "active"}),
            Causation::new("u1", "createContract"),
        )
        .unwrap();
    contract
        .record(
            &ids,
            "acme",
            "legal",
            "ContractStatusChanged",
            json!({"status": "suspended"}),
            Causation::new("u1", "suspendContract"),
        )
        .unwrap();
    assert_eq!(contract.commit(&store).await.unwrap(), 2);

    let loaded = AggregateRoot::<ContractAggregate>::load(&store, "c1").await.unwrap();
    assert_eq!(loaded.state().status, Some(ContractStatus::Suspended));
    assert!(!loaded.state().status.map_or(true, |s| s.accepts_events()));
    assert_eq!(loaded.version(), 2);
}

// ============================================================================
// Bus
// ============================================================================

#[tokio::test]
async fn test_committed_events_reach_subscribers() {
    let ids = EventIdGenerator::new();
    let store = InMemoryEventStore::new();
    let bus = EventBus::new();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let _sub = bus.subscribe(
        "TaskCreated",
        handler_fn("created-counter", move |_event: CausalEvent| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ChronicleError>(())
            }
        }),
    );

    let mut root = AggregateRoot::<TaskAggregate>::new("t1");
    root.record(&ids, "acme", "work", "TaskCreated", json!({}), Causation::new("u1", "create"))
        .unwrap();
    root.record(&ids, "acme", "work", "TaskDeleted", json!({}), Causation::new("u1", "delete"))
        .unwrap();
    let pending = root.uncommitted_events().to_vec();
    root.commit(&store).await.unwrap();
    bus.publish_batch(&pending).await;

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(root.state().deleted);
}
