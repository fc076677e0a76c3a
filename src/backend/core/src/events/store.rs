//! Append-only per-aggregate event log with advisory snapshots.
//!
//! The `EventStore` trait is the storage seam; `InMemoryEventStore` is the
//! shipped implementation. Appends are guarded by an optimistic concurrency
//! check: an event is accepted only when its version is exactly one past the
//! aggregate's current version.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{ChronicleError, ErrorDetails, Result};

use super::event::CausalEvent;

// =============================================================================
// Snapshot
// =============================================================================

/// Cached aggregate state at a given version.
///
/// Snapshots are advisory: callers needing exact state replay the events
/// newer than `version` on top of `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub aggregate_id: String,
    pub state: serde_json::Value,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// EventStore trait
// =============================================================================

/// Storage capability for the event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event, enforcing `version == current_version + 1`.
    async fn append(&self, event: CausalEvent) -> Result<()>;

    /// Version of the latest event for an aggregate (0 if none).
    async fn current_version(&self, aggregate_id: &str) -> Result<u64>;

    /// All events of an aggregate in version order.
    async fn get_events(&self, aggregate_id: &str) -> Result<Vec<CausalEvent>>;

    /// Events with `version > after`.
    async fn get_events_after_version(
        &self,
        aggregate_id: &str,
        after: u64,
    ) -> Result<Vec<CausalEvent>>;

    /// Events whose timestamp falls within `[from, to]`.
    async fn get_events_by_time_range(
        &self,
        aggregate_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CausalEvent>>;

    /// Events across all aggregates sharing a correlation id, oldest first.
    async fn get_events_by_correlation(&self, correlation_id: &str) -> Result<Vec<CausalEvent>>;

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>>;

    /// Append several events in order, stopping at the first rejection.
    async fn append_batch(&self, events: Vec<CausalEvent>) -> Result<()> {
        for event in events {
            self.append(event).await?;
        }
        Ok(())
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Where an appended event lives, for causality checks.
#[derive(Debug, Clone)]
struct EventLocation {
    aggregate_id: String,
    version: u64,
    timestamp: DateTime<Utc>,
}

/// Event store backed by concurrent in-process maps.
///
/// The per-aggregate stream entry stays locked for the whole
/// check-then-push, so racing appenders to one aggregate are serialized and
/// exactly one of them wins a given version.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: DashMap<String, Vec<CausalEvent>>,
    snapshots: DashMap<String, Snapshot>,
    index: DashMap<String, EventLocation>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_causality(&self, event: &CausalEvent) -> Result<()> {
        let Some(cause) = &event.caused_by_event_id else {
            return Ok(());
        };

        if cause == &event.id {
            return Err(causality_error(event, "an event cannot cause itself"));
        }

        match self.index.get(cause.full_reference()) {
            Some(location) => {
                if location.aggregate_id == event.aggregate_id && location.version >= event.version {
                    return Err(causality_error(
                        event,
                        "cause must precede the event in its stream",
                    ));
                }
                if location.timestamp > event.timestamp {
                    return Err(causality_error(event, "cause is newer than the event"));
                }
                Ok(())
            }
            None => {
                debug!(
                    event_id = %event.id,
                    cause = %cause,
                    "Cause not in this store; treating as external"
                );
                Ok(())
            }
        }
    }
}

fn causality_error(event: &CausalEvent, reason: &str) -> ChronicleError {
    ChronicleError::validation(format!(
        "Invalid causedByEventId on {}: {}",
        event.id, reason
    ))
    .with_details(
        ErrorDetails::new()
            .with_entity("event", event.id.to_string())
            .with_field("causedByEventId"),
    )
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[instrument(skip(self, event), fields(aggregate_id = %event.aggregate_id, event_type = %event.event_type, version = event.version))]
    async fn append(&self, event: CausalEvent) -> Result<()> {
        if self.index.contains_key(event.id.full_reference()) {
            return Err(ChronicleError::validation(format!(
                "Event {} has already been appended",
                event.id
            ))
            .with_details(ErrorDetails::new().with_entity("event", event.id.to_string())));
        }
        self.check_causality(&event)?;

        let mut stream = self.streams.entry(event.aggregate_id.clone()).or_default();
        let current = stream.len() as u64;
        if event.version != current + 1 {
            return Err(ChronicleError::conflict(
                &event.aggregate_id,
                current + 1,
                event.version,
            ));
        }

        self.index.insert(
            event.id.full_reference().to_string(),
            EventLocation {
                aggregate_id: event.aggregate_id.clone(),
                version: event.version,
                timestamp: event.timestamp,
            },
        );
        debug!(event_id = %event.id, "Event appended");
        stream.push(event);

        Ok(())
    }

    async fn current_version(&self, aggregate_id: &str) -> Result<u64> {
        Ok(self
            .streams
            .get(aggregate_id)
            .map(|s| s.len() as u64)
            .unwrap_or(0))
    }

    async fn get_events(&self, aggregate_id: &str) -> Result<Vec<CausalEvent>> {
        Ok(self
            .streams
            .get(aggregate_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn get_events_after_version(
        &self,
        aggregate_id: &str,
        after: u64,
    ) -> Result<Vec<CausalEvent>> {
        Ok(self
            .streams
            .get(aggregate_id)
            .map(|s| s.iter().filter(|e| e.version > after).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_events_by_time_range(
        &self,
        aggregate_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CausalEvent>> {
        Ok(self
            .streams
            .get(aggregate_id)
            .map(|s| {
                s.iter()
                    .filter(|e| e.timestamp >= from && e.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_events_by_correlation(&self, correlation_id: &str) -> Result<Vec<CausalEvent>> {
        let mut events: Vec<CausalEvent> = self
            .streams
            .iter()
            .flat_map(|s| {
                s.value()
                    .iter()
                    .filter(|e| e.correlation_id == correlation_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.aggregate_id.cmp(&b.aggregate_id))
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(events)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        debug!(aggregate_id = %snapshot.aggregate_id, version = snapshot.version, "Snapshot saved");
        self.snapshots.insert(snapshot.aggregate_id.clone(), snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.get(aggregate_id).map(|s| s.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::events::event::Causation;
    use crate::events::identifier::EventIdGenerator;
    use serde_json::json;

    fn event(gen: &EventIdGenerator, aggregate_id: &str, version: u64) -> CausalEvent {
        let id = gen.generate_event_id("acme", "work", "task", None).unwrap();
        CausalEvent::builder(id, aggregate_id, "task", "TaskUpdated")
            .payload(json!({"title": format!("v{}", version)}))
            .causation(Causation::new("user-1", "updateTask"))
            .version(version)
            .build()
    }

    #[tokio::test]
    async fn test_append_requires_next_version() {
        let gen = EventIdGenerator::new();
        let store = InMemoryEventStore::new();

        store.append(event(&gen, "t1", 1)).await.unwrap();
        store.append(event(&gen, "t1", 2)).await.unwrap();

        let err = store.append(event(&gen, "t1", 2)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConcurrencyConflict);

        let err = store.append(event(&gen, "t1", 5)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConcurrencyConflict);

        assert_eq!(store.current_version("t1").await.unwrap(), 2);
        assert_eq!(store.current_version("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_rejected() {
        let gen = EventIdGenerator::new();
        let store = InMemoryEventStore::new();
        let first = event(&gen, "t1", 1);
        store.append(first.clone()).await.unwrap();

        let mut replay = first;
        replay.version = 2;
        let err = store.append(replay).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_self_caused_event_rejected() {
        let gen = EventIdGenerator::new();
        let store = InMemoryEventStore::new();
        let mut e = event(&gen, "t1", 1);
        e.caused_by_event_id = Some(e.id.clone());

        let err = store.append(e).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(err.details().field.as_deref(), Some("causedByEventId"));
    }

    #[tokio::test]
    async fn test_read_projections() {
        let gen = EventIdGenerator::new();
        let store = InMemoryEventStore::new();
        for v in 1..=4 {
            store.append(event(&gen, "t1", v)).await.unwrap();
        }

        let after = store.get_events_after_version("t1", 2).await.unwrap();
        assert_eq!(after.iter().map(|e| e.version).collect::<Vec<_>>(), vec![3, 4]);

        let all = store.get_events("t1").await.unwrap();
        let from = all[1].timestamp;
        let to = all[2].timestamp;
        let ranged = store.get_events_by_time_range("t1", from, to).await.unwrap();
        assert!(ranged.iter().all(|e| e.timestamp >= from && e.timestamp <= to));
        assert!(ranged.len() >= 2);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let store = InMemoryEventStore::new();
        assert!(store.get_snapshot("t1").await.unwrap().is_none());

        let snapshot = Snapshot {
            aggregate_id: "t1".into(),
            state: json!({"title": "x"}),
            version: 3,
            timestamp: Utc::now(),
        };
        store.save_snapshot(snapshot.clone()).await.unwrap();
        assert_eq!(store.get_snapshot("t1").await.unwrap(), Some(snapshot));
    }
}
