//! Storage capabilities consumed by the audit pipeline.
//!
//! The durable provider lives outside this crate; the collector only needs
//! `create` / `create_batch` for audit records and `create` for
//! notifications. In-memory implementations back tests and the demo server.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ChronicleError, Result};

use super::event::{AuditEvent, Notification};

/// Durable sink for audit records.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Persist one record and return its storage id.
    async fn create(&self, event: AuditEvent) -> Result<String>;

    /// Persist records in one call. Returns how many were written.
    async fn create_batch(&self, events: Vec<AuditEvent>) -> Result<usize>;
}

/// Sink for user-facing alerts.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn create(&self, notification: Notification) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory audit repository
// ═══════════════════════════════════════════════════════════════════════════════

/// Audit repository held in memory, with switchable failure injection.
#[derive(Debug, Default)]
pub struct InMemoryAuditRepository {
    records: Mutex<Vec<(String, AuditEvent)>>,
    failing: AtomicBool,
    fail_remaining: AtomicU32,
    calls: AtomicU64,
}

impl InMemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail until turned off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `n` calls, then recover.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of `create` / `create_batch` invocations, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<AuditEvent> {
        self.records.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChronicleError::storage("audit store unavailable"));
        }
        let consumed = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(ChronicleError::storage("injected audit store failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn create(&self, event: AuditEvent) -> Result<String> {
        self.check_available()?;
        let id = Uuid::new_v4().to_string();
        self.records.lock().push((id.clone(), event));
        Ok(id)
    }

    async fn create_batch(&self, events: Vec<AuditEvent>) -> Result<usize> {
        self.check_available()?;
        let count = events.len();
        let mut records = self.records.lock();
        records.extend(events.into_iter().map(|e| (Uuid::new_v4().to_string(), e)));
        debug!(count, total = records.len(), "Audit batch stored");
        Ok(count)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory notification sink
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    notifications: Mutex<Vec<Notification>>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.notifications.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn create(&self, notification: Notification) -> Result<()> {
        self.notifications.lock().push(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::Actor;
    use crate::error::ErrorCode;

    fn record() -> AuditEvent {
        AuditEvent::new("bp", "TaskCreated", Actor::user("u1"))
    }

    #[tokio::test]
    async fn test_batch_and_single_writes() {
        let repo = InMemoryAuditRepository::new();
        repo.create(record()).await.unwrap();
        assert_eq!(repo.create_batch(vec![record(), record()]).await.unwrap(), 2);
        assert_eq!(repo.len(), 3);
        assert_eq!(repo.calls(), 2);
    }

    #[tokio::test]
    async fn test_fail_next_recovers() {
        let repo = InMemoryAuditRepository::new();
        repo.fail_next(2);
        for _ in 0..2 {
            let err = repo.create(record()).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::StorageFailure);
        }
        assert!(repo.create(record()).await.is_ok());
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.calls(), 3);
    }
}
