//! In-process publish/subscribe for causal events.
//!
//! The bus is an explicitly constructed, cheaply cloneable handle. Handlers
//! are registered per event type or for every type (`subscribe_all`).
//! Dispatch order is type-specific handlers in subscription order, then
//! wildcard handlers in subscription order. A failing or panicking handler is
//! logged and does not affect the others.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::error::Result;

use super::event::CausalEvent;

/// Subscription key that receives every event type.
pub const WILDCARD: &str = "*";

/// Receiver of published events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &CausalEvent) -> Result<()>;

    /// Label used in logs.
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(CausalEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &CausalEvent) -> Result<()> {
        (self.f)(event.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(CausalEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

type HandlerList = Vec<(u64, Arc<dyn EventHandler>)>;

#[derive(Default)]
struct BusInner {
    handlers: RwLock<HashMap<String, HandlerList>>,
    next_id: AtomicU64,
}

/// Shared event bus handle.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Handle returned by `subscribe`; removes the handler when `unsubscribe` is called.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    event_type: String,
    id: u64,
}

impl Subscription {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let mut handlers = inner.handlers.write();
        let Some(list) = handlers.get_mut(&self.event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&self.event_type);
        }
        removed
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("BusInner")
            .field("event_types", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event type.
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        let event_type = event_type.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(event_type.clone())
            .or_default()
            .push((id, handler));
        debug!(event_type = %event_type, subscription_id = id, "Handler subscribed");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            event_type,
            id,
        }
    }

    /// Register a handler for every event type.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> Subscription {
        self.subscribe(WILDCARD, handler)
    }

    /// Number of handlers registered under `event_type` (use [`WILDCARD`] for catch-all).
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner
            .handlers
            .read()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliver an event to its subscribers.
    ///
    /// Handlers run sequentially. The handler list is captured before the
    /// first call, so handlers may subscribe or publish without deadlocking.
    pub async fn publish(&self, event: &CausalEvent) {
        let targets: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.inner.handlers.read();
            // An event literally typed "*" reaches wildcard handlers once.
            let specific = if event.event_type == WILDCARD {
                None
            } else {
                handlers.get(&event.event_type)
            };
            let specific = specific.into_iter().flatten();
            let wildcard = handlers.get(WILDCARD).into_iter().flatten();
            specific.chain(wildcard).map(|(_, h)| h.clone()).collect()
        };

        counter!("chronicle_bus_events_published_total").increment(1);

        for handler in targets {
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    counter!("chronicle_bus_handler_failures_total").increment(1);
                    warn!(
                        handler = handler.name(),
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Event handler failed"
                    );
                }
                Err(_) => {
                    counter!("chronicle_bus_handler_failures_total").increment(1);
                    error!(
                        handler = handler.name(),
                        event_id = %event.id,
                        event_type = %event.event_type,
                        "Event handler panicked"
                    );
                }
            }
        }
    }

    /// Publish events one after another, preserving order.
    pub async fn publish_batch(&self, events: &[CausalEvent]) {
        for event in events {
            self.publish(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChronicleError;
    use crate::events::identifier::EventIdGenerator;
    use parking_lot::Mutex;

    fn event(ids: &EventIdGenerator, event_type: &str) -> CausalEvent {
        let id = ids.generate_event_id("acme", "work", "task", None).unwrap();
        CausalEvent::builder(id, "t1", "task", event_type).build()
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        async fn handle(&self, _event: &CausalEvent) -> Result<()> {
            panic!("handler panic");
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> Arc<dyn EventHandler> {
        let log = log.clone();
        handler_fn(label, move |e: CausalEvent| {
            let log = log.clone();
            async move {
                log.lock().push(format!("{}:{}", label, e.event_type));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_specific_handlers_run_before_wildcard() {
        let ids = EventIdGenerator::new();
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe_all(recorder(&log, "all"));
        bus.subscribe("TaskCreated", recorder(&log, "first"));
        bus.subscribe("TaskCreated", recorder(&log, "second"));

        bus.publish(&event(&ids, "TaskCreated")).await;
        assert_eq!(
            *log.lock(),
            vec!["first:TaskCreated", "second:TaskCreated", "all:TaskCreated"]
        );
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_are_isolated() {
        let ids = EventIdGenerator::new();
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            "TaskCreated",
            handler_fn("fails", |_| async { Err::<(), _>(ChronicleError::internal("boom")) }),
        );
        bus.subscribe("TaskCreated", Arc::new(Panicking));
        bus.subscribe("TaskCreated", recorder(&log, "ok"));

        bus.publish(&event(&ids, "TaskCreated")).await;
        assert_eq!(*log.lock(), vec!["ok:TaskCreated"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_handler() {
        let ids = EventIdGenerator::new();
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let sub = bus.subscribe("TaskCreated", recorder(&log, "x"));
        assert_eq!(bus.subscriber_count("TaskCreated"), 1);
        assert!(sub.unsubscribe());
        assert_eq!(bus.subscriber_count("TaskCreated"), 0);

        bus.publish(&event(&ids, "TaskCreated")).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_publish_batch_preserves_order() {
        let ids = EventIdGenerator::new();
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_all(recorder(&log, "all"));

        let events = vec![event(&ids, "A"), event(&ids, "B"), event(&ids, "C")];
        bus.publish_batch(&events).await;
        assert_eq!(*log.lock(), vec!["all:A", "all:B", "all:C"]);
    }

    #[tokio::test]
    async fn test_wildcard_typed_event_is_delivered_once() {
        let ids = EventIdGenerator::new();
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_all(recorder(&log, "all"));

        bus.publish(&event(&ids, WILDCARD)).await;
        assert_eq!(*log.lock(), vec!["all:*"]);
    }

    #[tokio::test]
    async fn test_clones_share_subscriptions() {
        let bus = EventBus::new();
        let other = bus.clone();
        let log = Arc::new(Mutex::new(Vec::new()));
        other.subscribe("X", recorder(&log, "x"));
        assert_eq!(bus.subscriber_count("X"), 1);
    }
}
