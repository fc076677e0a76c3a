//! Alert delivery over the event bus.
//!
//! The collector publishes `audit.notification` events; the
//! [`NotificationForwarder`] turns them into sink writes.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, info};

use crate::error::Result;
use crate::events::bus::{EventBus, EventHandler, Subscription};
use crate::events::event::{Causation, CausalEvent};
use crate::events::identifier::{EventIdGenerator, EventIdentifier};

use super::event::Notification;
use super::repository::NotificationSink;

/// Event type carrying a [`Notification`] payload.
pub const NOTIFICATION_EVENT_TYPE: &str = "audit.notification";

const NOTIFICATION_CONTEXT: &str = "audit";
const NOTIFICATION_AGGREGATE: &str = "notification";

/// Wrap a notification in a bus event.
pub fn notification_event(
    ids: &EventIdGenerator,
    tenant: &str,
    notification: &Notification,
    cause: Option<EventIdentifier>,
) -> Result<CausalEvent> {
    let id = ids.generate_event_id(tenant, NOTIFICATION_CONTEXT, NOTIFICATION_AGGREGATE, None)?;
    let mut causation = Causation::new("system:audit-collector", "raiseAlert");
    if let Some(cause) = cause {
        causation = causation.caused_by(cause);
    }

    Ok(CausalEvent::builder(
        id.clone(),
        id.full_reference(),
        NOTIFICATION_AGGREGATE,
        NOTIFICATION_EVENT_TYPE,
    )
    .tenant(tenant)
    .payload(serde_json::to_value(notification)?)
    .causation(causation)
    .build())
}

/// Bus subscriber writing alerts to a [`NotificationSink`].
pub struct NotificationForwarder {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationForwarder {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Subscribe a forwarder to `audit.notification` events.
    pub fn attach(bus: &EventBus, sink: Arc<dyn NotificationSink>) -> Subscription {
        info!("Notification forwarder attached");
        bus.subscribe(NOTIFICATION_EVENT_TYPE, Arc::new(Self::new(sink)))
    }
}

#[async_trait]
impl EventHandler for NotificationForwarder {
    async fn handle(&self, event: &CausalEvent) -> Result<()> {
        let notification: Notification = serde_json::from_value(event.payload.clone())?;
        debug!(
            user_id = %notification.user_id,
            rule = %notification.extra,
            "Forwarding notification"
        );
        self.sink.create(notification).await?;
        counter!("chronicle_notifications_sent_total").increment(1);
        Ok(())
    }

    fn name(&self) -> &str {
        "notification-forwarder"
    }
}
