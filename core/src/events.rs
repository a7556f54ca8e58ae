/// Single-process event bus with hierarchical topics
///
/// Topics look like `task-package/<verb>/<id>`. Subscribers filter by exact
/// topic or by prefix; there is no cap on the number of subscribers.
use crate::errors::{WorkflowError, WorkflowResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Maximum number of events to buffer in the broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Topic builders
pub mod topics {
    pub const ROOT: &str = "task-package";

    pub fn create(definition_id: &str) -> String {
        format!("{}/create/{}", ROOT, definition_id)
    }

    pub fn cancel(instance_id: &str) -> String {
        format!("{}/cancel/{}", ROOT, instance_id)
    }

    pub fn update(id: &str) -> String {
        format!("{}/update/{}", ROOT, id)
    }

    pub fn mode_change(scope: &str) -> String {
        format!("{}/edt-mode-change/{}", ROOT, scope)
    }

    /// Verb segment of a topic (`create`, `cancel`, ...)
    pub fn verb(topic: &str) -> Option<&str> {
        topic
            .strip_prefix(ROOT)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.split('/').next())
    }
}

/// Event published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: String,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// Topic selector for a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    Exact(String),
    Prefix(String),
}

impl TopicFilter {
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::Exact(t) => t == topic,
            TopicFilter::Prefix(p) => topic.starts_with(p.as_str()),
        }
    }
}

/// Receiving side of a subscription
pub struct EventSubscription {
    filter: TopicFilter,
    rx: broadcast::Receiver<BusEvent>,
}

impl EventSubscription {
    /// Wait for the next matching event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event.topic) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber {:?} lagged, skipped {} events", self.filter, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and pollers
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event.topic) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }
}

/// Statistics about event bus usage
#[derive(Debug, Clone, Default)]
pub struct EventBusStats {
    pub total_events_published: u64,
    pub events_by_verb: HashMap<String, u64>,
}

/// Event bus for publishing and subscribing to events
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    closed: AtomicBool,
    stats: RwLock<EventBusStats>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            closed: AtomicBool::new(false),
            stats: RwLock::new(EventBusStats::default()),
        }
    }

    /// Publish an event, returning how many subscribers received it
    pub fn publish(&self, topic: impl Into<String>, data: Value) -> WorkflowResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkflowError::Bus("event bus is closed".to_string()));
        }

        let topic = topic.into();
        {
            let mut stats = self.stats.write();
            stats.total_events_published += 1;
            let verb = topics::verb(&topic).unwrap_or("other").to_string();
            *stats.events_by_verb.entry(verb).or_insert(0) += 1;
        }

        let event = BusEvent {
            id: Uuid::new_v4().to_string(),
            topic,
            timestamp: Utc::now(),
            data,
        };
        debug!("publish {}", event.topic);

        // No subscribers is not an error
        Ok(self.tx.send(event).unwrap_or(0))
    }

    pub fn subscribe(&self, filter: TopicFilter) -> EventSubscription {
        EventSubscription {
            filter,
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscribe_topic(&self, topic: impl Into<String>) -> EventSubscription {
        self.subscribe(TopicFilter::Exact(topic.into()))
    }

    /// Refuse further publishes
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Accept publishes again after `close`
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn stats(&self) -> EventBusStats {
        self.stats.read().clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_helpers() {
        assert_eq!(topics::create("tp01"), "task-package/create/tp01");
        assert_eq!(topics::verb("task-package/cancel/abc"), Some("cancel"));
        assert_eq!(topics::verb("other/cancel/abc"), None);
    }

    #[tokio::test]
    async fn test_exact_subscription_ignores_other_topics() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_topic(topics::cancel("a"));

        bus.publish(topics::cancel("b"), json!({})).unwrap();
        bus.publish(topics::cancel("a"), json!({"n": 1})).unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.topic, "task-package/cancel/a");
        assert_eq!(event.data["n"], 1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_prefix_subscription() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(TopicFilter::Prefix("task-package/create/".into()));

        bus.publish(topics::update("x"), json!({})).unwrap();
        bus.publish(topics::create("tp02"), json!({})).unwrap();

        assert_eq!(sub.recv().await.unwrap().topic, "task-package/create/tp02");
    }

    #[test]
    fn test_publish_without_listeners_and_closed_bus() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(topics::create("tp01"), json!({})).unwrap(), 0);

        bus.close();
        assert!(bus.publish(topics::create("tp01"), json!({})).is_err());
        bus.reopen();
        assert!(bus.publish(topics::create("tp01"), json!({})).is_ok());

        let stats = bus.stats();
        assert_eq!(stats.total_events_published, 2);
        assert_eq!(stats.events_by_verb.get("create"), Some(&2));
    }
}
