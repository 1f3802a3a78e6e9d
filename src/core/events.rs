//! Subscriber registry (spec.md §4.12): a bounded, filterable event feed
//! published by the orchestrator and lanes after their WAL/commit point.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StepStarted,
    StepCompleted,
    StepFailed,
    CompensationStarted,
    CompensationCompleted,
    CompensationFailed,
    SagaCompleted,
    SagaFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// The saga or workflow id this event belongs to.
    pub subject: String,
    /// Monotone per-subject sequence number, starting at 1.
    pub sequence: u64,
    pub event_type: EventType,
    /// Optional task/step id the event concerns.
    pub sub_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub sub_id: Option<String>,
    /// Only deliver events with sequence > resume_from (0 delivers everything).
    pub resume_from: u64,
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        if event.sequence <= self.resume_from {
            return false;
        }
        if let Some(t) = self.event_type {
            if event.event_type != t {
                return false;
            }
        }
        if let Some(sub_id) = &self.sub_id {
            if event.sub_id.as_deref() != Some(sub_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A live subscription handle: a bounded receiver plus the filter it was
/// registered with. Dropping it auto-unsubscribes on the next publish.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

struct SubjectState {
    sequence: AtomicU64,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
}

impl Default for SubjectState {
    fn default() -> Self {
        Self { sequence: AtomicU64::new(0), subscribers: RwLock::new(HashMap::new()) }
    }
}

/// Registry of per-subject event streams. Publishers call `publish` after
/// their durability point; subscribers register a filter and get back a
/// bounded channel.
pub struct SubscriberRegistry {
    subjects: RwLock<HashMap<String, Arc<SubjectState>>>,
    next_sub_id: AtomicU64,
    channel_capacity: usize,
}

impl SubscriberRegistry {
    pub fn new(channel_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subjects: RwLock::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            channel_capacity,
        })
    }

    async fn subject_state(&self, subject: &str) -> Arc<SubjectState> {
        if let Some(state) = self.subjects.read().await.get(subject) {
            return state.clone();
        }
        let mut subjects = self.subjects.write().await;
        subjects.entry(subject.to_string()).or_default().clone()
    }

    /// Publishes an event for `subject`, assigning it the next sequence
    /// number, and fans it out to every subscriber whose filter matches.
    /// A subscriber whose channel is full or closed is dropped silently
    /// (it unsubscribes itself by being removed).
    pub async fn publish(&self, subject: &str, event_type: EventType, sub_id: Option<String>, message: Option<String>) -> u64 {
        let state = self.subject_state(subject).await;
        let sequence = state.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event { subject: subject.to_string(), sequence, event_type, sub_id, message };

        let mut subscribers = state.subscribers.write().await;
        let mut dead = Vec::new();
        for (id, sub) in subscribers.iter() {
            if !sub.filter.matches(&event) {
                continue;
            }
            if sub.tx.try_send(event.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            subscribers.remove(&id);
        }
        sequence
    }

    /// Subscribes to `subject` with `filter`, returning a handle carrying
    /// a bounded receiver. `filter.resume_from` lets a reconnecting
    /// subscriber pick up after the last sequence it saw.
    pub async fn subscribe(&self, subject: &str, filter: EventFilter) -> Subscription {
        let state = self.subject_state(subject).await;
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        state.subscribers.write().await.insert(id, Subscriber { filter, tx });
        Subscription { id, rx }
    }

    /// Releases a subscription handle. Safe to call more than once.
    pub async fn unsubscribe(&self, subject: &str, subscription_id: u64) {
        if let Some(state) = self.subjects.read().await.get(subject) {
            state.subscribers.write().await.remove(&subscription_id);
        }
    }

    pub async fn current_sequence(&self, subject: &str) -> u64 {
        self.subject_state(subject).await.sequence.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_matching_events_in_order() {
        let registry = SubscriberRegistry::new(16);
        let mut sub = registry.subscribe("saga-1", EventFilter::default()).await;

        registry.publish("saga-1", EventType::StepStarted, Some("a".to_string()), None).await;
        registry.publish("saga-1", EventType::StepCompleted, Some("a".to_string()), None).await;

        let e1 = sub.rx.recv().await.unwrap();
        let e2 = sub.rx.recv().await.unwrap();
        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);
    }

    #[tokio::test]
    async fn filter_by_event_type_excludes_non_matching() {
        let registry = SubscriberRegistry::new(16);
        let mut sub = registry
            .subscribe("saga-1", EventFilter { event_type: Some(EventType::StepFailed), ..Default::default() })
            .await;

        registry.publish("saga-1", EventType::StepStarted, None, None).await;
        registry.publish("saga-1", EventType::StepFailed, None, None).await;

        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::StepFailed);
    }

    #[tokio::test]
    async fn filter_by_sub_id_only_delivers_matching_task() {
        let registry = SubscriberRegistry::new(16);
        let mut sub = registry
            .subscribe("saga-1", EventFilter { sub_id: Some("b".to_string()), ..Default::default() })
            .await;

        registry.publish("saga-1", EventType::StepStarted, Some("a".to_string()), None).await;
        registry.publish("saga-1", EventType::StepStarted, Some("b".to_string()), None).await;

        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.sub_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn resume_from_skips_already_seen_sequences() {
        let registry = SubscriberRegistry::new(16);
        registry.publish("saga-1", EventType::StepStarted, None, None).await;
        registry.publish("saga-1", EventType::StepCompleted, None, None).await;

        let mut sub = registry.subscribe("saga-1", EventFilter { resume_from: 1, ..Default::default() }).await;
        registry.publish("saga-1", EventType::SagaCompleted, None, None).await;

        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.sequence, 3);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let registry = SubscriberRegistry::new(16);
        let sub = registry.subscribe("saga-1", EventFilter::default()).await;
        registry.unsubscribe("saga-1", sub.id).await;

        let sequence = registry.publish("saga-1", EventType::StepStarted, None, None).await;
        assert_eq!(sequence, 1);
    }
}
