// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-events
#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Channel depth per subscriber. A subscriber that falls this far
/// behind is evicted rather than back-pressuring the supervisor.
const SUBSCRIBER_BUFFER: usize = 256;

/// Execution event types delivered to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A plan was approved.
    PlanApproved,
    /// Dispatch of a plan began.
    DispatchStarted,
    /// A task step finished.
    StepCompleted,
    /// A task finished successfully.
    ExecutionDone,
    /// A task failed terminally.
    ExecutionFailed,
    /// A task was parked for capacity.
    Paused,
    /// A parked task went back to approved.
    Resumed,
}

/// What a subscription is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EventKey {
    /// Events about one plan.
    Plan(Uuid),
    /// Events about one request.
    Request(Uuid),
    /// Events about one task execution.
    Execution(Uuid),
}

/// The event envelope delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    pub event_type: EventKind,
    /// The key this event was broadcast under.
    pub key: EventKey,
    /// Event payload.
    pub payload: serde_json::Value,
    /// Emission timestamp.
    pub ts: DateTime<Utc>,
}

impl Event {
    /// Build an event stamped now.
    #[must_use]
    pub fn new(event_type: EventKind, key: EventKey, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            key,
            payload,
            ts: Utc::now(),
        }
    }
}

/// Opaque subscriber identity. The adapter maps these to sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    /// Mint a fresh anonymous subscriber id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct Inner {
    by_key: HashMap<EventKey, HashSet<SubscriberId>>,
    channels: HashMap<SubscriberId, mpsc::Sender<Event>>,
}

/// Subscription-based broadcaster.
pub struct EventFanout {
    inner: Mutex<Inner>,
}

impl EventFanout {
    /// Create an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_key: HashMap::new(),
                channels: HashMap::new(),
            }),
        }
    }

    /// Attach a subscriber, returning its event stream. Re-attaching
    /// an existing id replaces its channel (the old stream ends).
    pub fn attach(&self, subscriber: SubscriberId) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().expect("fanout lock poisoned");
        inner.channels.insert(subscriber, tx);
        rx
    }

    /// Subscribe an attached subscriber to a key.
    pub fn subscribe(&self, subscriber: &SubscriberId, key: EventKey) {
        let mut inner = self.inner.lock().expect("fanout lock poisoned");
        if inner.channels.contains_key(subscriber) {
            inner
                .by_key
                .entry(key)
                .or_default()
                .insert(subscriber.clone());
        }
    }

    /// Remove a subscriber from one key.
    pub fn unsubscribe(&self, subscriber: &SubscriberId, key: EventKey) {
        let mut inner = self.inner.lock().expect("fanout lock poisoned");
        if let Some(set) = inner.by_key.get_mut(&key) {
            set.remove(subscriber);
            if set.is_empty() {
                inner.by_key.remove(&key);
            }
        }
    }

    /// Detach a subscriber entirely.
    pub fn detach(&self, subscriber: &SubscriberId) {
        let mut inner = self.inner.lock().expect("fanout lock poisoned");
        inner.channels.remove(subscriber);
        for set in inner.by_key.values_mut() {
            set.remove(subscriber);
        }
        inner.by_key.retain(|_, set| !set.is_empty());
    }

    /// Broadcast an event to every subscriber of its key. Subscribers
    /// whose channel is closed or full are evicted.
    pub fn broadcast(&self, event: Event) {
        let mut inner = self.inner.lock().expect("fanout lock poisoned");
        let Some(subscribers) = inner.by_key.get(&event.key).cloned() else {
            return;
        };
        let mut evicted = Vec::new();
        for subscriber in &subscribers {
            let delivered = inner
                .channels
                .get(subscriber)
                .is_some_and(|tx| tx.try_send(event.clone()).is_ok());
            if !delivered {
                evicted.push(subscriber.clone());
            }
        }
        for subscriber in evicted {
            debug!(
                target: "steward.events",
                subscriber = %subscriber,
                "evicting subscriber after failed send"
            );
            inner.channels.remove(&subscriber);
            for set in inner.by_key.values_mut() {
                set.remove(&subscriber);
            }
        }
        inner.by_key.retain(|_, set| !set.is_empty());
    }

    /// Send an event to one subscriber regardless of keys. Evicts on
    /// failure, mirroring [`broadcast`](Self::broadcast).
    pub fn send_direct(&self, subscriber: &SubscriberId, event: Event) {
        let mut inner = self.inner.lock().expect("fanout lock poisoned");
        let delivered = inner
            .channels
            .get(subscriber)
            .is_some_and(|tx| tx.try_send(event).is_ok());
        if !delivered {
            inner.channels.remove(subscriber);
            for set in inner.by_key.values_mut() {
                set.remove(subscriber);
            }
            inner.by_key.retain(|_, set| !set.is_empty());
        }
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("fanout lock poisoned").channels.len()
    }
}

impl Default for EventFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, key: EventKey) -> Event {
        Event::new(kind, key, serde_json::json!({}))
    }

    #[tokio::test]
    async fn broadcast_reaches_key_subscribers_only() {
        let fanout = EventFanout::new();
        let plan = EventKey::Plan(Uuid::new_v4());
        let other = EventKey::Plan(Uuid::new_v4());

        let sub_a = SubscriberId::random();
        let sub_b = SubscriberId::random();
        let mut rx_a = fanout.attach(sub_a.clone());
        let mut rx_b = fanout.attach(sub_b.clone());
        fanout.subscribe(&sub_a, plan);
        fanout.subscribe(&sub_b, other);

        fanout.broadcast(event(EventKind::PlanApproved, plan));

        let got = rx_a.recv().await.unwrap();
        assert_eq!(got.event_type, EventKind::PlanApproved);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_subscriber_order_is_preserved() {
        let fanout = EventFanout::new();
        let key = EventKey::Execution(Uuid::new_v4());
        let sub = SubscriberId::random();
        let mut rx = fanout.attach(sub.clone());
        fanout.subscribe(&sub, key);

        for kind in [
            EventKind::DispatchStarted,
            EventKind::StepCompleted,
            EventKind::StepCompleted,
            EventKind::ExecutionDone,
        ] {
            fanout.broadcast(event(kind, key));
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap().event_type);
        }
        assert_eq!(
            seen,
            vec![
                EventKind::DispatchStarted,
                EventKind::StepCompleted,
                EventKind::StepCompleted,
                EventKind::ExecutionDone,
            ]
        );
    }

    #[tokio::test]
    async fn dropped_receiver_is_evicted_on_next_broadcast() {
        let fanout = EventFanout::new();
        let key = EventKey::Request(Uuid::new_v4());
        let sub = SubscriberId::random();
        let rx = fanout.attach(sub.clone());
        fanout.subscribe(&sub, key);
        drop(rx);

        fanout.broadcast(event(EventKind::Paused, key));
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_but_keeps_subscriber() {
        let fanout = EventFanout::new();
        let key = EventKey::Plan(Uuid::new_v4());
        let sub = SubscriberId::random();
        let mut rx = fanout.attach(sub.clone());
        fanout.subscribe(&sub, key);
        fanout.unsubscribe(&sub, key);

        fanout.broadcast(event(EventKind::PlanApproved, key));
        assert!(rx.try_recv().is_err());
        assert_eq!(fanout.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn send_direct_ignores_keys() {
        let fanout = EventFanout::new();
        let sub = SubscriberId::random();
        let mut rx = fanout.attach(sub.clone());

        fanout.send_direct(
            &sub,
            event(EventKind::Resumed, EventKey::Execution(Uuid::new_v4())),
        );
        assert_eq!(rx.recv().await.unwrap().event_type, EventKind::Resumed);
    }

    #[test]
    fn event_serializes_with_snake_case_type() {
        let e = event(EventKind::ExecutionFailed, EventKey::Plan(Uuid::nil()));
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["event_type"], "execution_failed");
        assert_eq!(json["key"]["kind"], "plan");
    }
}
