// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process bus with broker-like semantics, for tests and
//! single-node development.
//!
//! Mirrors the behaviours the orchestrator relies on: deliveries are
//! buffered until a consumer subscribes, nack-with-requeue redelivers,
//! and every delivery is independent (at-least-once).

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use steward_proto::Envelope;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::{Acknowledger, BusDelivery, BusError, BusSubscription, MessageBus};

#[derive(Default)]
struct QueueState {
    /// Messages waiting for a consumer.
    backlog: VecDeque<Envelope>,
    /// The active consumer, if any.
    consumer: Option<mpsc::Sender<BusDelivery>>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
}

/// In-memory [`MessageBus`] implementation.
#[derive(Clone, Default)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently waiting on `queue` without a
    /// consumer. Test-facing.
    pub async fn backlog_len(&self, queue: &str) -> usize {
        let queues = self.shared.queues.lock().await;
        queues.get(queue).map_or(0, |q| q.backlog.len())
    }

    async fn deliver(shared: &Arc<Shared>, queue: &str, envelope: Envelope) {
        // Take the sender out of the lock; sending may suspend and the
        // lock must not be held across it.
        let consumer = {
            let mut queues = shared.queues.lock().await;
            queues.entry(queue.to_string()).or_default().consumer.clone()
        };
        if let Some(consumer) = consumer {
            let delivery = BusDelivery::new(
                envelope.clone(),
                Box::new(MemoryAcker {
                    shared: Arc::clone(shared),
                    queue: queue.to_string(),
                    envelope: envelope.clone(),
                }),
            );
            if consumer.send(delivery).await.is_ok() {
                return;
            }
        }
        let mut queues = shared.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        if state
            .consumer
            .as_ref()
            .is_some_and(tokio::sync::mpsc::Sender::is_closed)
        {
            state.consumer = None;
        }
        state.backlog.push_back(envelope);
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<(), BusError> {
        // Encode eagerly so the memory bus rejects exactly what the
        // broker-backed bus would reject.
        let _ = steward_proto::Codec::encode(envelope)?;
        Self::deliver(&self.shared, queue, envelope.clone()).await;
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<BusSubscription, BusError> {
        let (tx, rx) = mpsc::channel(256);
        let backlog = {
            let mut queues = self.shared.queues.lock().await;
            let state = queues.entry(queue.to_string()).or_default();
            state.consumer = Some(tx.clone());
            std::mem::take(&mut state.backlog)
        };
        for envelope in backlog {
            let delivery = BusDelivery::new(
                envelope.clone(),
                Box::new(MemoryAcker {
                    shared: Arc::clone(&self.shared),
                    queue: queue.to_string(),
                    envelope,
                }),
            );
            if tx.send(delivery).await.is_err() {
                break;
            }
        }
        Ok(BusSubscription::new(rx))
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    envelope: Envelope,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        if requeue {
            debug!(
                target: "steward.bus.memory",
                queue = %self.queue,
                message_id = %self.envelope.message_id,
                "requeueing nacked delivery"
            );
            MemoryBus::deliver(&self.shared, &self.queue, self.envelope.clone()).await;
        }
        Ok(())
    }
}
