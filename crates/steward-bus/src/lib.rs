// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-bus
#![deny(unsafe_code)]

mod amqp;
mod memory;
pub mod topology;

pub use amqp::AmqpBus;
pub use memory::MemoryBus;
pub use topology::Topology;

use async_trait::async_trait;
use steward_proto::Envelope;
use thiserror::Error;

/// Errors from bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Could not reach or stay connected to the broker.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// A publish was not confirmed by the broker.
    #[error("publish to `{queue}` failed: {reason}")]
    Publish {
        /// Target queue.
        queue: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// A subscription could not be established.
    #[error("subscribe to `{queue}` failed: {reason}")]
    Subscribe {
        /// Target queue.
        queue: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// The envelope could not be encoded for the wire.
    #[error(transparent)]
    Encode(#[from] steward_proto::EncodeError),

    /// An ack or nack could not be delivered to the broker.
    #[error("acknowledge failed: {0}")]
    Acknowledge(String),

    /// The bus (or its subscription channel) is closed.
    #[error("bus closed")]
    Closed,
}

/// Acknowledgement backend for one delivery. Implemented per bus.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirm the delivery; the broker may forget it.
    async fn ack(&self) -> Result<(), BusError>;
    /// Reject the delivery, optionally asking the broker to requeue.
    async fn nack(&self, requeue: bool) -> Result<(), BusError>;
}

/// A consumed message plus its acknowledgement handle.
///
/// Handlers must call exactly one of [`ack`](Self::ack) or
/// [`nack`](Self::nack) once the message has been persisted (or
/// deliberately dropped). Both consume the delivery.
pub struct BusDelivery {
    /// The decoded envelope.
    pub envelope: Envelope,
    acker: Box<dyn Acknowledger>,
}

impl BusDelivery {
    /// Wrap an envelope with its acknowledgement backend.
    pub fn new(envelope: Envelope, acker: Box<dyn Acknowledger>) -> Self {
        Self { envelope, acker }
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Acknowledge`] if the broker refused the ack.
    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    /// Negatively acknowledge; `requeue` asks for redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Acknowledge`] if the broker refused the nack.
    pub async fn nack(self, requeue: bool) -> Result<(), BusError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for BusDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusDelivery")
            .field("message_id", &self.envelope.message_id)
            .field("type", &self.envelope.body.type_name())
            .finish()
    }
}

/// A handle for receiving deliveries from one queue.
pub struct BusSubscription {
    rx: tokio::sync::mpsc::Receiver<BusDelivery>,
}

impl BusSubscription {
    /// Wrap a delivery channel.
    #[must_use]
    pub fn new(rx: tokio::sync::mpsc::Receiver<BusDelivery>) -> Self {
        Self { rx }
    }

    /// Receive the next delivery, waiting asynchronously.
    ///
    /// Returns `None` when the bus is shut down.
    pub async fn recv(&mut self) -> Option<BusDelivery> {
        self.rx.recv().await
    }

    /// Try to receive a delivery without blocking.
    pub fn try_recv(&mut self) -> Option<BusDelivery> {
        self.rx.try_recv().ok()
    }
}

/// Minimal contract over a durable broker.
///
/// Guarantees at-least-once delivery to subscribers; consumers must
/// de-duplicate by `request_id`.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an envelope to a queue, waiting for broker confirmation.
    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<(), BusError>;

    /// Subscribe to a queue. Each queue supports one active consumer in
    /// this process; deliveries arrive in broker order.
    async fn subscribe(&self, queue: &str) -> Result<BusSubscription, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_error_display_names_queue() {
        let err = BusError::Publish {
            queue: "agent.ansible".into(),
            reason: "channel closed".into(),
        };
        let text = err.to_string();
        assert!(text.contains("agent.ansible"));
        assert!(text.contains("channel closed"));
    }
}
