// SPDX-License-Identifier: MIT OR Apache-2.0
//! AMQP 0.9.1 adapter (lapin).
//!
//! Queues are declared durable on first use, publishes wait for
//! publisher confirms, and messages are sent persistent. Decode
//! failures on consumption are acked and dropped after logging — a
//! poison message must not wedge the queue.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashSet;
use std::sync::Arc;
use steward_proto::{Codec, Envelope};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::{Acknowledger, BusDelivery, BusError, BusSubscription, MessageBus};

/// Delivery mode 2 = persistent.
const PERSISTENT: u8 = 2;

/// [`MessageBus`] implementation backed by an AMQP broker.
pub struct AmqpBus {
    channel: Channel,
    declared: Arc<Mutex<HashSet<String>>>,
    consumer_tag: String,
}

impl AmqpBus {
    /// Connect to the broker and open a confirming channel.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connection`] if the broker is unreachable or
    /// the channel cannot be opened.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self {
            channel,
            declared: Arc::new(Mutex::new(HashSet::new())),
            consumer_tag: format!("steward-{}", uuid_suffix()),
        })
    }

    async fn ensure_queue(&self, queue: &str) -> Result<(), BusError> {
        let mut declared = self.declared.lock().await;
        if declared.contains(queue) {
            return Ok(());
        }
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        declared.insert(queue.to_string());
        Ok(())
    }
}

fn uuid_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<(), BusError> {
        self.ensure_queue(queue).await?;
        let bytes = Codec::encode(envelope)?;
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &bytes,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| BusError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| BusError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        if matches!(confirm, Confirmation::Nack(_)) {
            return Err(BusError::Publish {
                queue: queue.to_string(),
                reason: "broker nacked publish".to_string(),
            });
        }
        debug!(
            target: "steward.bus.amqp",
            queue,
            message_id = %envelope.message_id,
            "published"
        );
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<BusSubscription, BusError> {
        self.ensure_queue(queue).await?;
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(256);
        let queue_name = queue.to_string();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                let delivery = match next {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(
                            target: "steward.bus.amqp",
                            queue = %queue_name,
                            error = %e,
                            "consumer stream error"
                        );
                        break;
                    }
                };
                match Codec::decode(&delivery.data) {
                    Ok(envelope) => {
                        let wrapped =
                            BusDelivery::new(envelope, Box::new(AmqpAcker { delivery }));
                        if tx.send(wrapped).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Poison message: drop it, or it blocks the queue.
                        warn!(
                            target: "steward.bus.amqp",
                            queue = %queue_name,
                            error = %e,
                            "dropping undecodable delivery"
                        );
                        let _ = delivery.ack(BasicAckOptions::default()).await;
                    }
                }
            }
        });
        Ok(BusSubscription::new(rx))
    }
}

struct AmqpAcker {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Acknowledge(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        self.delivery
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BusError::Acknowledge(e.to_string()))
    }
}
