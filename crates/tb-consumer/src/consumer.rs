//! AMQP consumption of the outbound queue.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ExchangeKind,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tb_bus::EXCHANGE;
use tb_common::Message;

use crate::dispatcher::{OutboundDispatcher, SubmitOutcome};
use crate::Result;

/// Pause before requeueing a delivery that already failed once.
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(500);

pub struct OutboundConsumer {
    channel: Channel,
    consumer_tag: String,
}

impl OutboundConsumer {
    /// Bind the durable outbound queue and start consuming. Each delivery is
    /// handled on its own task; the channel prefetch bounds how many are in
    /// flight at once.
    pub async fn start(
        connection: &Connection,
        queue_name: &str,
        prefetch: u16,
        dispatcher: Arc<OutboundDispatcher>,
    ) -> Result<Self> {
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                queue_name,
                EXCHANGE,
                queue_name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer_tag = format!("tb-consumer-{}", Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                queue_name,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue = %queue_name, prefetch, "Consuming outbound messages");

        let queue = queue_name.to_string();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(handle_delivery(dispatcher, delivery));
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Outbound consumer stream failed");
                        break;
                    }
                }
            }
            warn!(queue = %queue, "Outbound consumer stream ended");
        });

        Ok(Self {
            channel,
            consumer_tag,
        })
    }

    pub async fn stop(&self) {
        let _ = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await;
        info!("Outbound consumer stopped");
    }
}

async fn handle_delivery(dispatcher: Arc<OutboundDispatcher>, delivery: Delivery) {
    let message = match Message::from_json(&delivery.data) {
        Ok(message) => message,
        Err(e) => {
            // Invalid envelope: retrying cannot help, throw it away.
            error!(error = %e, body = ?delivery.data, "Invalid outbound message body");
            reject(&delivery, false).await;
            return;
        }
    };

    debug!(message_id = %message.message_id, to_addr = %message.to_addr, "Processing outbound message");

    match dispatcher.submit_message(&message).await {
        Ok(SubmitOutcome::Sent) => {
            ack(&delivery).await;
        }
        Ok(SubmitOutcome::Discarded) => {
            ack(&delivery).await;
        }
        Err(e) if e.is_transient() => {
            warn!(
                message_id = %message.message_id,
                error = %e,
                redelivered = delivery.redelivered,
                "Transient delivery failure, requeueing"
            );
            if delivery.redelivered {
                tokio::time::sleep(REDELIVERY_BACKOFF).await;
            }
            reject(&delivery, true).await;
        }
        Err(e) => {
            error!(
                message_id = %message.message_id,
                error = %e,
                status = ?e.status(),
                "Permanent delivery failure, discarding"
            );
            reject(&delivery, false).await;
        }
    }
}

async fn ack(delivery: &Delivery) {
    if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
        error!(error = %e, "Failed to ack delivery");
    }
}

async fn reject(delivery: &Delivery, requeue: bool) {
    if let Err(e) = delivery
        .acker
        .reject(BasicRejectOptions { requeue })
        .await
    {
        error!(error = %e, "Failed to reject delivery");
    }
}
