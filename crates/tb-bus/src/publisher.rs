//! Canonical message/event publisher.

use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ExchangeKind,
};
use tracing::debug;

use tb_common::{Event, Message};

use crate::{BusError, Result, EXCHANGE};

/// Seam for components that publish canonical traffic, so pipelines can be
/// exercised against an in-memory sink.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish_message(&self, message: &Message) -> Result<()>;
    async fn publish_event(&self, event: &Event) -> Result<()>;
}

/// Publishes canonical messages and events on its own channel.
pub struct Publisher {
    channel: Channel,
    transport_name: String,
    publish_timeout: Duration,
}

impl Publisher {
    /// Create a channel on `connection`, enable publisher confirms, and
    /// declare the `vumi` exchange (durable, not auto-delete).
    pub async fn new(
        connection: &Connection,
        transport_name: impl Into<String>,
        publish_timeout: Duration,
    ) -> Result<Self> {
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
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

        Ok(Self {
            channel,
            transport_name: transport_name.into(),
            publish_timeout,
        })
    }

    async fn publish_raw(&self, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let publish = async {
            self.channel
                .basic_publish(
                    EXCHANGE,
                    routing_key,
                    BasicPublishOptions::default(),
                    &body,
                    BasicProperties::default()
                        .with_delivery_mode(2) // persistent
                        .with_content_type("application/json".into())
                        .with_content_encoding("UTF-8".into()),
                )
                .await?
                .await?;
            Ok::<_, BusError>(())
        };

        tokio::time::timeout(self.publish_timeout, publish)
            .await
            .map_err(|_| BusError::PublishTimeout(self.publish_timeout))?
    }
}

#[async_trait]
impl MessagePublisher for Publisher {
    async fn publish_message(&self, message: &Message) -> Result<()> {
        debug!(message_id = %message.message_id, "Publishing inbound message");
        self.publish_raw(
            &format!("{}.inbound", self.transport_name),
            message.to_json()?.into_bytes(),
        )
        .await
    }

    async fn publish_event(&self, event: &Event) -> Result<()> {
        debug!(event_id = %event.event_id, "Publishing inbound event");
        self.publish_raw(
            &format!("{}.event", self.transport_name),
            event.to_json()?.into_bytes(),
        )
        .await
    }
}
