//! Normalization of provider webhook bodies into canonical messages and
//! events, and the deduplicated publish path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;

use tb_bus::MessagePublisher;
use tb_claims::{ClaimRegistry, MessageLock, SeenMarkers};
use tb_common::{AddressType, DeliveryStatus, Event, Message, TransportType};

use crate::WebhookError;

/// Everything needed to turn one webhook body into bus traffic.
pub struct InboundPipeline {
    pub publisher: Arc<dyn MessagePublisher>,
    pub claims: Option<ClaimRegistry>,
    pub lock: Option<MessageLock>,
    pub seen: Option<SeenMarkers>,
    pub whatsapp_number: String,
    pub transport_name: String,
}

impl InboundPipeline {
    /// Process a validated webhook body. All per-message and per-status work
    /// runs concurrently; the first failure wins and surfaces to the caller.
    pub async fn handle(&self, payload: &Value, claim: Option<&str>) -> Result<(), WebhookError> {
        let contacts = payload.get("contacts");
        let mut tasks: Vec<BoxFuture<'_, Result<(), WebhookError>>> = Vec::new();

        if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
            for raw in messages {
                let normalized = normalize_message(
                    raw,
                    contacts,
                    claim,
                    &self.whatsapp_number,
                    &self.transport_name,
                )?;
                if let Some(message) = normalized {
                    tasks.push(Box::pin(self.dedupe_and_publish(message)));
                }
            }
        }

        if let Some(statuses) = payload.get("statuses").and_then(Value::as_array) {
            for raw in statuses {
                let event = event_from_status(raw)?;
                let publisher = self.publisher.clone();
                tasks.push(Box::pin(async move {
                    publisher.publish_event(&event).await?;
                    Ok(())
                }));
            }
        }

        futures::future::try_join_all(tasks).await?;
        Ok(())
    }

    /// Publish a message at most once per deduplication window.
    ///
    /// With no key-value store configured the message is published
    /// unconditionally. Otherwise the per-message lock serializes the
    /// seen-check and publish across processes; the lock is released on
    /// every exit path.
    pub async fn dedupe_and_publish(&self, message: Message) -> Result<(), WebhookError> {
        let (Some(lock), Some(seen)) = (&self.lock, &self.seen) else {
            self.publisher.publish_message(&message).await?;
            return Ok(());
        };

        let guard = lock.acquire(&message.message_id).await?;
        let result = self.publish_guarded(seen, &message).await;
        guard.release().await;
        result
    }

    async fn publish_guarded(
        &self,
        seen: &SeenMarkers,
        message: &Message,
    ) -> Result<(), WebhookError> {
        if seen.is_seen(&message.message_id).await? {
            debug!(message_id = %message.message_id, "Duplicate message, skipping publish");
            return Ok(());
        }

        let publish = self.publisher.publish_message(message);
        let register_claim = async {
            if let Some(claims) = &self.claims {
                claims.store(message.claim(), &message.from_addr).await?;
            }
            Ok::<_, tb_claims::ClaimError>(())
        };
        let (published, registered) = tokio::join!(publish, register_claim);
        published?;
        registered?;

        seen.mark_seen(&message.message_id).await?;
        Ok(())
    }
}

/// Parse the provider's Unix-seconds timestamp (possibly fractional).
fn parse_unix_timestamp(value: Option<Value>) -> Result<DateTime<Utc>, WebhookError> {
    let raw = value
        .as_ref()
        .and_then(Value::as_str)
        .ok_or_else(|| WebhookError::Payload("timestamp missing".into()))?;
    let seconds: f64 = raw
        .parse()
        .map_err(|_| WebhookError::Payload(format!("invalid timestamp {raw:?}")))?;
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1e9) as u32;
    DateTime::from_timestamp(whole, nanos)
        .ok_or_else(|| WebhookError::Payload(format!("timestamp {raw:?} out of range")))
}

fn remove_string(
    object: &mut Map<String, Value>,
    key: &str,
    context: &str,
) -> Result<String, WebhookError> {
    object
        .remove(key)
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| WebhookError::Payload(format!("{context} has no {key}")))
}

/// Normalize one webhook message into a canonical [`Message`].
///
/// Returns `None` for system messages, which are dropped silently. The
/// fields consumed here are removed from a copy of the raw message, and the
/// residual object travels with the canonical message in
/// `transport_metadata.message`.
pub fn normalize_message(
    raw: &Value,
    contacts: Option<&Value>,
    claim: Option<&str>,
    whatsapp_number: &str,
    transport_name: &str,
) -> Result<Option<Message>, WebhookError> {
    let message_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| WebhookError::Payload("message has no type".into()))?
        .to_string();
    if message_type == "system" {
        return Ok(None);
    }

    let mut residual = raw
        .as_object()
        .cloned()
        .ok_or_else(|| WebhookError::Payload("message is not an object".into()))?;

    let timestamp = parse_unix_timestamp(residual.remove("timestamp"))?;
    let from_addr = remove_string(&mut residual, "from", "message")?;
    let message_id = remove_string(&mut residual, "id", "message")?;
    let in_reply_to = residual
        .get_mut("context")
        .and_then(Value::as_object_mut)
        .and_then(|context| context.remove("id"))
        .and_then(|v| v.as_str().map(str::to_string));
    let content = extract_content(&message_type, &mut residual)?;

    let mut message = Message::new(
        whatsapp_number,
        from_addr,
        transport_name,
        TransportType::HttpApi,
    );
    message.message_id = message_id;
    message.timestamp = timestamp;
    message.in_reply_to = in_reply_to;
    message.content = content;
    message.to_addr_type = Some(AddressType::Msisdn);
    message.from_addr_type = Some(AddressType::Msisdn);
    message.transport_metadata.insert(
        "contacts".to_string(),
        contacts.cloned().unwrap_or(Value::Null),
    );
    message
        .transport_metadata
        .insert("message".to_string(), Value::Object(residual));
    message.transport_metadata.insert(
        "claim".to_string(),
        claim.map(|c| Value::String(c.to_string())).unwrap_or(Value::Null),
    );

    Ok(Some(message))
}

/// Derive the human-readable content for a message, consuming the fields it
/// comes from.
fn extract_content(
    message_type: &str,
    residual: &mut Map<String, Value>,
) -> Result<Option<String>, WebhookError> {
    match message_type {
        "text" => {
            let text = residual
                .remove("text")
                .ok_or_else(|| WebhookError::Payload("text message has no text".into()))?;
            let body = text
                .get("body")
                .and_then(Value::as_str)
                .ok_or_else(|| WebhookError::Payload("text message has no body".into()))?;
            Ok(Some(body.to_string()))
        }
        "location" => Ok(residual
            .get_mut("location")
            .and_then(Value::as_object_mut)
            .and_then(|location| location.remove("name"))
            .and_then(|v| v.as_str().map(str::to_string))),
        "button" => {
            let text = residual
                .get_mut("button")
                .and_then(Value::as_object_mut)
                .and_then(|button| button.remove("text"))
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| WebhookError::Payload("button message has no text".into()))?;
            Ok(Some(text))
        }
        "interactive" => {
            let interactive = residual
                .get_mut("interactive")
                .and_then(Value::as_object_mut)
                .ok_or_else(|| WebhookError::Payload("interactive message has no body".into()))?;
            let subtype = interactive
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| WebhookError::Payload("interactive message has no type".into()))?;
            let reply = interactive
                .get_mut(subtype.as_str())
                .and_then(Value::as_object_mut)
                .ok_or_else(|| {
                    WebhookError::Payload(format!("interactive message has no {subtype}"))
                })?;
            let title = reply
                .remove("title")
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| {
                    WebhookError::Payload(format!("interactive {subtype} has no title"))
                })?;
            Ok(Some(title))
        }
        "unknown" | "contacts" => Ok(None),
        // Media messages: the optional caption is the content.
        media_type => Ok(residual
            .get_mut(media_type)
            .and_then(Value::as_object_mut)
            .and_then(|media| media.remove("caption"))
            .and_then(|v| v.as_str().map(str::to_string))),
    }
}

/// Map one webhook status object onto a canonical delivery [`Event`].
pub fn event_from_status(raw: &Value) -> Result<Event, WebhookError> {
    let mut residual = raw
        .as_object()
        .cloned()
        .ok_or_else(|| WebhookError::Payload("status is not an object".into()))?;

    let id = remove_string(&mut residual, "id", "status")?;
    let timestamp = parse_unix_timestamp(residual.remove("timestamp"))?;
    let status = remove_string(&mut residual, "status", "status")?;

    let mut event = match status.as_str() {
        "sent" => Event::ack(id.clone(), id),
        // "deleted" deliberately reports as delivered, mirroring read.
        "delivered" | "read" | "deleted" => {
            Event::delivery_report(id, DeliveryStatus::Delivered)
        }
        "failed" => Event::delivery_report(id, DeliveryStatus::Failed),
        other => {
            return Err(WebhookError::Payload(format!(
                "unknown message status {other:?}"
            )))
        }
    };
    event.timestamp = timestamp;
    event.helper_metadata = residual;
    Ok(event)
}
