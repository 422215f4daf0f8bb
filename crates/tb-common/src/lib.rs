use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod logging;

mod error;

pub use error::CodecError;

pub type Result<T> = std::result::Result<T, CodecError>;

/// Wire timestamp format used on the message bus.
pub const VUMI_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const VUMI_DATE_FORMAT_SUBSECONDS: &str = "%Y-%m-%d %H:%M:%S%.f";
const VUMI_DATE_FORMAT_NO_MICROSECONDS: &str = "%Y-%m-%d %H:%M:%S";

const MESSAGE_VERSION: &str = "20110921";

/// Generate a random opaque message/event id (128-bit hex).
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Current UTC time truncated to microsecond precision, matching what the
/// wire format can carry so that encode/decode round-trips are exact.
pub fn generate_timestamp() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(now.nanosecond() / 1000 * 1000).unwrap_or(now)
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(VUMI_DATE_FORMAT).to_string()
}

/// Parse a bus timestamp, with or without the microseconds part. The value is
/// assumed to be UTC.
pub fn parse_timestamp(value: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, VUMI_DATE_FORMAT_SUBSECONDS)
        .or_else(|_| NaiveDateTime::parse_from_str(value, VUMI_DATE_FORMAT_NO_MICROSECONDS))
        .map(|naive| naive.and_utc())
}

mod timestamp_codec {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        timestamp: &DateTime<Utc>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(timestamp))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(D::Error::custom)
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Session lifecycle marker. `None` is a distinct wire value (JSON `null`),
/// not an absent field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionEvent {
    #[default]
    None,
    New,
    Resume,
    Close,
}

impl SessionEvent {
    pub fn as_wire(&self) -> Option<&'static str> {
        match self {
            SessionEvent::None => None,
            SessionEvent::New => Some("new"),
            SessionEvent::Resume => Some("resume"),
            SessionEvent::Close => Some("close"),
        }
    }
}

impl Serialize for SessionEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.as_wire() {
            Some(value) => serializer.serialize_str(value),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for SessionEvent {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)?.as_deref() {
            None => Ok(SessionEvent::None),
            Some("new") => Ok(SessionEvent::New),
            Some("resume") => Ok(SessionEvent::Resume),
            Some("close") => Ok(SessionEvent::Close),
            Some(other) => Err(D::Error::unknown_variant(
                other,
                &["new", "resume", "close"],
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    HttpApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    Msisdn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Ack,
    Nack,
    DeliveryReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Failed,
    Delivered,
}

// ============================================================================
// Canonical Message
// ============================================================================

fn default_message_version() -> String {
    MESSAGE_VERSION.to_string()
}

fn default_user_message_type() -> String {
    "user_message".to_string()
}

fn default_event_message_type() -> String {
    "event".to_string()
}

/// The canonical message envelope carried on the bus.
///
/// Field layout and wire encoding follow the Vumi message format: enums
/// serialize to their string values (or `null`), timestamps serialize as
/// `YYYY-MM-DD HH:MM:SS.ffffff` UTC. The metadata bags are opaque JSON
/// objects that survive round-trips untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub to_addr: String,
    pub from_addr: String,
    pub transport_name: String,
    pub transport_type: TransportType,
    #[serde(default = "default_message_version")]
    pub message_version: String,
    #[serde(default = "default_user_message_type")]
    pub message_type: String,
    #[serde(with = "timestamp_codec", default = "generate_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub routing_metadata: Map<String, Value>,
    #[serde(default)]
    pub helper_metadata: Map<String, Value>,
    #[serde(default = "generate_id")]
    pub message_id: String,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub session_event: SessionEvent,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub transport_metadata: Map<String, Value>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub to_addr_type: Option<AddressType>,
    #[serde(default)]
    pub from_addr_type: Option<AddressType>,
}

impl Message {
    pub fn new(
        to_addr: impl Into<String>,
        from_addr: impl Into<String>,
        transport_name: impl Into<String>,
        transport_type: TransportType,
    ) -> Self {
        Self {
            to_addr: to_addr.into(),
            from_addr: from_addr.into(),
            transport_name: transport_name.into(),
            transport_type,
            message_version: default_message_version(),
            message_type: default_user_message_type(),
            timestamp: generate_timestamp(),
            routing_metadata: Map::new(),
            helper_metadata: Map::new(),
            message_id: generate_id(),
            in_reply_to: None,
            provider: None,
            session_event: SessionEvent::None,
            content: None,
            transport_metadata: Map::new(),
            group: None,
            to_addr_type: None,
            from_addr_type: None,
        }
    }

    /// Serialize for the message broker.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a broker payload back into a message.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)?;
        Ok(serde_json::from_str(text)?)
    }

    /// The conversation claim token, if the message carries one.
    pub fn claim(&self) -> Option<&str> {
        self.transport_metadata.get("claim").and_then(Value::as_str)
    }

    pub fn automation_handle(&self) -> bool {
        self.helper_metadata
            .get("automation_handle")
            .map(is_truthy)
            .unwrap_or(false)
    }

    pub fn buttons(&self) -> Option<&Vec<Value>> {
        self.helper_metadata.get("buttons").and_then(Value::as_array)
    }

    pub fn sections(&self) -> Option<&Vec<Value>> {
        self.helper_metadata.get("sections").and_then(Value::as_array)
    }

    /// The action button label for list messages.
    pub fn list_button(&self) -> Option<&str> {
        self.helper_metadata.get("button").and_then(Value::as_str)
    }

    pub fn header(&self) -> Option<&str> {
        self.helper_metadata.get("header").and_then(Value::as_str)
    }

    pub fn footer(&self) -> Option<&str> {
        self.helper_metadata.get("footer").and_then(Value::as_str)
    }

    pub fn document_url(&self) -> Option<&str> {
        self.helper_metadata.get("document").and_then(Value::as_str)
    }

    pub fn image_url(&self) -> Option<&str> {
        self.helper_metadata.get("image").and_then(Value::as_str)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ============================================================================
// Canonical Event
// ============================================================================

/// Delivery lifecycle event for a previously submitted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub user_message_id: String,
    #[serde(default = "generate_id")]
    pub event_id: String,
    #[serde(default)]
    pub sent_message_id: Option<String>,
    pub event_type: EventType,
    #[serde(default)]
    pub delivery_status: Option<DeliveryStatus>,
    #[serde(default)]
    pub nack_reason: Option<String>,
    #[serde(default)]
    pub helper_metadata: Map<String, Value>,
    #[serde(default)]
    pub routing_metadata: Map<String, Value>,
    #[serde(with = "timestamp_codec", default = "generate_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_message_version")]
    pub message_version: String,
    #[serde(default = "default_event_message_type")]
    pub message_type: String,
}

impl Event {
    fn base(user_message_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            user_message_id: user_message_id.into(),
            event_id: generate_id(),
            sent_message_id: None,
            event_type,
            delivery_status: None,
            nack_reason: None,
            helper_metadata: Map::new(),
            routing_metadata: Map::new(),
            timestamp: generate_timestamp(),
            message_version: default_message_version(),
            message_type: default_event_message_type(),
        }
    }

    pub fn ack(user_message_id: impl Into<String>, sent_message_id: impl Into<String>) -> Self {
        let mut event = Self::base(user_message_id, EventType::Ack);
        event.sent_message_id = Some(sent_message_id.into());
        event
    }

    pub fn nack(user_message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut event = Self::base(user_message_id, EventType::Nack);
        event.nack_reason = Some(reason.into());
        event
    }

    pub fn delivery_report(user_message_id: impl Into<String>, status: DeliveryStatus) -> Self {
        let mut event = Self::base(user_message_id, EventType::DeliveryReport);
        event.delivery_status = Some(status);
        event
    }

    /// Field requirements that depend on the event type.
    pub fn validate(&self) -> Result<()> {
        match self.event_type {
            EventType::Ack if self.sent_message_id.is_none() => Err(CodecError::InvalidEvent(
                "ack events require sent_message_id".into(),
            )),
            EventType::Nack if self.nack_reason.is_none() => Err(CodecError::InvalidEvent(
                "nack events require nack_reason".into(),
            )),
            EventType::DeliveryReport if self.delivery_status.is_none() => {
                Err(CodecError::InvalidEvent(
                    "delivery report events require delivery_status".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)?;
        let event: Event = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_message() -> Message {
        let mut message = Message::new(
            "27820001001",
            "27820001002",
            "whatsapp",
            TransportType::HttpApi,
        );
        message.in_reply_to = Some("original-message-id".to_string());
        message.session_event = SessionEvent::New;
        message.content = Some("message content".to_string());
        message.to_addr_type = Some(AddressType::Msisdn);
        message.from_addr_type = Some(AddressType::Msisdn);
        message
    }

    #[test]
    fn message_round_trip_preserves_every_field() {
        let message = sample_message();
        let decoded = Message::from_json(message.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn round_trip_preserves_microseconds() {
        let mut message = sample_message();
        message.timestamp = parse_timestamp("2021-02-03 04:05:06.123456").unwrap();
        let encoded = message.to_json().unwrap();
        assert!(encoded.contains("2021-02-03 04:05:06.123456"));
        let decoded = Message::from_json(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.timestamp, message.timestamp);
    }

    #[test]
    fn timestamp_without_microseconds_is_accepted() {
        let parsed = parse_timestamp("2021-02-03 04:05:06").unwrap();
        assert_eq!(format_timestamp(&parsed), "2021-02-03 04:05:06.000000");
    }

    #[test]
    fn session_event_none_serializes_to_null() {
        let message = Message::new("1", "2", "whatsapp", TransportType::HttpApi);
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["session_event"], Value::Null);
        assert_eq!(value["transport_type"], json!("http_api"));
    }

    #[test]
    fn unknown_session_event_is_rejected() {
        let mut value: Value =
            serde_json::from_str(&sample_message().to_json().unwrap()).unwrap();
        value["session_event"] = json!("paused");
        let err = Message::from_json(value.to_string().as_bytes());
        assert!(err.is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut value: Value =
            serde_json::from_str(&sample_message().to_json().unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("to_addr");
        assert!(Message::from_json(value.to_string().as_bytes()).is_err());
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(matches!(
            Message::from_json(&[0xff, 0xfe, b'{']),
            Err(CodecError::Utf8(_))
        ));
    }

    #[test]
    fn metadata_accessors() {
        let mut message = sample_message();
        message
            .transport_metadata
            .insert("claim".into(), json!("claim-token"));
        message
            .helper_metadata
            .insert("automation_handle".into(), json!(true));
        message
            .helper_metadata
            .insert("buttons".into(), json!(["a", "b"]));
        assert_eq!(message.claim(), Some("claim-token"));
        assert!(message.automation_handle());
        assert_eq!(message.buttons().unwrap().len(), 2);
        assert_eq!(message.document_url(), None);
    }

    #[test]
    fn event_round_trip_and_validation() {
        let event = Event::delivery_report("msg-1", DeliveryStatus::Delivered);
        let decoded = Event::from_json(event.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(event, decoded);

        let mut value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        value["delivery_status"] = Value::Null;
        assert!(Event::from_json(value.to_string().as_bytes()).is_err());
    }

    #[test]
    fn ack_requires_sent_message_id() {
        let event = Event::ack("msg-1", "remote-1");
        assert!(event.validate().is_ok());

        let mut value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("sent_message_id");
        assert!(Event::from_json(value.to_string().as_bytes()).is_err());
    }

    #[test]
    fn event_wire_enums() {
        let event = Event::nack("msg-1", "no route");
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["event_type"], json!("nack"));
        assert_eq!(value["nack_reason"], json!("no route"));
        assert_eq!(value["message_type"], json!("event"));
    }
}
