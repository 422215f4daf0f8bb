//! Webhook body validation against the provider's JSON schema.
//!
//! The schema text is a fixed asset embedded at compile time. Validation
//! failures are reported as a nested map mirroring the JSON-pointer paths of
//! the failing values, with `_root` standing in for top-level errors.

use jsonschema::Validator;
use serde_json::{Map, Value};

use crate::WebhookError;

static WEBHOOK_SCHEMA: &str = include_str!("../schema/webhook.json");

pub struct WebhookSchema {
    validator: Validator,
}

impl WebhookSchema {
    pub fn compile() -> Self {
        let schema: Value =
            serde_json::from_str(WEBHOOK_SCHEMA).expect("embedded webhook schema is valid JSON");
        let validator =
            jsonschema::validator_for(&schema).expect("embedded webhook schema compiles");
        Self { validator }
    }

    /// Validate a webhook body, collecting every violation into the nested
    /// error map returned to the caller as the 400 response body.
    pub fn validate(&self, instance: &Value) -> Result<(), WebhookError> {
        let mut errors = Map::new();
        for error in self.validator.iter_errors(instance) {
            let pointer = error.instance_path.to_string();
            let segments: Vec<String> = if pointer.is_empty() {
                vec!["_root".to_string()]
            } else {
                pointer.split('/').skip(1).map(str::to_string).collect()
            };
            insert_error(&mut errors, &segments, error.to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(WebhookError::SchemaViolation(Value::Object(errors)))
        }
    }
}

fn insert_error(errors: &mut Map<String, Value>, segments: &[String], message: String) {
    let mut element = errors;
    for segment in &segments[..segments.len() - 1] {
        let entry = element
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        element = entry.as_object_mut().expect("entry was just made an object");
    }
    let leaf = element
        .entry(segments[segments.len() - 1].clone())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Some(list) = leaf.as_array_mut() {
        list.push(Value::String(message));
    }
}
