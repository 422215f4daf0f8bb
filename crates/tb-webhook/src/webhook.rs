//! The provider webhook endpoint.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
};
use serde_json::{json, Map, Value};

use crate::auth::{verify_signature, SIGNATURE_HEADER};
use crate::{AppState, WebhookError};

const CLAIM_HEADER: &str = "X-Turn-Claim";

/// `POST /v1/webhook`: signature check, schema validation, then concurrent
/// normalization and publishing of every message and status in the body.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, WebhookError> {
    if let Some(secret) = &state.config.hmac_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        verify_signature(secret, &body, signature)?;
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            let mut errors = Map::new();
            errors.insert(
                "_root".to_string(),
                json!(["request body is not valid JSON"]),
            );
            return Err(WebhookError::SchemaViolation(Value::Object(errors)));
        }
    };
    state.schema.validate(&payload)?;

    let claim = headers
        .get(CLAIM_HEADER)
        .and_then(|value| value.to_str().ok());
    state.pipeline.handle(&payload, claim).await?;

    Ok(Json(json!({})))
}
