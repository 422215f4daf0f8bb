use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("signature header not found in request")]
    MissingSignature,

    #[error("HMAC signature does not match")]
    SignatureMismatch,

    #[error("request body failed schema validation")]
    SchemaViolation(Value),

    #[error("invalid webhook payload: {0}")]
    Payload(String),

    #[error("bus error: {0}")]
    Bus(#[from] tb_bus::BusError),

    #[error("claim store error: {0}")]
    Claims(#[from] tb_claims::ClaimError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match self {
            WebhookError::MissingSignature => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": self.to_string()})),
            )
                .into_response(),
            WebhookError::SignatureMismatch => (
                StatusCode::FORBIDDEN,
                Json(json!({"error": self.to_string()})),
            )
                .into_response(),
            WebhookError::SchemaViolation(errors) => {
                (StatusCode::BAD_REQUEST, Json(errors)).into_response()
            }
            WebhookError::Payload(_) | WebhookError::Bus(_) | WebhookError::Claims(_) => {
                tracing::error!(error = %self, "Webhook processing failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": self.to_string()})),
                )
                    .into_response()
            }
        }
    }
}
