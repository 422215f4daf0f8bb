//! Per-message dispatch: claim headers, endpoint selection, 404 recovery.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use tracing::{info, warn};

use tb_claims::ClaimRegistry;
use tb_common::{Message, SessionEvent};

use crate::render::build_payload;
use crate::turn::{TurnApiClient, MESSAGES_PATH};
use crate::{DispatchError, Result};

const CLAIM_EXTEND_HEADER: &str = "X-Turn-Claim-Extend";
const CLAIM_RELEASE_HEADER: &str = "X-Turn-Claim-Release";
const AUTOMATION_ACCEPT: &str = "application/vnd.v1+json";

/// What happened to a message that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted by the provider.
    Sent,
    /// Dropped on purpose (recipient unknown to the provider).
    Discarded,
}

pub struct OutboundDispatcher {
    turn: TurnApiClient,
    claims: Option<ClaimRegistry>,
}

impl OutboundDispatcher {
    pub fn new(turn: TurnApiClient, claims: Option<ClaimRegistry>) -> Self {
        Self { turn, claims }
    }

    /// Render and deliver one canonical message, bookkeeping its
    /// conversation claim along the way.
    pub async fn submit_message(&self, message: &Message) -> Result<SubmitOutcome> {
        let mut headers = HeaderMap::new();
        let mut path = MESSAGES_PATH.to_string();

        if let Some(claim) = message.claim() {
            match message.session_event {
                SessionEvent::None | SessionEvent::Resume => {
                    headers.insert(CLAIM_EXTEND_HEADER, claim_header_value(claim)?);
                    if let Some(claims) = &self.claims {
                        claims.store(Some(claim), &message.to_addr).await?;
                    }
                }
                SessionEvent::Close => {
                    headers.insert(CLAIM_RELEASE_HEADER, claim_header_value(claim)?);
                    if message.automation_handle() {
                        if let Some(in_reply_to) = &message.in_reply_to {
                            path = format!("/v1/messages/{in_reply_to}/automation");
                            headers.insert(ACCEPT, HeaderValue::from_static(AUTOMATION_ACCEPT));
                        }
                    }
                    if let Some(claims) = &self.claims {
                        claims.delete(Some(claim), &message.to_addr).await?;
                    }
                }
                SessionEvent::New => {}
            }
        }

        let body = build_payload(&self.turn, message).await?;

        match self.turn.post_message(&path, headers.clone(), &body).await {
            Err(DispatchError::UpstreamStatus { status: 404 }) => {
                self.recover_missing_contact(message, &path, headers, &body)
                    .await
            }
            Err(e) => Err(e),
            Ok(()) => Ok(SubmitOutcome::Sent),
        }
    }

    /// The provider answers 404 for recipients it has never seen. Probe the
    /// contact endpoint; a valid contact gets exactly one retry, anything
    /// else drops the message.
    async fn recover_missing_contact(
        &self,
        message: &Message,
        path: &str,
        headers: HeaderMap,
        body: &serde_json::Value,
    ) -> Result<SubmitOutcome> {
        info!(to_addr = %message.to_addr, "Recipient not found, probing contact");
        if !self.turn.check_contact(&message.to_addr).await? {
            warn!(
                to_addr = %message.to_addr,
                message_id = %message.message_id,
                "Recipient is not a valid contact, dropping message"
            );
            return Ok(SubmitOutcome::Discarded);
        }
        self.turn.post_message(path, headers, body).await?;
        Ok(SubmitOutcome::Sent)
    }
}

fn claim_header_value(claim: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(claim)
        .map_err(|_| DispatchError::Unrenderable("claim token is not a valid header value".into()))
}
