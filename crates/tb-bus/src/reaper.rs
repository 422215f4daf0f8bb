//! Session-timeout reaper.
//!
//! Conversations in the claim registry whose last activity is older than the
//! expiry window get a synthetic session-close message published on the
//! inbound routing key, mirroring the direction of a user message.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tb_claims::ClaimRegistry;
use tb_common::{AddressType, Message, SessionEvent, TransportType};

use crate::{MessagePublisher, Publisher, Result};

/// How long a claim may sit untouched before the session is closed.
const CLAIM_EXPIRY: Duration = Duration::from_secs(5 * 60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Build the synthetic close message for an expired conversation. The user
/// address goes in `from_addr`, matching an inbound message.
pub fn close_message(whatsapp_number: &str, address: &str, transport_name: &str) -> Message {
    let mut message = Message::new(
        whatsapp_number,
        address,
        transport_name,
        TransportType::HttpApi,
    );
    message.session_event = SessionEvent::Close;
    message.to_addr_type = Some(AddressType::Msisdn);
    message.from_addr_type = Some(AddressType::Msisdn);
    message
}

pub struct SessionReaper {
    publisher: Arc<Publisher>,
    registry: ClaimRegistry,
    whatsapp_number: String,
    transport_name: String,
}

impl SessionReaper {
    pub fn new(
        publisher: Arc<Publisher>,
        registry: ClaimRegistry,
        whatsapp_number: impl Into<String>,
        transport_name: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            registry,
            whatsapp_number: whatsapp_number.into(),
            transport_name: transport_name.into(),
        }
    }

    /// One sweep: atomically dequeue expired claims, publish a close message
    /// for each. Addresses already dequeued are lost if the publish fails;
    /// the registry entry is gone either way.
    pub async fn sweep(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp() - CLAIM_EXPIRY.as_secs() as i64;
        let addresses = self.registry.scan_expired(cutoff).await?;
        let count = addresses.len();
        for address in addresses {
            debug!(address = %address, "Closing expired conversation");
            let message = close_message(&self.whatsapp_number, &address, &self.transport_name);
            self.publisher.publish_message(&message).await?;
        }
        Ok(count)
    }

    /// Run sweeps every second until torn down. Per-tick failures are logged
    /// and swallowed; the next tick retries against current registry state.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.sweep().await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "Closed expired conversations"),
                            Err(e) => warn!(error = %e, "Session sweep failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Session reaper shutting down");
                        break;
                    }
                }
            }
        });

        ReaperHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// Handle to the running reaper task. Tear it down before closing the AMQP
/// connection so a final sweep does not race the teardown.
pub struct ReaperHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn teardown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_message_direction_matches_inbound() {
        let message = close_message("27820000000", "27820001001", "whatsapp");
        assert_eq!(message.to_addr, "27820000000");
        assert_eq!(message.from_addr, "27820001001");
        assert_eq!(message.session_event, SessionEvent::Close);
        assert_eq!(message.to_addr_type, Some(AddressType::Msisdn));
        assert_eq!(message.from_addr_type, Some(AddressType::Msisdn));
        assert_eq!(message.transport_type, TransportType::HttpApi);
        assert!(message.content.is_none());
    }
}
