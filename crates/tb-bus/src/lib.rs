//! AMQP side of the bridge: canonical message publishing and the
//! session-timeout reaper.
//!
//! All traffic flows through the durable direct exchange `vumi`. Inbound
//! messages are published to `<transport_name>.inbound`, delivery events to
//! `<transport_name>.event`. The reaper turns expired conversation claims
//! into synthetic session-close messages on the inbound key.

mod error;
mod monitor;
mod publisher;
mod reaper;

pub use error::BusError;
pub use monitor::{spawn_bus_monitor, BusMonitor};
pub use publisher::{MessagePublisher, Publisher};
pub use reaper::{close_message, ReaperHandle, SessionReaper};

pub type Result<T> = std::result::Result<T, BusError>;

/// Name of the direct exchange all canonical traffic goes through.
pub const EXCHANGE: &str = "vumi";
