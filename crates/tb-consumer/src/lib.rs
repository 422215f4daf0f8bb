//! Outbound pipeline: consume canonical messages from the bus and deliver
//! them to the provider's HTTP API.
//!
//! Deliveries are fetched from `<transport_name>.outbound` with a prefetch
//! equal to the configured concurrency, rendered into provider payloads
//! (text, interactive buttons, interactive lists, document, image), and
//! submitted with a retry policy keyed on the HTTP status class. Media
//! referenced by URL is uploaded once per process and cached.

mod consumer;
mod dispatcher;
mod error;
mod render;
mod turn;

pub use consumer::OutboundConsumer;
pub use dispatcher::{OutboundDispatcher, SubmitOutcome};
pub use error::DispatchError;
pub use render::filename_from_url;
pub use turn::{MediaRecord, TurnApiClient, TurnApiConfig};

pub type Result<T> = std::result::Result<T, DispatchError>;
