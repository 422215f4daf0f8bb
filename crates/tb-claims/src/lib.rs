//! Conversation-claim bookkeeping and message deduplication state.
//!
//! Everything in this crate is backed by the shared key-value store so that
//! multiple bridge processes see the same state:
//!
//! - [`ClaimRegistry`]: the time-indexed set of open conversations, scanned
//!   by the session reaper.
//! - [`MessageLock`]: a per-message-id distributed lock with a lease,
//!   held across the dedup-check-and-publish critical section.
//! - [`SeenMarkers`]: TTL'd markers recording which message ids were
//!   already published.

mod error;
mod lock;
mod registry;
mod seen;

pub use error::ClaimError;
pub use lock::{LockGuard, MessageLock};
pub use registry::ClaimRegistry;
pub use seen::SeenMarkers;

pub type Result<T> = std::result::Result<T, ClaimError>;
