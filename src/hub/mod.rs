//! Request/response correlation over the fleet transport
//!
//! This module handles:
//! - Stamping outgoing envelopes with fresh message ids
//! - Matching responses to pending requests by correlation id
//! - Per-request response timeouts
//! - Routing unsolicited messages to notification handlers
//! - Rejecting everything in flight when the transport is swapped

mod message_hub;
mod pending;

pub use message_hub::{HubConfig, MessageHub, NotificationHandler, TransportListener};
pub(crate) use pending::ResponseHook;
