//! Fleet Shared Protocol Types
//!
//! This crate provides the message envelope, wire identifiers and frame codec
//! shared by the ground station and the fleet server (or its simulator).

pub mod codec;
pub mod envelope;
pub mod ids;

use std::time::{SystemTime, UNIX_EPOCH};

pub use envelope::{message_type, Envelope, MessageBody};
pub use ids::{MessageId, ReceiptId, TargetId};

/// Protocol version tag stamped on every outgoing envelope
pub const PROTOCOL_VERSION: &str = "1.0";

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing defaults for the request/response layer and upload jobs
pub mod timing {
    /// How long a request waits for its response before giving up
    pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 5000;

    /// Number of concurrent upload workers
    pub const DEFAULT_WORKER_COUNT: usize = 8;

    /// Feeder re-check interval while in-flight uploads drain
    pub const FEEDER_POLL_INTERVAL_MS: u64 = 250;

    /// Automatic retries per target before it is left in the failed queue
    pub const DEFAULT_MAX_AUTO_RETRIES: u32 = 3;

    /// How long failed vehicles flash their lights
    pub const FLASH_LIGHTS_DURATION_MS: u64 = 5000;
}
