//! Connection management for the fleet server link
//!
//! This module handles:
//! - Persistent TCP connections with automatic reconnection
//! - Exponential backoff between attempts
//! - Attaching each new connection to the message hub

mod manager;

pub use manager::{ConnectionConfig, ConnectionEvent, ConnectionManager};
