//! Ground station link to a drone fleet server
//!
//! The [`hub::MessageHub`] turns the bidirectional frame channel into
//! request/response calls, [`operations::AsyncOperationTracker`] adds the
//! receipt convention on top, and [`upload::UploadOrchestrator`] drives bulk
//! uploads across many vehicles with a bounded worker pool.

pub mod connection;
pub mod error;
pub mod hub;
pub mod operations;
pub mod transport;
pub mod upload;

pub use error::HubError;
pub use hub::{HubConfig, MessageHub};
pub use operations::{AsyncOperationTracker, TrackerConfig};
pub use upload::{JobOutcome, JobType, UploadOptions, UploadOrchestrator};
