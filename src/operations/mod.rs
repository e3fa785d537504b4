//! Async operations with receipts
//!
//! This module handles:
//! - Interpreting immediate per-target answers (result, error, receipt)
//! - Waiting for `ASYNC-RESP` / `ASYNC-TIMEOUT` notifications by receipt
//! - Cancelling outstanding operations on request or on transport change

mod response;
mod tracker;

pub use response::{interpret, ImmediateResponse};
pub use tracker::{AsyncOperationTracker, OperationResult, TrackerConfig, DEFAULT_RECEIPT_TYPES};
