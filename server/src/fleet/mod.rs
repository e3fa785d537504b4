//! Simulated fleet behaviour
//!
//! This module handles:
//! - Answering multi-object requests with results, errors or receipts
//! - Completing receipts later with `ASYNC-RESP` or `ASYNC-TIMEOUT`
//! - Honouring `ASYNC-CANCEL` for receipts still outstanding

mod receipts;
mod responder;

pub use receipts::ReceiptBook;
pub use responder::{Deferred, DeferredOutcome, FleetResponder, Plan, SimConfig};
