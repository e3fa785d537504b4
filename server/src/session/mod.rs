//! Session handling for connected ground stations
//!
//! This module handles:
//! - Framing and decoding of client traffic
//! - Replying to requests through the fleet responder
//! - Completing receipts after the simulated operation delay

mod connection;

pub use connection::{ClientSession, SessionHandle};

use crate::fleet::{FleetResponder, ReceiptBook};
use fleet_shared::{message_type, Envelope, TargetId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Serve one client until it disconnects
pub async fn serve(stream: TcpStream, addr: SocketAddr, responder: Arc<FleetResponder>) -> anyhow::Result<()> {
    let mut session = ClientSession::new(stream, addr);
    let handle = session.get_handle();
    let receipts = Arc::new(ReceiptBook::new());

    while let Some(envelope) = session.recv().await {
        debug!(kind = envelope.kind(), targets = ?targets_of(&envelope), "Request from {}", addr);

        if envelope.kind() == message_type::ASYNC_CANCEL {
            let cancelled = receipts.cancel(&envelope.body.receipt_ids()).await;
            info!(cancelled, "Operations cancelled by {}", addr);
            continue;
        }

        let plan = responder.plan(&envelope);
        for deferred in &plan.deferred {
            receipts.issue(deferred.receipt.clone()).await;
        }
        if let Some(reply) = &plan.reply {
            handle.send(reply).await?;
        }

        for deferred in plan.deferred {
            let handle = handle.clone();
            let receipts = receipts.clone();
            let responder = responder.clone();
            tokio::spawn(async move {
                tokio::time::sleep(responder.operation_delay()).await;
                if !receipts.take(&deferred.receipt).await {
                    return;
                }
                let notification = Envelope::new(responder.completion(&deferred));
                if let Err(e) = handle.send(&notification).await {
                    debug!(receipt = %deferred.receipt, "Could not deliver completion: {}", e);
                }
            });
        }
    }

    let outstanding = receipts.len().await;
    info!(
        outstanding,
        "Client disconnected: {} after {:?}",
        session.addr(),
        handle.connected_at.elapsed()
    );
    Ok(())
}

/// Vehicle ids named in a request, for logging
pub fn targets_of(envelope: &Envelope) -> Vec<TargetId> {
    envelope
        .body
        .get("ids")
        .and_then(|ids| ids.as_array())
        .map(|ids| ids.iter().filter_map(|id| id.as_str()).map(TargetId::from).collect())
        .unwrap_or_default()
}
