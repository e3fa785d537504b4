//! In-process transport, used for loopback setups and tests

use crate::transport::traits::{FrameHandler, Transport};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fleet_shared::{Envelope, MessageBody};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Local half of an in-memory channel; attach this one to the hub
pub struct MemoryTransport {
    name: String,
    outgoing: mpsc::UnboundedSender<Envelope>,
    handler: Arc<Mutex<Option<FrameHandler>>>,
}

/// Remote half of an in-memory channel, playing the part of the server
pub struct MemoryRemote {
    outgoing: mpsc::UnboundedReceiver<Envelope>,
    handler: Arc<Mutex<Option<FrameHandler>>>,
}

impl MemoryTransport {
    /// Create a connected transport/remote pair
    pub fn pair(name: impl Into<String>) -> (Self, MemoryRemote) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Mutex::new(None));

        let transport = Self {
            name: name.into(),
            outgoing: outgoing_tx,
            handler: handler.clone(),
        };
        let remote = MemoryRemote {
            outgoing: outgoing_rx,
            handler,
        };

        (transport, remote)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_frame(&self, envelope: Envelope) -> Result<()> {
        self.outgoing
            .send(envelope)
            .map_err(|_| anyhow!("Remote end of {} dropped", self.name))
    }

    fn on_frame(&self, handler: FrameHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl MemoryRemote {
    /// Wait for the next frame sent by the local side
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.outgoing.recv().await
    }

    /// Take the next frame if one is already waiting
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.outgoing.try_recv().ok()
    }

    /// Deliver a frame to the local side; returns false if nobody is listening
    pub fn deliver(&self, envelope: Envelope) -> bool {
        // Clone out of the lock so the handler may re-enter the transport
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler(envelope);
                true
            }
            None => false,
        }
    }

    /// Answer `request` with `body`
    pub fn reply(&self, request: &Envelope, body: MessageBody) -> bool {
        self.deliver(Envelope::response_to(request, body))
    }

    /// Send an unsolicited notification to the local side
    pub fn notify(&self, body: MessageBody) -> bool {
        self.deliver(Envelope::new(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_shared::message_type;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (transport, mut remote) = MemoryTransport::pair("loopback");
        assert_eq!(transport.name(), "loopback");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        transport.on_frame(Arc::new(move |envelope| sink.lock().push(envelope)));

        let request = Envelope::new(MessageBody::new(message_type::UAV_VER));
        transport.send_frame(request.clone()).await.unwrap();
        assert_eq!(remote.recv().await, Some(request.clone()));

        assert!(remote.reply(&request, MessageBody::new(message_type::ACK_ACK)));
        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].correlation_id.as_ref(), Some(&request.id));
    }

    #[tokio::test]
    async fn test_deliver_without_handler() {
        let (_transport, remote) = MemoryTransport::pair("loopback");
        assert!(!remote.notify(MessageBody::new(message_type::ACK_ACK)));
    }

    #[tokio::test]
    async fn test_send_after_remote_dropped() {
        let (transport, remote) = MemoryTransport::pair("loopback");
        drop(remote);
        let result = transport
            .send_frame(Envelope::new(MessageBody::new(message_type::UAV_VER)))
            .await;
        assert!(result.is_err());
    }
}
