//! Transport trait abstraction for pluggable message channels

use anyhow::Result;
use async_trait::async_trait;
use fleet_shared::Envelope;
use std::sync::Arc;

/// Callback receiving every frame the transport reads from the remote end
pub type FrameHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// A bidirectional, message-oriented channel to the fleet server
///
/// Implementations deliver incoming frames, in arrival order, to the single
/// handler registered through [`Transport::on_frame`]. Registering a new
/// handler replaces the previous one.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hand a frame to the remote end
    async fn send_frame(&self, envelope: Envelope) -> Result<()>;

    /// Register the handler that receives incoming frames
    fn on_frame(&self, handler: FrameHandler);

    /// Human-readable name for this transport
    fn name(&self) -> &str;
}
