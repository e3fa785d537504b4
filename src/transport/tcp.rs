//! TCP transport: length-prefixed JSON frames over a stream socket

use crate::transport::traits::{FrameHandler, Transport};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fleet_shared::{codec, codec::FrameDecoder, Envelope};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Outbound frames buffered before `send_frame` starts waiting on the socket
const OUTBOUND_CAPACITY: usize = 100;

/// Transport over a connected TCP stream
///
/// A background I/O task owns the socket: it writes queued outbound frames
/// and decodes incoming bytes into envelopes for the registered handler.
pub struct TcpTransport {
    name: String,
    outbound_tx: mpsc::Sender<Envelope>,
    handler: Arc<Mutex<Option<FrameHandler>>>,
}

impl TcpTransport {
    /// Connect to `address`
    ///
    /// Returns the transport and the I/O task handle; the task finishes with
    /// the reason the connection ended.
    pub async fn connect(address: &str) -> Result<(Self, JoinHandle<Result<()>>)> {
        let stream = TcpStream::connect(address).await?;
        Ok(Self::spawn(stream, address))
    }

    /// Wrap an already connected stream and start its I/O task
    pub fn spawn(stream: TcpStream, name: impl Into<String>) -> (Self, JoinHandle<Result<()>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_CAPACITY);
        let handler: Arc<Mutex<Option<FrameHandler>>> = Arc::new(Mutex::new(None));

        let io = tokio::spawn(run_io(stream, outbound_rx, handler.clone()));

        let transport = Self {
            name: name.into(),
            outbound_tx,
            handler,
        };

        (transport, io)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_frame(&self, envelope: Envelope) -> Result<()> {
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| anyhow!("Connection {} closed", self.name))
    }

    fn on_frame(&self, handler: FrameHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Pump frames between the socket and the transport until either side closes
async fn run_io(
    stream: TcpStream,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    handler: Arc<Mutex<Option<FrameHandler>>>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(envelope) => {
                        let encoded = codec::encode(&envelope)?;
                        writer.write_all(&encoded).await?;
                    }
                    None => {
                        // Every transport handle is gone
                        writer.shutdown().await?;
                        return Ok(());
                    }
                }
            }

            result = reader.read(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    return Err(anyhow!("Server closed connection"));
                }

                decoder.extend(&read_buf[..n]);

                loop {
                    match decoder.decode_next() {
                        Ok(Some(envelope)) => {
                            let current = handler.lock().clone();
                            match current {
                                Some(handler) => handler(envelope),
                                None => debug!(kind = envelope.kind(), "Dropping frame, no handler registered"),
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!("Undecodable frame: {}", e);
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }
}
