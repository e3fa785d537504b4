//! Connection manager with persistent connections and automatic reconnection

use crate::hub::MessageHub;
use crate::transport::TcpTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connected and attached to the hub
    Connected { address: String },
    /// Connection lost; the hub has been detached
    Disconnected { reason: String },
    /// A connection attempt failed; another follows after the backoff delay
    ConnectionFailed { reason: String },
}

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Fleet server address
    pub server_addr: String,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:5000".into(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Keeps the hub connected to the fleet server
///
/// Every successful connection attaches a fresh transport to the hub, and
/// every lost connection detaches it, so requests sent over a dead link are
/// rejected instead of waiting for their timeout.
pub struct ConnectionManager {
    config: ConnectionConfig,
    event_rx: mpsc::Receiver<ConnectionEvent>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create a connection manager and start the connection loop
    pub fn start(config: ConnectionConfig, hub: MessageHub) -> Self {
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(connection_loop(
            config.clone(),
            hub,
            event_tx,
            shutdown.clone(),
        ));

        Self {
            config,
            event_rx,
            shutdown,
            task,
        }
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    pub fn server_addr(&self) -> &str {
        &self.config.server_addr
    }

    /// Stop reconnecting and detach from the hub
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("Connection loop ended abnormally: {}", e);
        }
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    config: ConnectionConfig,
    hub: MessageHub,
    event_tx: mpsc::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        let attempt = tokio::select! {
            _ = shutdown.cancelled() => break,
            attempt = timeout(config.connect_timeout, TcpTransport::connect(&config.server_addr)) => attempt,
        };

        match attempt {
            Ok(Ok((transport, mut io))) => {
                // Connected successfully
                reconnect_delay = config.reconnect_delay;
                info!("Connected to {}", config.server_addr);
                hub.attach(Arc::new(transport));
                let _ = event_tx
                    .send(ConnectionEvent::Connected {
                        address: config.server_addr.clone(),
                    })
                    .await;

                let reason = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    result = &mut io => Some(match result {
                        Ok(Ok(())) => "connection closed".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => format!("I/O task failed: {}", e),
                    }),
                };
                hub.detach();

                let Some(reason) = reason else {
                    io.abort();
                    break;
                };
                warn!("Disconnected from {}: {}", config.server_addr, reason);
                let _ = event_tx.send(ConnectionEvent::Disconnected { reason }).await;
            }
            Ok(Err(e)) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: e.to_string(),
                    })
                    .await;
            }
            Err(_) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: format!("timed out after {:?}", config.connect_timeout),
                    })
                    .await;
            }
        }

        // Wait before reconnecting
        debug!("Reconnecting in {:?}", reconnect_delay);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }

        // Exponential backoff
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }

    debug!("Connection loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use tokio::net::TcpListener;

    fn config(server_addr: String) -> ConnectionConfig {
        ConnectionConfig {
            server_addr,
            reconnect_delay: Duration::from_millis(20),
            max_reconnect_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_attach_and_detach_follow_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hub = MessageHub::new(HubConfig::default());
        let mut manager = ConnectionManager::start(config(addr.clone()), hub.clone());

        let (socket, _) = listener.accept().await.unwrap();
        assert_eq!(
            manager.recv().await,
            Some(ConnectionEvent::Connected { address: addr })
        );
        assert!(hub.is_attached());

        drop(socket);
        assert!(matches!(
            manager.recv().await,
            Some(ConnectionEvent::Disconnected { .. })
        ));
        assert!(!hub.is_attached());

        // Reconnects after the backoff delay
        let (_socket, _) = listener.accept().await.unwrap();
        assert!(matches!(
            manager.recv().await,
            Some(ConnectionEvent::Connected { .. })
        ));

        manager.shutdown().await;
        assert!(!hub.is_attached());
    }

    #[tokio::test]
    async fn test_failed_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let hub = MessageHub::new(HubConfig::default());
        let mut manager = ConnectionManager::start(config(addr), hub.clone());

        assert!(matches!(
            manager.recv().await,
            Some(ConnectionEvent::ConnectionFailed { .. })
        ));
        assert!(!hub.is_attached());
        manager.shutdown().await;
    }

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert!(config.reconnect_delay < config.max_reconnect_delay);
    }
}
