mod fleet;
mod session;

use fleet::{FleetResponder, SimConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:5000".to_string());
    let responder = Arc::new(FleetResponder::new(SimConfig::default()));

    let listener = TcpListener::bind(&addr).await?;
    info!("Fleet simulator listening on {}", addr);

    loop {
        let (socket, peer) = listener.accept().await?;
        info!("Connection from: {}", peer);

        let responder = responder.clone();
        tokio::spawn(async move {
            if let Err(e) = session::serve(socket, peer, responder).await {
                warn!("Session with {} ended with error: {}", peer, e);
            }
        });
    }
}
