pub mod bridge;
pub mod handshake;

use crate::context::AppContext;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Start the WebSocket bridge listener with graceful shutdown support.
pub async fn start_ws_bridge(
    listen_addr: &str,
    ctx: Arc<AppContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "WebSocket bridge listening");

    let semaphore = Arc::new(Semaphore::new(ctx.config.limits.max_connections as usize));

    loop {
        let stream = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _peer)) => stream,
                    Err(e) => {
                        error!(error = %e, "WebSocket bridge accept error");
                        continue;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("WebSocket bridge shutting down (no new connections)");
                break;
            }
        };

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("WebSocket bridge connection limit reached, dropping connection");
                drop(stream);
                continue;
            }
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = bridge::handle_connection(stream, ctx).await {
                error!(error = %e, "WebSocket bridge connection error");
            }
        });
    }

    Ok(())
}
